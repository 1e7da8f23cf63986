//! Agent authentication
//!
//! Agents authenticate with an identity/secret pair presented in the
//! upgrade request headers. The engine only ever stores secret digests.

mod keys;

pub use keys::KeyStore;
