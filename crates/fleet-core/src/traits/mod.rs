//! Core trait definitions

mod credentials;
mod executor;
mod transport;

pub use credentials::CredentialStore;
pub use executor::CommandExecutor;
pub use transport::{Channel, Connector};
