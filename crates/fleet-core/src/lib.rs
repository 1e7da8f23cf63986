//! fleet-core: Core abstractions and configuration for the fleet agent channel
//!
//! This crate provides shared types, error taxonomy, collaborator traits and
//! configuration structures used by the engine and the agent.

pub mod config;
pub mod error;
pub mod memory;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{ChannelError, CommandError, ConnectionError, ExecutorError, FleetError};
pub use types::{AgentIdentity, ConnectionState};
