//! Core error types for the fleet agent channel

use std::path::PathBuf;
use std::time::Duration;

use fleet_protocol::{AgentId, CommandId, ProtocolError};
use thiserror::Error;

/// Top-level error type
#[derive(Error, Debug)]
pub enum FleetError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Command error
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Credential store error
    #[error("Credential store error: {0}")]
    Credentials(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while opening or using a channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The engine rejected the identity/secret pair
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Transient network failure (always retried)
    #[error("Network error: {0}")]
    Network(String),

    /// Connection attempt did not finish in time
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    /// The channel is closed
    #[error("Channel closed")]
    Closed,
}

impl ConnectionError {
    /// Whether the error came from a rejected identity
    pub fn is_auth(&self) -> bool {
        matches!(self, ConnectionError::AuthenticationFailed)
    }
}

/// Error surfaced while receiving from a channel
#[derive(Error, Debug)]
pub enum ChannelError {
    /// A malformed message; the channel itself is still usable
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The channel failed and must be torn down
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Failures visible to the issuer of a remote command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No live connection for the target agent
    #[error("Agent not connected: {0}")]
    AgentNotConnected(AgentId),

    /// No result arrived before the deadline
    #[error("Command {command_id} timed out after {after:?}")]
    Timeout { command_id: CommandId, after: Duration },

    /// The agent's connection went away before a result arrived
    #[error("Connection to {agent_id} lost before command {command_id} completed")]
    ConnectionLost {
        agent_id: AgentId,
        command_id: CommandId,
    },

    /// The encoded command is over the message size limit; nothing was sent
    #[error("Command payload is {size} bytes, over the {max} byte message limit")]
    PayloadTooLarge { size: usize, max: usize },

    /// The command could not be encoded; nothing was sent
    #[error("Command payload cannot be encoded: {0}")]
    InvalidPayload(String),

    /// A result for a command that is not outstanding (never raised to issuers)
    #[error("Stale result for command {0}")]
    StaleResult(CommandId),
}

/// Failure of a local command executor
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The payload is not something this executor understands
    #[error("Unsupported command: {0}")]
    Unsupported(String),

    /// The command ran and failed
    #[error("Command failed: {message}")]
    Failed {
        message: String,
        output: Option<serde_json::Value>,
    },

    /// The executor task panicked or was aborted
    #[error("Executor crashed: {0}")]
    Crashed(String),

    /// I/O error while running the command
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
