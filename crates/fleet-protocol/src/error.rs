//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding protocol messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Message body exceeds the maximum size
    #[error("Message too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Message body is not valid JSON or does not match any message type
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Binary frame that is not valid UTF-8
    #[error("Message is not valid UTF-8")]
    InvalidEncoding,

    /// Required handshake metadata is missing or empty
    #[error("Missing handshake field: {0}")]
    MissingHandshakeField(&'static str),

    /// Handshake declared a client type other than an agent
    #[error("Unsupported client type: {0}")]
    UnsupportedClientType(String),
}
