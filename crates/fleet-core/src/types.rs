//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

use fleet_protocol::{AgentId, Handshake};

/// Long-lived identity/secret pair of one agent
///
/// Issued once by the credential store. The secret is shown to the operator
/// at issuance and cannot be recovered afterwards, so `Debug` never prints it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    /// Agent identity
    pub id: AgentId,
    /// Secret key
    pub secret_key: String,
}

impl AgentIdentity {
    /// Create an identity from its parts
    pub fn new(id: impl Into<AgentId>, secret_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret_key: secret_key.into(),
        }
    }

    /// Handshake metadata presenting this identity
    pub fn handshake(&self) -> Handshake {
        Handshake::new(self.id.clone(), self.secret_key.clone())
    }
}

impl fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentIdentity")
            .field("id", &self.id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Connection state of an agent session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No channel; initial state, and the state between retries
    Disconnected,
    /// A channel open is in flight
    Connecting,
    /// The channel is open and heartbeats are flowing
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}
