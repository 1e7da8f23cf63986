//! Credential store collaborator

use async_trait::async_trait;

use crate::error::FleetError;
use crate::types::AgentIdentity;
use fleet_protocol::AgentId;

/// Holds agent identity to secret mappings
///
/// Revoking an identity does not touch connections that are already
/// established; it takes effect at the agent's next authentication.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Check an identity/secret pair
    async fn validate(&self, agent_id: &AgentId, secret_key: &str) -> bool;

    /// Issue a new identity; the returned secret is never retrievable again
    async fn issue(&self) -> Result<AgentIdentity, FleetError>;

    /// Remove an identity; returns whether it existed
    async fn revoke(&self, agent_id: &AgentId) -> Result<bool, FleetError>;
}
