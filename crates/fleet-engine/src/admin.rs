//! Admin HTTP routes
//!
//! Read-only views of the registry, command dispatch through the
//! correlator, and issue/revoke against the live credential store. Served on
//! the same listener as the agent endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use fleet_core::{AgentIdentity, CommandError, FleetError};
use fleet_protocol::{AgentId, CommandResult, HeartbeatStatus};

use crate::connection::AgentConnection;
use crate::state::EngineState;

/// Admin routes over the shared engine state
pub fn routes() -> Router<Arc<EngineState>> {
    Router::new()
        .route("/agents", get(list_agents))
        .route("/agents/:id", get(get_agent))
        .route("/agents/:id/commands", post(send_command))
        .route("/commands", post(broadcast_command))
        .route("/keys", post(issue_key))
        .route("/keys/:id", delete(revoke_key))
}

/// Connected agent as shown by the admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub agent_id: AgentId,
    pub connection_id: u64,
    pub established_at: u64,
    pub last_heartbeat_at: Option<u64>,
    pub status: Option<HeartbeatStatus>,
    pub system_info: Option<Value>,
}

impl From<&AgentConnection> for AgentSummary {
    fn from(connection: &AgentConnection) -> Self {
        let report = connection.last_report();
        Self {
            agent_id: connection.agent_id.clone(),
            connection_id: connection.connection_id,
            established_at: connection.established_at,
            last_heartbeat_at: connection.last_heartbeat_at(),
            status: report.as_ref().map(|r| r.status),
            system_info: report.map(|r| r.system_info),
        }
    }
}

/// Body of a command request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandBody {
    /// Opaque payload for the agent's executor
    pub command: Value,
    /// Deadline override in seconds
    pub timeout_secs: Option<u64>,
}

/// Per-agent outcome of a broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastOutcome {
    pub agent_id: AgentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

enum ApiError {
    Command(CommandError),
    Credentials(FleetError),
    UnknownKey(AgentId),
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        ApiError::Command(e)
    }
}

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        ApiError::Credentials(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Command(e) => {
                let status = match &e {
                    CommandError::AgentNotConnected(_) => StatusCode::NOT_FOUND,
                    CommandError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    CommandError::ConnectionLost { .. } => StatusCode::BAD_GATEWAY,
                    CommandError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                    CommandError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
                    CommandError::StaleResult(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
            ApiError::Credentials(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ApiError::UnknownKey(id) => (StatusCode::NOT_FOUND, format!("Unknown agent key: {}", id)),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn list_agents(State(state): State<Arc<EngineState>>) -> Json<Vec<AgentSummary>> {
    let mut agents: Vec<AgentSummary> = state
        .registry
        .all()
        .iter()
        .map(|c| AgentSummary::from(c.as_ref()))
        .collect();
    agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    Json(agents)
}

async fn get_agent(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<String>,
) -> Result<Json<AgentSummary>, ApiError> {
    let agent_id = AgentId::new(id);
    state
        .registry
        .lookup(&agent_id)
        .map(|c| Json(AgentSummary::from(c.as_ref())))
        .ok_or(ApiError::Command(CommandError::AgentNotConnected(agent_id)))
}

async fn send_command(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<String>,
    Json(body): Json<CommandBody>,
) -> Result<Json<CommandResult>, ApiError> {
    let agent_id = AgentId::new(id);
    let timeout = body
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.correlator.default_timeout());

    let pending = state
        .correlator
        .send_with_timeout(&agent_id, body.command, timeout)
        .await?;
    let result = pending.wait().await?;
    Ok(Json(result))
}

/// Issue a new identity; the secret appears only in this response
async fn issue_key(
    State(state): State<Arc<EngineState>>,
) -> Result<(StatusCode, Json<AgentIdentity>), ApiError> {
    let identity = state.credentials.issue().await?;
    Ok((StatusCode::CREATED, Json(identity)))
}

/// Revoke an identity
///
/// Live connections are left alone; the next authentication fails.
async fn revoke_key(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let agent_id = AgentId::new(id);
    if state.credentials.revoke(&agent_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::UnknownKey(agent_id))
    }
}

async fn broadcast_command(
    State(state): State<Arc<EngineState>>,
    Json(body): Json<CommandBody>,
) -> Json<Vec<BroadcastOutcome>> {
    let sent = state.correlator.broadcast(body.command).await;
    tracing::info!("Broadcast command to {} agent(s)", sent.len());

    let waits = sent.into_iter().map(|(agent_id, pending)| async move {
        let outcome = match pending {
            Ok(pending) => pending.wait().await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(result) => BroadcastOutcome {
                agent_id,
                result: Some(result),
                error: None,
            },
            Err(e) => BroadcastOutcome {
                agent_id,
                result: None,
                error: Some(e.to_string()),
            },
        }
    });

    let mut outcomes = futures::future::join_all(waits).await;
    outcomes.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    Json(outcomes)
}
