//! HTTP listener
//!
//! Serves the agent endpoint and the admin routes on one address.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use fleet_protocol::{Handshake, AGENT_PATH, MAX_FRAME_SIZE};

use super::channel::WsChannel;
use super::handler::{admit, serve_channel, Rejection};
use crate::admin;
use crate::state::EngineState;

/// The engine's network front end
pub struct EngineServer {
    /// Shared engine state
    state: Arc<EngineState>,
}

impl EngineServer {
    /// Create a new server
    pub fn new(state: Arc<EngineState>) -> Self {
        Self { state }
    }

    /// Build the router: `/agent` plus the admin routes
    pub fn router(&self) -> Router {
        Router::new()
            .route(AGENT_PATH, get(agent_upgrade))
            .merge(admin::routes())
            .with_state(Arc::clone(&self.state))
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let bind_addr = &self.state.config.bind_address;
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Engine listening on {} (agents at {})", local_addr, AGENT_PATH);

        let shutdown = self.state.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("Server error")?;

        tracing::info!("Engine listener stopped");
        Ok(())
    }
}

/// Authenticate, then upgrade
///
/// Credentials are checked before the upgrade is accepted, so a rejected
/// agent never gets a channel.
async fn agent_upgrade(
    State(state): State<Arc<EngineState>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let handshake =
        match Handshake::from_lookup(|name| headers.get(name).and_then(|v| v.to_str().ok())) {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::warn!("Rejected upgrade: {}", e);
                return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
            }
        };

    match admit(&state, &handshake).await {
        Ok(()) => {}
        Err(Rejection::Unauthorized) => {
            return (StatusCode::UNAUTHORIZED, "invalid agent credentials").into_response();
        }
        Err(Rejection::AtCapacity) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
        }
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let agent_id = handshake.agent_id;
    // Oversized messages under the frame bound are rejected by the codec
    ws.max_message_size(MAX_FRAME_SIZE)
        .max_frame_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| serve_channel(state, agent_id, Box::new(WsChannel::new(socket))))
}
