//! In-process connector
//!
//! Opens channels straight into an engine running in the same process,
//! going through the same admission and per-connection task as a socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use fleet_core::memory::channel_pair;
use fleet_core::traits::{Channel, Connector};
use fleet_core::{AgentIdentity, ConnectionError};

use super::handler::{admit, serve_channel, Rejection};
use crate::state::EngineState;

const LOCAL_CHANNEL_CAPACITY: usize = 64;

/// Connector for an engine in the same process
pub struct LocalConnector {
    state: Arc<EngineState>,
    reachable: AtomicBool,
}

impl LocalConnector {
    /// Create a connector into `state`'s engine
    pub fn new(state: Arc<EngineState>) -> Self {
        Self {
            state,
            reachable: AtomicBool::new(true),
        }
    }

    /// Make subsequent opens fail with a network error (or succeed again)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn open(&self, identity: &AgentIdentity) -> Result<Box<dyn Channel>, ConnectionError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ConnectionError::Network("engine unreachable".to_string()));
        }

        admit(&self.state, &identity.handshake())
            .await
            .map_err(|rejection| match rejection {
                Rejection::Unauthorized => ConnectionError::AuthenticationFailed,
                Rejection::AtCapacity => {
                    ConnectionError::Network("engine at capacity".to_string())
                }
            })?;

        let (agent_end, engine_end) = channel_pair(LOCAL_CHANNEL_CAPACITY);
        tokio::spawn(serve_channel(
            Arc::clone(&self.state),
            identity.id.clone(),
            Box::new(engine_end),
        ));

        Ok(Box::new(agent_end))
    }

    fn endpoint(&self) -> &str {
        "local"
    }
}
