//! Session registry
//!
//! The engine's table of live agent connections. The registry holds a
//! handle to each connection (its outbound queue and close signal); the
//! channel itself is owned by the task serving it.
//!
//! # Atomicity
//!
//! `register` and `unregister` are single operations on the concurrent map,
//! so they are atomic with respect to each other for the same agent ID.
//! Operations on different IDs only touch their own shard, except
//! [`SessionRegistry::register_within`], which serialises capacity-checked
//! registrations so a connection limit cannot be overshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use fleet_core::time::current_time_millis;
use fleet_core::ConnectionError;
use fleet_protocol::{AgentId, HeartbeatReport, Message};

/// Unique ID of one accepted channel, distinguishing reconnects of one agent
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Latest heartbeat seen on a connection
#[derive(Debug, Default)]
struct HeartbeatSlot {
    last_at: Option<u64>,
    report: Option<HeartbeatReport>,
}

/// Handle to one live agent connection
#[derive(Debug)]
pub struct AgentConnection {
    /// Authenticated agent identity
    pub agent_id: AgentId,
    /// Unique ID of this channel
    pub connection_id: ConnectionId,
    /// When the channel was accepted (Unix millis)
    pub established_at: u64,
    /// Queue drained by the task that owns the channel
    outbound: mpsc::Sender<Message>,
    /// Fired to make the owning task close the channel
    cancel: CancellationToken,
    heartbeat: Mutex<HeartbeatSlot>,
    last_activity: Mutex<Instant>,
}

impl AgentConnection {
    /// Create a handle for a freshly accepted channel
    pub fn new(agent_id: AgentId, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            agent_id,
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            established_at: current_time_millis(),
            outbound,
            cancel: CancellationToken::new(),
            heartbeat: Mutex::new(HeartbeatSlot::default()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Queue a message for the agent, waiting for queue space
    pub async fn send(&self, message: Message) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Queue a message for the agent without waiting
    pub fn try_send(&self, message: Message) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.outbound
            .try_send(message)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    ConnectionError::Network("outbound queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
            })
    }

    /// Ask the owning task to close the channel
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether close has been requested
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once close has been requested
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Record a heartbeat report
    ///
    /// Reports older than the last accepted one are rejected, so the
    /// observed heartbeat time never decreases for this connection.
    pub fn record_heartbeat(&self, report: HeartbeatReport) -> bool {
        let mut slot = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = slot.last_at {
            if report.timestamp < last {
                tracing::warn!(
                    "Out-of-order heartbeat from {}: {} < {}",
                    self.agent_id,
                    report.timestamp,
                    last
                );
                return false;
            }
        }
        slot.last_at = Some(report.timestamp);
        slot.report = Some(report);
        true
    }

    /// Timestamp of the latest accepted heartbeat
    pub fn last_heartbeat_at(&self) -> Option<u64> {
        self.heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_at
    }

    /// Latest accepted heartbeat report
    pub fn last_report(&self) -> Option<HeartbeatReport> {
        self.heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .report
            .clone()
    }

    /// Note inbound traffic on the channel
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last inbound traffic
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// Registry of live connections, one per agent ID
pub struct SessionRegistry {
    /// Connections indexed by agent ID
    connections: DashMap<AgentId, Arc<AgentConnection>>,
    /// Held across the count-then-insert of bounded registrations
    admission: Mutex<()>,
}

impl SessionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            admission: Mutex::new(()),
        }
    }

    /// Register a connection, superseding and closing any previous entry
    /// for the same agent. Returns the effective connection.
    pub fn register(&self, connection: AgentConnection) -> Arc<AgentConnection> {
        let connection = Arc::new(connection);
        let previous = self
            .connections
            .insert(connection.agent_id.clone(), Arc::clone(&connection));

        match previous {
            Some(previous) => {
                tracing::info!(
                    "Agent {} reconnected: connection {} supersedes {}",
                    connection.agent_id,
                    connection.connection_id,
                    previous.connection_id
                );
                previous.close();
            }
            None => {
                tracing::info!(
                    "Agent {} registered (connection {})",
                    connection.agent_id,
                    connection.connection_id
                );
            }
        }

        connection
    }

    /// Register unless that would take the registry past `max` agents
    ///
    /// An agent that already has an entry may always replace it. On refusal
    /// the connection is handed back untouched.
    pub fn register_within(
        &self,
        connection: AgentConnection,
        max: usize,
    ) -> Result<Arc<AgentConnection>, AgentConnection> {
        let _admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
        let replacing = self.connections.contains_key(&connection.agent_id);
        if !replacing && self.connections.len() >= max {
            return Err(connection);
        }
        Ok(self.register(connection))
    }

    /// Get the live connection for an agent
    pub fn lookup(&self, agent_id: &AgentId) -> Option<Arc<AgentConnection>> {
        self.connections.get(agent_id).map(|r| Arc::clone(&r))
    }

    /// Remove an agent's entry, but only if it still refers to `connection_id`
    ///
    /// A channel that closes after being superseded must not remove the
    /// newer connection. Returns whether an entry was removed.
    pub fn unregister(&self, agent_id: &AgentId, connection_id: ConnectionId) -> bool {
        let removed = self
            .connections
            .remove_if(agent_id, |_, current| current.connection_id == connection_id);

        match removed {
            Some(_) => {
                tracing::info!(
                    "Agent {} unregistered (connection {})",
                    agent_id,
                    connection_id
                );
                true
            }
            None => {
                tracing::debug!(
                    "Ignoring stale close of connection {} for {}",
                    connection_id,
                    agent_id
                );
                false
            }
        }
    }

    /// List all live connections
    pub fn all(&self) -> Vec<Arc<AgentConnection>> {
        self.connections.iter().map(|r| Arc::clone(&r)).collect()
    }

    /// Queue a message on every live connection; returns how many accepted it
    pub fn broadcast(&self, message: &Message) -> usize {
        let mut delivered = 0;
        for connection in self.all() {
            match connection.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(
                    "Broadcast of {} to {} failed: {}",
                    message.kind(),
                    connection.agent_id,
                    e
                ),
            }
        }
        delivered
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
