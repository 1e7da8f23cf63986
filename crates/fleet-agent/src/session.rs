//! Agent session
//!
//! Owns the agent's channel to the engine and drives the connection state
//! machine:
//!
//! ```text
//! disconnected -> connecting -> connected -> disconnected -> (retry) ...
//!                     |                           ^
//!                     +------- open failed -------+
//! ```
//!
//! While connected the session announces itself, sends a first heartbeat
//! after a short grace delay and then one per interval, answers pings, and
//! runs pushed commands concurrently. Every timer lives inside the task that
//! serves the connection, so leaving the connected state tears all of them
//! down before a retry is scheduled.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use fleet_core::config::SessionTimings;
use fleet_core::time::MonotonicMillis;
use fleet_core::traits::{Channel, CommandExecutor, Connector};
use fleet_core::{AgentIdentity, ChannelError, ConnectionError, ConnectionState, ExecutorError};
use fleet_protocol::{
    AgentId, CommandId, CommandRequest, CommandResult, HeartbeatReport, HeartbeatStatus, Message,
    ProtocolError,
};

use crate::metrics::MetricsCollector;
use crate::transport::{FixedDelay, ReconnectSupervisor};

/// Produces the `systemInfo` blob for each heartbeat
pub type SystemInfoFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Results waiting to be written to the channel
const RESULT_QUEUE_CAPACITY: usize = 64;

/// Upper bound on the best-effort offline report sent by `stop`
const OFFLINE_REPORT_TIMEOUT: Duration = Duration::from_secs(1);

/// How a connected period ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServeEnd {
    Stopped,
    Lost,
}

struct SessionInner {
    identity: AgentIdentity,
    connector: Arc<dyn Connector>,
    executor: Arc<dyn CommandExecutor>,
    timings: SessionTimings,
    system_info: SystemInfoFn,
    state: watch::Sender<ConnectionState>,
    stop: CancellationToken,
    supervisor: ReconnectSupervisor,
}

/// One agent's connection to the engine
pub struct AgentSession {
    inner: Arc<SessionInner>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AgentSession {
    /// Create a session reporting host metrics in its heartbeats
    pub fn new(
        identity: AgentIdentity,
        connector: Arc<dyn Connector>,
        executor: Arc<dyn CommandExecutor>,
        timings: SessionTimings,
    ) -> Self {
        let collector = MetricsCollector::new();
        Self::with_system_info(
            identity,
            connector,
            executor,
            timings,
            Arc::new(move || collector.collect().to_value()),
        )
    }

    /// Create a session with a custom `systemInfo` source
    pub fn with_system_info(
        identity: AgentIdentity,
        connector: Arc<dyn Connector>,
        executor: Arc<dyn CommandExecutor>,
        timings: SessionTimings,
        system_info: SystemInfoFn,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(SessionInner {
                identity,
                connector,
                executor,
                timings,
                system_info,
                state,
                stop: CancellationToken::new(),
                supervisor: ReconnectSupervisor::new(FixedDelay::new(timings.reconnect_delay)),
            }),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Agent identity of this session
    pub fn agent_id(&self) -> &AgentId {
        &self.inner.identity.id
    }

    /// Open the channel and keep it open until [`stop`](Self::stop)
    ///
    /// The first open runs before this returns. If the engine rejects the
    /// identity on that first attempt the session does not start and the
    /// error is returned. Any other failure hands over to the reconnection
    /// supervisor. Calling `start` on a running session does nothing.
    pub async fn start(&self) -> Result<(), ConnectionError> {
        if self.inner.stop.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("Session for {} already started", self.agent_id());
            return Ok(());
        }

        let channel = match self.inner.open().await {
            Ok(channel) => Some(channel),
            Err(e) if e.is_auth() => {
                tracing::error!(
                    "Engine at {} rejected credentials for {}",
                    self.inner.connector.endpoint(),
                    self.agent_id()
                );
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
            Err(ConnectionError::Closed) if self.inner.stop.is_cancelled() => {
                return Err(ConnectionError::Closed);
            }
            Err(e) => {
                tracing::warn!("Initial connection for {} failed: {}", self.agent_id(), e);
                None
            }
        };

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(inner.run(channel));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Stop the session for good
    ///
    /// Cancels timers, aborts an in-flight open, sends a final offline
    /// status if connected, closes the channel and suppresses reconnection.
    pub async fn stop(&self) {
        self.inner.stop.cancel();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Session task for {} ended abnormally: {}", self.agent_id(), e);
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Run one command through the executor
    pub async fn dispatch(&self, request: CommandRequest) -> CommandResult {
        dispatch(self.inner.executor.as_ref(), &self.inner.identity.id, request).await
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Reconnection attempts since the last successful open
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.supervisor.attempts()
    }
}

impl SessionInner {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!("Session {}: {} -> {}", self.identity.id, previous, next);
        }
    }

    /// One bounded, cancellable open attempt
    async fn open(&self) -> Result<Box<dyn Channel>, ConnectionError> {
        self.set_state(ConnectionState::Connecting);

        let timeout = self.timings.connect_timeout;
        let result = tokio::select! {
            _ = self.stop.cancelled() => Err(ConnectionError::Closed),
            opened = tokio::time::timeout(timeout, self.connector.open(&self.identity)) => {
                opened.unwrap_or_else(|_| Err(ConnectionError::Timeout(timeout)))
            }
        };

        match &result {
            Ok(_) => {
                self.supervisor.reset();
                self.set_state(ConnectionState::Connected);
                tracing::info!(
                    "Connected to {} as {}",
                    self.connector.endpoint(),
                    self.identity.id
                );
            }
            Err(_) => self.set_state(ConnectionState::Disconnected),
        }
        result
    }

    async fn run(self: Arc<Self>, mut channel: Option<Box<dyn Channel>>) {
        let mut clock = MonotonicMillis::new();

        loop {
            if let Some(open) = channel.take() {
                let end = self.serve(open, &mut clock).await;
                self.set_state(ConnectionState::Disconnected);
                if end == ServeEnd::Stopped {
                    break;
                }
            }

            if self.stop.is_cancelled() {
                break;
            }

            let Some(retry) = self.supervisor.try_schedule() else {
                // Someone else holds the retry slot; wait one delay and ask again
                let delay = self.supervisor.delay();
                tracing::error!(
                    "Reconnect for {} already pending; checking again in {:?}",
                    self.identity.id,
                    delay
                );
                tokio::select! {
                    _ = self.stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            };
            tracing::info!(
                "Reconnecting {} in {:?} (attempt {})",
                self.identity.id,
                retry.delay,
                retry.attempt
            );

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = retry.wait() => {}
            }

            match self.open().await {
                Ok(open) => channel = Some(open),
                Err(ConnectionError::Closed) if self.stop.is_cancelled() => break,
                Err(e) if e.is_auth() => {
                    tracing::warn!("Engine rejected credentials for {}", self.identity.id);
                }
                Err(e) => {
                    tracing::warn!("Connection attempt for {} failed: {}", self.identity.id, e);
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Session for {} stopped", self.identity.id);
    }

    fn report(&self, clock: &mut MonotonicMillis, status: HeartbeatStatus) -> HeartbeatReport {
        HeartbeatReport {
            agent_id: self.identity.id.clone(),
            timestamp: clock.next(),
            status,
            system_info: (self.system_info)(),
        }
    }

    /// Serve one open channel until it is lost or the session stops
    async fn serve(&self, mut channel: Box<dyn Channel>, clock: &mut MonotonicMillis) -> ServeEnd {
        let agent_id = self.identity.id.clone();

        let announce = Message::AgentConnected {
            agent_id: agent_id.clone(),
        };
        if let Err(e) = channel.send(announce).await {
            tracing::warn!("Announce for {} failed: {}", agent_id, e);
            if is_fatal(&e) {
                channel.close().await;
                return ServeEnd::Lost;
            }
        }

        let first_heartbeat = Instant::now() + self.timings.announce_grace;
        let mut heartbeat = tokio::time::interval_at(first_heartbeat, self.timings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (results_tx, mut results_rx) = mpsc::channel::<CommandResult>(RESULT_QUEUE_CAPACITY);
        let mut inflight = JoinSet::new();

        let end = loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    let offline = Message::StatusUpdate(self.report(clock, HeartbeatStatus::Offline));
                    match tokio::time::timeout(OFFLINE_REPORT_TIMEOUT, channel.send(offline)).await {
                        Ok(Ok(())) => tracing::debug!("Sent offline status for {}", agent_id),
                        _ => tracing::debug!("Could not send offline status for {}", agent_id),
                    }
                    break ServeEnd::Stopped;
                }

                _ = heartbeat.tick() => {
                    let update = Message::StatusUpdate(self.report(clock, HeartbeatStatus::Online));
                    if let Err(e) = channel.send(update).await {
                        tracing::warn!("Heartbeat for {} failed: {}", agent_id, e);
                        if is_fatal(&e) {
                            break ServeEnd::Lost;
                        }
                    }
                }

                Some(result) = results_rx.recv() => {
                    let command_id = result.command_id.clone();
                    let sent = match channel.send(Message::CommandResult(result)).await {
                        Err(ChannelError::Protocol(e)) => {
                            tracing::warn!("Result for {} cannot be sent: {}", command_id, e);
                            let failure = undeliverable(&agent_id, command_id.clone(), &e);
                            channel.send(Message::CommandResult(failure)).await
                        }
                        other => other,
                    };
                    if let Err(e) = sent {
                        tracing::warn!("Could not return result for {}: {}", command_id, e);
                        if is_fatal(&e) {
                            break ServeEnd::Lost;
                        }
                    }
                }

                Some(joined) = inflight.join_next() => {
                    if let Err(e) = joined {
                        if !e.is_cancelled() {
                            tracing::error!("Command task for {} failed: {}", agent_id, e);
                        }
                    }
                }

                inbound = channel.recv() => match inbound {
                    None => {
                        tracing::info!("Engine closed the channel for {}", agent_id);
                        break ServeEnd::Lost;
                    }
                    Some(Err(ChannelError::Connection(e))) => {
                        tracing::warn!("Channel for {} failed: {}", agent_id, e);
                        break ServeEnd::Lost;
                    }
                    Some(Err(ChannelError::Protocol(e))) => {
                        tracing::warn!("Dropping malformed message for {}: {}", agent_id, e);
                    }
                    Some(Ok(Message::Ping)) => {
                        let pong = Message::Pong { agent_id: agent_id.clone() };
                        if let Err(e) = channel.send(pong).await {
                            tracing::warn!("Pong for {} failed: {}", agent_id, e);
                            if is_fatal(&e) {
                                break ServeEnd::Lost;
                            }
                        }
                    }
                    Some(Ok(Message::Command(request))) => {
                        tracing::debug!("Command {} received by {}", request.command_id, agent_id);
                        let executor = Arc::clone(&self.executor);
                        let agent_id = agent_id.clone();
                        let results = results_tx.clone();
                        inflight.spawn(async move {
                            let result = dispatch(executor.as_ref(), &agent_id, request).await;
                            let _ = results.send(result).await;
                        });
                    }
                    Some(Ok(other)) => {
                        tracing::warn!("Ignoring unexpected {} sent to {}", other.kind(), agent_id);
                    }
                },
            }
        };

        inflight.abort_all();
        channel.close().await;
        end
    }
}

/// Run one command and always produce exactly one result
///
/// Executor errors and panics become `success: false` with an error payload.
pub async fn dispatch(
    executor: &dyn CommandExecutor,
    agent_id: &AgentId,
    request: CommandRequest,
) -> CommandResult {
    let CommandRequest {
        command_id,
        command,
    } = request;

    let outcome = AssertUnwindSafe(executor.execute(command))
        .catch_unwind()
        .await;

    let (success, result) = match outcome {
        Ok(Ok(value)) => (true, value),
        Ok(Err(e)) => {
            tracing::warn!("Command {} failed: {}", command_id, e);
            (false, error_payload(e))
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("Executor panicked on command {}: {}", command_id, message);
            (false, error_payload(ExecutorError::Crashed(message)))
        }
    };

    CommandResult {
        agent_id: agent_id.clone(),
        command_id,
        result,
        success,
    }
}

/// Only a failed channel ends the connection; an unencodable message does not
fn is_fatal(error: &ChannelError) -> bool {
    matches!(error, ChannelError::Connection(_))
}

/// Stand-in for a result the channel refused to carry
fn undeliverable(agent_id: &AgentId, command_id: CommandId, error: &ProtocolError) -> CommandResult {
    CommandResult {
        agent_id: agent_id.clone(),
        command_id,
        result: json!({ "error": format!("result not delivered: {}", error) }),
        success: false,
    }
}

fn error_payload(error: ExecutorError) -> Value {
    match error {
        ExecutorError::Failed { message, output } => json!({
            "error": message,
            "output": output,
        }),
        other => json!({ "error": other.to_string() }),
    }
}
