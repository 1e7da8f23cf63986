//! Command correlation
//!
//! Every command sent to an agent gets a fresh `CommandId` and a pending
//! slot. A slot ends in exactly one way: the matching result arrives, the
//! deadline passes, or the connection it was sent on goes away. Whichever
//! comes first removes the slot, so anything arriving afterwards for the
//! same ID is a stale result and is only logged.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use fleet_core::CommandError;
use fleet_protocol::{codec, AgentId, CommandId, CommandRequest, CommandResult, Message, ProtocolError};

use crate::connection::{ConnectionId, SessionRegistry};

type Reply = Result<CommandResult, CommandError>;

/// An outstanding command
struct PendingSlot {
    agent_id: AgentId,
    connection_id: ConnectionId,
    reply: oneshot::Sender<Reply>,
    deadline: Option<AbortHandle>,
}

impl PendingSlot {
    fn settle(self, outcome: Reply) {
        if let Some(deadline) = self.deadline {
            deadline.abort();
        }
        // Issuer may have stopped waiting
        let _ = self.reply.send(outcome);
    }
}

/// What happened to an incoming result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Delivered to the waiting issuer
    Resolved,
    /// No matching outstanding command; discarded
    Stale,
}

/// Handle to a command awaiting its result
#[derive(Debug)]
pub struct PendingCommand {
    /// Correlation token sent to the agent
    pub command_id: CommandId,
    /// Target agent
    pub agent_id: AgentId,
    reply: oneshot::Receiver<Reply>,
}

impl PendingCommand {
    /// Wait for the result, the deadline, or connection loss
    pub async fn wait(self) -> Result<CommandResult, CommandError> {
        match self.reply.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CommandError::ConnectionLost {
                agent_id: self.agent_id,
                command_id: self.command_id,
            }),
        }
    }
}

/// Matches asynchronous command results to their requests
pub struct CommandCorrelator {
    registry: Arc<SessionRegistry>,
    pending: Arc<DashMap<CommandId, PendingSlot>>,
    default_timeout: Duration,
}

impl CommandCorrelator {
    /// Create a correlator dispatching through `registry`
    pub fn new(registry: Arc<SessionRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            pending: Arc::new(DashMap::new()),
            default_timeout,
        }
    }

    /// Send a command with the default deadline
    pub async fn send(
        &self,
        agent_id: &AgentId,
        payload: Value,
    ) -> Result<PendingCommand, CommandError> {
        self.send_with_timeout(agent_id, payload, self.default_timeout)
            .await
    }

    /// Send a command with an explicit deadline
    pub async fn send_with_timeout(
        &self,
        agent_id: &AgentId,
        payload: Value,
        timeout: Duration,
    ) -> Result<PendingCommand, CommandError> {
        let connection = self
            .registry
            .lookup(agent_id)
            .ok_or_else(|| CommandError::AgentNotConnected(agent_id.clone()))?;

        let command_id = CommandId::generate();
        let message = Message::Command(CommandRequest {
            command_id: command_id.clone(),
            command: payload,
        });
        // A command the channel cannot encode would otherwise fail the
        // serving task after it was queued
        if let Err(e) = codec::encode(&message) {
            tracing::warn!("Refusing command for {}: {}", agent_id, e);
            return Err(match e {
                ProtocolError::MessageTooLarge { size, max } => {
                    CommandError::PayloadTooLarge { size, max }
                }
                other => CommandError::InvalidPayload(other.to_string()),
            });
        }

        let (tx, rx) = oneshot::channel();

        // The slot must exist before the command can be answered
        self.pending.insert(
            command_id.clone(),
            PendingSlot {
                agent_id: agent_id.clone(),
                connection_id: connection.connection_id,
                reply: tx,
                deadline: None,
            },
        );

        let deadline = {
            let pending = Arc::clone(&self.pending);
            let command_id = command_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some((_, slot)) = pending.remove(&command_id) {
                    tracing::warn!(
                        "Command {} to {} timed out after {:?}",
                        command_id,
                        slot.agent_id,
                        timeout
                    );
                    slot.settle(Err(CommandError::Timeout {
                        command_id,
                        after: timeout,
                    }));
                }
            })
        };
        match self.pending.get_mut(&command_id) {
            Some(mut slot) => slot.deadline = Some(deadline.abort_handle()),
            None => deadline.abort(),
        }

        if let Err(e) = connection.send(message).await {
            tracing::warn!("Failed to send command {} to {}: {}", command_id, agent_id, e);
            if let Some((_, slot)) = self.pending.remove(&command_id) {
                if let Some(deadline) = slot.deadline {
                    deadline.abort();
                }
            }
            return Err(CommandError::ConnectionLost {
                agent_id: agent_id.clone(),
                command_id,
            });
        }

        tracing::debug!("Sent command {} to {}", command_id, agent_id);

        Ok(PendingCommand {
            command_id,
            agent_id: agent_id.clone(),
            reply: rx,
        })
    }

    /// Deliver a result received on connection `via`, authenticated as `from`
    ///
    /// The result only matches a slot whose command went out on that same
    /// connection, whatever `agentId` the message itself claims. A result
    /// replayed on a later connection of the same agent is stale.
    pub fn resolve(
        &self,
        from: &AgentId,
        via: ConnectionId,
        result: CommandResult,
    ) -> ResolveOutcome {
        if result.agent_id != *from {
            tracing::warn!(
                "Result for {} claims agent {} but arrived from {}",
                result.command_id,
                result.agent_id,
                from
            );
        }

        let command_id = result.command_id.clone();
        match self
            .pending
            .remove_if(&command_id, |_, slot| {
                slot.agent_id == *from && slot.connection_id == via
            })
        {
            Some((_, slot)) => {
                tracing::debug!(
                    "Command {} resolved by {} (success: {})",
                    command_id,
                    from,
                    result.success
                );
                slot.settle(Ok(result));
                ResolveOutcome::Resolved
            }
            None => {
                tracing::warn!(
                    "Discarding result from {}: {}",
                    from,
                    CommandError::StaleResult(command_id)
                );
                ResolveOutcome::Stale
            }
        }
    }

    /// Fail every command that was sent on a connection that has ended
    pub fn fail_connection(&self, connection_id: ConnectionId) -> usize {
        let lost: Vec<CommandId> = self
            .pending
            .iter()
            .filter(|entry| entry.connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0;
        for command_id in lost {
            if let Some((_, slot)) = self
                .pending
                .remove_if(&command_id, |_, slot| slot.connection_id == connection_id)
            {
                let agent_id = slot.agent_id.clone();
                slot.settle(Err(CommandError::ConnectionLost {
                    agent_id,
                    command_id,
                }));
                failed += 1;
            }
        }

        if failed > 0 {
            tracing::info!(
                "Failed {} outstanding command(s) on closed connection {}",
                failed,
                connection_id
            );
        }
        failed
    }

    /// Send the same payload to every connected agent
    pub async fn broadcast(
        &self,
        payload: Value,
    ) -> Vec<(AgentId, Result<PendingCommand, CommandError>)> {
        let mut sent = Vec::new();
        for connection in self.registry.all() {
            let agent_id = connection.agent_id.clone();
            let pending = self.send(&agent_id, payload.clone()).await;
            sent.push((agent_id, pending));
        }
        sent
    }

    /// Number of unresolved commands
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Default deadline applied by `send`
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::AgentConnection;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn setup(
        agent: &str,
    ) -> (
        CommandCorrelator,
        Arc<AgentConnection>,
        mpsc::Receiver<Message>,
    ) {
        let registry = Arc::new(SessionRegistry::new());
        let (tx, rx) = mpsc::channel(8);
        let conn = registry.register(AgentConnection::new(AgentId::new(agent), tx));
        let correlator = CommandCorrelator::new(registry, Duration::from_secs(30));
        (correlator, conn, rx)
    }

    fn result_for(agent: &str, command_id: &CommandId, value: Value) -> CommandResult {
        CommandResult {
            agent_id: AgentId::new(agent),
            command_id: command_id.clone(),
            result: value,
            success: true,
        }
    }

    async fn sent_command(rx: &mut mpsc::Receiver<Message>) -> CommandRequest {
        match rx.recv().await {
            Some(Message::Command(request)) => request,
            other => panic!("expected command, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_result_resolves_pending() {
        let (correlator, conn, mut rx) = setup("A1");
        let agent = AgentId::new("A1");

        let pending = correlator.send(&agent, json!("uptime")).await.unwrap();
        let request = sent_command(&mut rx).await;
        assert_eq!(request.command_id, pending.command_id);
        assert_eq!(request.command, json!("uptime"));

        let outcome = correlator.resolve(
            &agent,
            conn.connection_id,
            result_for("A1", &request.command_id, json!("up 3 days")),
        );
        assert_eq!(outcome, ResolveOutcome::Resolved);

        let result = pending.wait().await.unwrap();
        assert_eq!(result.result, json!("up 3 days"));
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_not_connected_fails_fast() {
        let (correlator, _conn, _rx) = setup("A1");
        let err = correlator
            .send(&AgentId::new("A2"), json!("x"))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::AgentNotConnected(AgentId::new("A2")));
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_result_is_stale() {
        let (correlator, conn, mut rx) = setup("A1");
        let agent = AgentId::new("A1");

        let pending = correlator
            .send_with_timeout(&agent, json!("slow"), Duration::from_secs(5))
            .await
            .unwrap();
        let request = sent_command(&mut rx).await;

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout { after, .. } if after == Duration::from_secs(5)));
        assert_eq!(correlator.outstanding(), 0);

        let outcome = correlator.resolve(
            &agent,
            conn.connection_id,
            result_for("A1", &request.command_id, json!("late")),
        );
        assert_eq!(outcome, ResolveOutcome::Stale);
    }

    #[tokio::test]
    async fn test_unknown_command_id_is_stale() {
        let (correlator, conn, _rx) = setup("A1");
        let outcome = correlator.resolve(
            &AgentId::new("A1"),
            conn.connection_id,
            result_for("A1", &CommandId::new("nope"), Value::Null),
        );
        assert_eq!(outcome, ResolveOutcome::Stale);
    }

    #[tokio::test]
    async fn test_result_accepted_once() {
        let (correlator, conn, mut rx) = setup("A1");
        let agent = AgentId::new("A1");

        let pending = correlator.send(&agent, json!("x")).await.unwrap();
        let request = sent_command(&mut rx).await;

        let first = result_for("A1", &request.command_id, json!(1));
        let second = result_for("A1", &request.command_id, json!(2));
        let via = conn.connection_id;
        assert_eq!(correlator.resolve(&agent, via, first), ResolveOutcome::Resolved);
        assert_eq!(correlator.resolve(&agent, via, second), ResolveOutcome::Stale);
        assert_eq!(pending.wait().await.unwrap().result, json!(1));
    }

    #[tokio::test]
    async fn test_result_from_other_agent_does_not_match() {
        let (correlator, conn, mut rx) = setup("A1");

        let pending = correlator.send(&AgentId::new("A1"), json!("x")).await.unwrap();
        let request = sent_command(&mut rx).await;

        // Claims to be A1 but arrived on A2's connection
        let outcome = correlator.resolve(
            &AgentId::new("A2"),
            conn.connection_id + 1,
            result_for("A1", &request.command_id, json!("forged")),
        );
        assert_eq!(outcome, ResolveOutcome::Stale);
        assert_eq!(correlator.outstanding(), 1);
        drop(pending);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending() {
        let (correlator, conn, mut rx) = setup("A1");

        let pending = correlator.send(&AgentId::new("A1"), json!("x")).await.unwrap();
        let _ = sent_command(&mut rx).await;

        assert_eq!(correlator.fail_connection(conn.connection_id), 1);
        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, CommandError::ConnectionLost { .. }));
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_send_on_closed_connection_is_connection_lost() {
        let (correlator, conn, _rx) = setup("A1");
        conn.close();

        let err = correlator
            .send(&AgentId::new("A1"), json!("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::ConnectionLost { .. }));
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_result_on_later_connection_of_same_agent_is_stale() {
        let registry = Arc::new(SessionRegistry::new());
        let (tx, mut rx) = mpsc::channel(8);
        let first = registry.register(AgentConnection::new(AgentId::new("A1"), tx));
        let correlator = CommandCorrelator::new(Arc::clone(&registry), Duration::from_secs(30));
        let agent = AgentId::new("A1");

        let pending = correlator.send(&agent, json!("x")).await.unwrap();
        let request = sent_command(&mut rx).await;

        // The agent reconnects before answering
        let (tx2, _rx2) = mpsc::channel(8);
        let second = registry.register(AgentConnection::new(agent.clone(), tx2));
        assert_ne!(first.connection_id, second.connection_id);

        let replayed = result_for("A1", &request.command_id, json!("replayed"));
        assert_eq!(
            correlator.resolve(&agent, second.connection_id, replayed),
            ResolveOutcome::Stale
        );
        assert_eq!(correlator.outstanding(), 1);

        let original = result_for("A1", &request.command_id, json!("original"));
        assert_eq!(
            correlator.resolve(&agent, first.connection_id, original),
            ResolveOutcome::Resolved
        );
        assert_eq!(pending.wait().await.unwrap().result, json!("original"));
    }

    #[tokio::test]
    async fn test_oversized_payload_is_refused_before_queueing() {
        let (correlator, conn, mut rx) = setup("A1");
        let agent = AgentId::new("A1");

        let err = correlator
            .send(&agent, json!("x".repeat(2 * fleet_protocol::MAX_MESSAGE_SIZE)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CommandError::PayloadTooLarge { size, max }
                if size > max && max == fleet_protocol::MAX_MESSAGE_SIZE
        ));
        assert_eq!(correlator.outstanding(), 0);
        assert!(rx.try_recv().is_err());
        assert!(!conn.is_closed());

        // The connection still carries ordinary commands
        let pending = correlator.send(&agent, json!("uptime")).await.unwrap();
        assert_eq!(sent_command(&mut rx).await.command_id, pending.command_id);
    }

    #[tokio::test]
    async fn test_broadcast_targets_every_agent() {
        let registry = Arc::new(SessionRegistry::new());
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        registry.register(AgentConnection::new(AgentId::new("A1"), tx1));
        registry.register(AgentConnection::new(AgentId::new("A2"), tx2));
        let correlator = CommandCorrelator::new(registry, Duration::from_secs(30));

        let sent = correlator.broadcast(json!("hostname")).await;
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, pending)| pending.is_ok()));
        assert_eq!(correlator.outstanding(), 2);

        let a = sent_command(&mut rx1).await;
        let b = sent_command(&mut rx2).await;
        assert_ne!(a.command_id, b.command_id);
    }
}
