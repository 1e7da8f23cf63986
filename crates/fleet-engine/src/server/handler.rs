//! Per-connection task
//!
//! Each accepted channel is served by one task that owns the channel. The
//! task registers the connection, then multiplexes engine shutdown, being
//! superseded by a reconnect, queued outbound messages, pings and
//! inbound traffic until one of them ends the connection.

use std::sync::Arc;

use tokio::sync::mpsc;

use fleet_core::traits::Channel;
use fleet_core::ChannelError;
use fleet_protocol::message::Direction;
use fleet_protocol::{AgentId, Handshake, Message};

use crate::connection::{AgentConnection, Health, HealthMonitor};
use crate::state::EngineState;

/// Why an upgrade was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Unknown identity or wrong secret
    Unauthorized,
    /// Connection limit reached
    AtCapacity,
}

/// Decide whether a channel presenting `handshake` may be accepted
///
/// The capacity check here only refuses the upgrade early. Concurrent
/// upgrades can all pass it, so `serve_channel` registers through
/// [`SessionRegistry::register_within`](crate::SessionRegistry::register_within)
/// and closes any channel that would overshoot the limit.
pub async fn admit(state: &EngineState, handshake: &Handshake) -> Result<(), Rejection> {
    if !state
        .credentials
        .validate(&handshake.agent_id, &handshake.agent_key)
        .await
    {
        tracing::warn!("Rejected agent {}: invalid credentials", handshake.agent_id);
        return Err(Rejection::Unauthorized);
    }

    if let Some(max) = state.config.max_connections {
        let reconnecting = state.registry.lookup(&handshake.agent_id).is_some();
        if !reconnecting && state.registry.len() >= max as usize {
            tracing::warn!(
                "Rejected agent {}: connection limit {} reached",
                handshake.agent_id,
                max
            );
            return Err(Rejection::AtCapacity);
        }
    }

    Ok(())
}

/// Serve an authenticated channel until it closes
pub async fn serve_channel(state: Arc<EngineState>, agent_id: AgentId, mut channel: Box<dyn Channel>) {
    let (tx, mut outbound) = mpsc::channel(state.config.outbound_queue);
    let candidate = AgentConnection::new(agent_id, tx);
    let connection = match state.config.max_connections {
        None => state.registry.register(candidate),
        Some(max) => match state.registry.register_within(candidate, max as usize) {
            Ok(connection) => connection,
            Err(refused) => {
                tracing::warn!(
                    "Closing channel for {}: connection limit {} reached",
                    refused.agent_id,
                    max
                );
                channel.close().await;
                return;
            }
        },
    };
    let agent_id = &connection.agent_id;

    let monitor = HealthMonitor::new(state.config.ping_interval, state.config.idle_timeout);
    let mut ticker = monitor.ticker();

    let reason = loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                break "engine shutting down".to_string();
            }

            _ = connection.closed() => {
                break "superseded by a newer connection".to_string();
            }

            Some(message) = outbound.recv() => {
                let kind = message.kind();
                match channel.send(message).await {
                    Ok(()) => {}
                    Err(ChannelError::Protocol(e)) => {
                        tracing::error!("Dropping unencodable {} for {}: {}", kind, agent_id, e);
                    }
                    Err(ChannelError::Connection(e)) => break format!("send failed: {}", e),
                }
            }

            _ = ticker.tick() => {
                match monitor.check(&connection) {
                    Health::Idle(idle) => break format!("idle for {:?}", idle),
                    Health::Alive => {
                        if let Err(ChannelError::Connection(e)) = channel.send(Message::Ping).await {
                            break format!("ping failed: {}", e);
                        }
                    }
                }
            }

            inbound = channel.recv() => {
                match inbound {
                    None => break "closed by agent".to_string(),
                    Some(Err(ChannelError::Connection(e))) => break format!("channel error: {}", e),
                    Some(Err(ChannelError::Protocol(e))) => {
                        connection.touch();
                        tracing::warn!("Dropping malformed message from {}: {}", agent_id, e);
                    }
                    Some(Ok(message)) => {
                        connection.touch();
                        handle_message(&state, &connection, message);
                    }
                }
            }
        }
    };

    connection.close();
    channel.close().await;
    drop(outbound);

    state.registry.unregister(agent_id, connection.connection_id);
    state.correlator.fail_connection(connection.connection_id);

    tracing::info!(
        "Connection {} for {} ended: {}",
        connection.connection_id,
        agent_id,
        reason
    );
}

/// Act on one inbound message
fn handle_message(state: &EngineState, connection: &AgentConnection, message: Message) {
    let agent_id = &connection.agent_id;

    if message.direction() == Direction::EngineToAgent {
        tracing::warn!(
            "Dropping {} from {}: not an agent message",
            message.kind(),
            agent_id
        );
        return;
    }

    match message {
        Message::AgentConnected { agent_id: claimed } => {
            if claimed == *agent_id {
                tracing::info!("Agent {} announced", agent_id);
            } else {
                tracing::warn!(
                    "Agent authenticated as {} announced itself as {}; ignoring",
                    agent_id,
                    claimed
                );
            }
        }
        Message::StatusUpdate(report) => {
            if report.agent_id != *agent_id {
                tracing::warn!(
                    "Dropping heartbeat for {} received from {}",
                    report.agent_id,
                    agent_id
                );
                return;
            }
            tracing::debug!("Heartbeat from {} ({:?})", agent_id, report.status);
            connection.record_heartbeat(report);
        }
        Message::Pong { .. } => {
            tracing::trace!("Pong from {}", agent_id);
        }
        Message::CommandResult(result) => {
            state
                .correlator
                .resolve(agent_id, connection.connection_id, result);
        }
        Message::Ping | Message::Command(_) => {}
    }
}
