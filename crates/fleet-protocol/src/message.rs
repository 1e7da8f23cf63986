//! Message types for the fleet agent protocol
//!
//! Every message is a JSON object tagged by a `type` field, with camelCase
//! field names. Messages are carried as WebSocket text frames; see `codec.rs`.
//!
//! # Message Flow
//!
//! 1. Agent opens the channel with its identity in the handshake headers
//! 2. Agent sends `agent_connected` announcing the same identity
//! 3. After a short grace delay the agent sends `status_update`, then repeats
//!    it on a fixed interval
//! 4. Engine sends `ping` periodically, agent answers with `pong`
//! 5. Engine sends `command` at any time, agent answers with exactly one
//!    `command_result` carrying the same `commandId`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AgentId, CommandId};

/// Status reported in a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    /// Agent is up and serving commands
    Online,
    /// Agent is going away (sent on graceful shutdown)
    Offline,
    /// Agent is up but degraded
    Error,
}

/// Periodic status report proving liveness and carrying host metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReport {
    /// Reporting agent
    pub agent_id: AgentId,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    /// Reported status
    pub status: HeartbeatStatus,
    /// Opaque metrics blob
    #[serde(default)]
    pub system_info: Value,
}

/// Remote instruction pushed by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Correlation token
    pub command_id: CommandId,
    /// Opaque payload handed to the agent's executor
    pub command: Value,
}

/// Outcome of one command execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    /// Agent that executed the command
    pub agent_id: AgentId,
    /// Token of the command this answers
    pub command_id: CommandId,
    /// Opaque result (or error payload when `success` is false)
    #[serde(default)]
    pub result: Value,
    /// Whether the executor succeeded
    pub success: bool,
}

/// Which side of the channel is allowed to send a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sent by agents, consumed by the engine
    AgentToEngine,
    /// Sent by the engine, consumed by agents
    EngineToAgent,
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Explicit announce after the channel opens
    AgentConnected {
        #[serde(rename = "agentId")]
        agent_id: AgentId,
    },

    /// Heartbeat
    StatusUpdate(HeartbeatReport),

    /// Liveness check
    Ping,

    /// Liveness response
    Pong {
        #[serde(rename = "agentId")]
        agent_id: AgentId,
    },

    /// Remote instruction
    Command(CommandRequest),

    /// Correlated outcome
    CommandResult(CommandResult),
}

impl Message {
    /// Wire name of this message type
    pub fn kind(&self) -> &'static str {
        match self {
            Message::AgentConnected { .. } => "agent_connected",
            Message::StatusUpdate(_) => "status_update",
            Message::Ping => "ping",
            Message::Pong { .. } => "pong",
            Message::Command(_) => "command",
            Message::CommandResult(_) => "command_result",
        }
    }

    /// Which side sends this message
    pub fn direction(&self) -> Direction {
        match self {
            Message::Ping | Message::Command(_) => Direction::EngineToAgent,
            _ => Direction::AgentToEngine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_update_wire_shape() {
        let msg = Message::StatusUpdate(HeartbeatReport {
            agent_id: AgentId::new("A1"),
            timestamp: 1_700_000_000_000,
            status: HeartbeatStatus::Online,
            system_info: json!({"cpu": 12.5}),
        });

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "status_update",
                "agentId": "A1",
                "timestamp": 1_700_000_000_000u64,
                "status": "online",
                "systemInfo": {"cpu": 12.5}
            })
        );
    }

    #[test]
    fn test_command_from_engine_json() {
        let msg: Message =
            serde_json::from_value(json!({"type": "command", "command": "uptime", "commandId": "c-1"}))
                .unwrap();
        assert_eq!(
            msg,
            Message::Command(CommandRequest {
                command_id: CommandId::new("c-1"),
                command: json!("uptime"),
            })
        );
        assert_eq!(msg.direction(), Direction::EngineToAgent);
    }

    #[test]
    fn test_ping_is_bare_type() {
        assert_eq!(serde_json::to_value(Message::Ping).unwrap(), json!({"type": "ping"}));
    }

    #[test]
    fn test_announce_and_pong_use_camel_case() {
        let announce = serde_json::to_value(Message::AgentConnected {
            agent_id: AgentId::new("A1"),
        })
        .unwrap();
        assert_eq!(announce, json!({"type": "agent_connected", "agentId": "A1"}));

        let pong = serde_json::to_value(Message::Pong {
            agent_id: AgentId::new("A1"),
        })
        .unwrap();
        assert_eq!(pong, json!({"type": "pong", "agentId": "A1"}));
    }

    #[test]
    fn test_command_result_defaults_missing_result_to_null() {
        let msg: Message = serde_json::from_value(json!({
            "type": "command_result",
            "agentId": "A1",
            "commandId": "X",
            "success": false
        }))
        .unwrap();
        match msg {
            Message::CommandResult(result) => {
                assert!(!result.success);
                assert_eq!(result.result, Value::Null);
            }
            other => panic!("Expected CommandResult, got {:?}", other),
        }
    }

    #[test]
    fn test_kind_matches_wire_tag() {
        let msg = Message::Pong {
            agent_id: AgentId::new("A1"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], msg.kind());
    }
}
