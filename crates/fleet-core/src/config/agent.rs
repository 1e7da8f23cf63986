//! Agent configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use fleet_protocol::AgentId;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;
use crate::types::AgentIdentity;

/// Which local executor runs commands pushed by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Run the payload through the system shell
    #[default]
    Shell,
    /// Echo the payload back (load testing)
    Echo,
}

/// Configuration for the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Engine endpoint, e.g. `ws://engine.internal:7420/agent`
    pub engine_url: String,

    /// Agent identity issued by the engine operator
    pub agent_id: Option<AgentId>,

    /// Secret key for the identity (prefer the `FLEET_AGENT_KEY` env var)
    pub agent_key: Option<String>,

    /// Interval between heartbeats
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Delay between the announce and the first heartbeat
    #[serde(with = "duration_millis")]
    pub announce_grace: Duration,

    /// Fixed delay before each reconnection attempt
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,

    /// Connection timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Executor for remote commands
    pub executor: ExecutorKind,

    /// Shell used by the shell executor (defaults to `sh`, or `cmd` on Windows)
    pub shell: Option<String>,

    /// Maximum run time of one shell command
    #[serde(with = "duration_secs")]
    pub exec_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let timings = SessionTimings::default();
        Self {
            engine_url: format!("ws://localhost:7420{}", fleet_protocol::AGENT_PATH),
            agent_id: None,
            agent_key: None,
            heartbeat_interval: timings.heartbeat_interval,
            announce_grace: timings.announce_grace,
            reconnect_delay: timings.reconnect_delay,
            connect_timeout: timings.connect_timeout,
            executor: ExecutorKind::default(),
            shell: None,
            exec_timeout: Duration::from_secs(300),
        }
    }
}

impl AgentConfig {
    /// Identity configured for this agent
    pub fn identity(&self) -> Result<AgentIdentity, ConfigError> {
        let id = self
            .agent_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ConfigError::MissingField("agent_id".to_string()))?;
        let key = self
            .agent_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConfigError::MissingField("agent_key".to_string()))?;
        Ok(AgentIdentity::new(id, key))
    }

    /// Timer settings for an agent session
    pub fn session_timings(&self) -> SessionTimings {
        SessionTimings {
            heartbeat_interval: self.heartbeat_interval,
            announce_grace: self.announce_grace,
            reconnect_delay: self.reconnect_delay,
            connect_timeout: self.connect_timeout,
        }
    }
}

/// Timers driving one agent session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
    /// Delay between the announce and the first heartbeat
    pub announce_grace: Duration,
    /// Fixed delay before reconnecting
    pub reconnect_delay: Duration,
    /// Upper bound on one channel open
    pub connect_timeout: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            announce_grace: Duration::from_millis(500),
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let timings = AgentConfig::default().session_timings();
        assert_eq!(timings.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(timings.announce_grace, Duration::from_millis(500));
        assert_eq!(timings.reconnect_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_identity_requires_id_and_key() {
        let mut config = AgentConfig::default();
        assert!(matches!(
            config.identity(),
            Err(ConfigError::MissingField(f)) if f == "agent_id"
        ));

        config.agent_id = Some(AgentId::new("A1"));
        assert!(matches!(
            config.identity(),
            Err(ConfigError::MissingField(f)) if f == "agent_key"
        ));

        config.agent_key = Some("k".to_string());
        let identity = config.identity().unwrap();
        assert_eq!(identity.id, AgentId::new("A1"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
            engine_url = "ws://engine:7420/agent"
            agent_id = "web-01"
            announce_grace = 250
            executor = "echo"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine_url, "ws://engine:7420/agent");
        assert_eq!(config.announce_grace, Duration::from_millis(250));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(config.executor, ExecutorKind::Echo);
    }
}
