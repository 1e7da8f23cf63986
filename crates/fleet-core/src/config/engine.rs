//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for the engine daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Address to bind the agent endpoint and admin routes to
    pub bind_address: String,

    /// Interval between engine `ping` messages on each connection
    #[serde(with = "duration_secs")]
    pub ping_interval: Duration,

    /// Close a connection after this long without inbound traffic
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Default deadline for remote commands
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// File holding agent IDs and secret digests
    pub credentials_path: PathBuf,

    /// Capacity of each connection's outbound queue
    pub outbound_queue: usize,

    /// Maximum number of concurrent agent connections
    pub max_connections: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7420".to_string(),
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            command_timeout: Duration::from_secs(30),
            credentials_path: super::default_config_dir().join("agents.keys"),
            outbound_queue: 256,
            max_connections: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_timeout_exceeds_ping_interval() {
        let config = EngineConfig::default();
        assert!(config.idle_timeout > config.ping_interval);
    }

    #[test]
    fn test_parse_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            bind_address = "127.0.0.1:8000"
            command_timeout = 10
            max_connections = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:8000");
        assert_eq!(config.command_timeout, Duration::from_secs(10));
        assert_eq!(config.max_connections, Some(500));
        assert_eq!(config.ping_interval, Duration::from_secs(30));
    }
}
