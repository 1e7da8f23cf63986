//! TOML configuration for the engine and agent binaries

mod agent;
mod engine;
pub mod serde_utils;

pub use agent::{AgentConfig, ExecutorKind, SessionTimings};
pub use engine::EngineConfig;

use crate::error::ConfigError;
use serde::{de::DeserializeOwned, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// `<platform config dir>/fleet`, or `./fleet` when the platform has none
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fleet")
}

pub fn default_engine_config_path() -> PathBuf {
    default_config_dir().join("engine.toml")
}

pub fn default_agent_config_path() -> PathBuf {
    default_config_dir().join("agent.toml")
}

/// Parse a TOML config file.
///
/// A missing file is reported as [`ConfigError::NotFound`] so callers can
/// choose to fall back to defaults.
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(ConfigError::Invalid(format!("read {}: {e}", path.display()))),
    };
    Ok(toml::from_str(&text)?)
}

/// [`load_config`], with `T::default()` in place of a missing file
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, ConfigError> {
    match load_config(path) {
        Err(ConfigError::NotFound(_)) => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(T::default())
        }
        other => other,
    }
}

/// Write a config as TOML, creating parent directories as needed
pub fn save_config<T: Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let text = toml::to_string_pretty(config)?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| ConfigError::Invalid(format!("create {}: {e}", dir.display())))?;
    }
    std::fs::write(path, text)
        .map_err(|e| ConfigError::Invalid(format!("write {}: {e}", path.display())))
}
