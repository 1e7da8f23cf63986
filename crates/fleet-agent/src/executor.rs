//! Local command executors

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use fleet_core::config::{AgentConfig, ExecutorKind};
use fleet_core::traits::CommandExecutor;
use fleet_core::ExecutorError;

#[cfg(windows)]
const DEFAULT_SHELL: (&str, &str) = ("cmd", "/C");
#[cfg(not(windows))]
const DEFAULT_SHELL: (&str, &str) = ("sh", "-c");

/// Build the executor selected in the configuration
pub fn from_config(config: &AgentConfig) -> Arc<dyn CommandExecutor> {
    match config.executor {
        ExecutorKind::Shell => Arc::new(ShellExecutor::new(
            config.shell.clone(),
            config.exec_timeout,
        )),
        ExecutorKind::Echo => Arc::new(EchoExecutor),
    }
}

/// Runs payloads as shell command lines
///
/// Accepts either a string (`"uptime"`) or an object with a `command`
/// field (`{"command": "uptime"}`). The result carries `stdout`, `stderr`
/// and `exitCode`; a non-zero exit is a failure with the same output.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    flag: &'static str,
    timeout: Duration,
}

impl ShellExecutor {
    /// Create an executor using `shell` (or the platform default)
    pub fn new(shell: Option<String>, timeout: Duration) -> Self {
        let (default_shell, flag) = DEFAULT_SHELL;
        Self {
            shell: shell.unwrap_or_else(|| default_shell.to_string()),
            flag,
            timeout,
        }
    }
}

fn command_line(payload: &Value) -> Result<&str, ExecutorError> {
    match payload {
        Value::String(line) => Ok(line.as_str()),
        Value::Object(map) => map
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::Unsupported("missing \"command\" field".to_string())),
        other => Err(ExecutorError::Unsupported(format!(
            "expected a string or object, got {}",
            other
        ))),
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, payload: Value) -> Result<Value, ExecutorError> {
        let line = command_line(&payload)?;
        tracing::debug!("Running {:?} via {}", line, self.shell);

        let child = Command::new(&self.shell)
            .arg(self.flag)
            .arg(line)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| ExecutorError::Failed {
                message: format!("timed out after {:?}", self.timeout),
                output: None,
            })??;

        let body = json!({
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
            "exitCode": output.status.code(),
        });

        if output.status.success() {
            Ok(body)
        } else {
            Err(ExecutorError::Failed {
                message: format!("command exited with {}", output.status),
                output: Some(body),
            })
        }
    }
}

/// Returns every payload unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

#[async_trait]
impl CommandExecutor for EchoExecutor {
    async fn execute(&self, payload: Value) -> Result<Value, ExecutorError> {
        Ok(payload)
    }
}
