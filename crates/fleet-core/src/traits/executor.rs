//! Command executor collaborator

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ExecutorError;

/// Runs command payloads pushed by the engine
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute one payload and return its result
    async fn execute(&self, payload: Value) -> Result<Value, ExecutorError>;
}
