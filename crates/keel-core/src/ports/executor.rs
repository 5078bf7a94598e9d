//! TaskExecutor port: the opaque external call that does a task's work.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{RunId, TaskId};

/// What the executor gets for one attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: RunId,
    pub task_id: TaskId,
    /// 1-indexed attempt number.
    pub attempt: u32,
    pub operation: String,
    /// Opaque payload from the plan.
    pub payload: serde_json::Value,
    /// Hard wall-clock timeout; the engine enforces it, executors may use it too.
    pub timeout: Duration,
}

/// Result of one attempt. Failures are data, not `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success,
    Failure {
        /// Identifier classified by the error table (e.g. "rate_limit").
        error_id: String,
        message: String,
    },
}

impl TaskOutcome {
    pub fn failure(error_id: impl Into<String>, message: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            error_id: error_id.into(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }
}

/// Runs a task.
///
/// The engine never interprets the payload; it only hands it over and
/// reads back success or an error identifier.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: &TaskContext) -> TaskOutcome;
}
