//! Decision model: what happens to a task after a failed attempt.
//!
//! `Decider` is the seam; `policy::RetryController` is the default
//! implementation. Deciders are pure: the engine applies the decision.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::ErrorClass;
use super::task::TaskRecord;

/// Why a retry was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    NonRetryableError,
    TaskLimitExceeded,
    GlobalLimitExceeded,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DenyReason::NonRetryableError => "NON_RETRYABLE_ERROR",
            DenyReason::TaskLimitExceeded => "TASK_LIMIT_EXCEEDED",
            DenyReason::GlobalLimitExceeded => "GLOBAL_LIMIT_EXCEEDED",
        };
        f.write_str(s)
    }
}

/// The next action for a failed task.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Wait `delay`, then attempt again.
    Retry { delay: Duration, reason: String },

    /// Stop retrying; the task needs a human.
    Deny { reason: DenyReason, detail: String },
}

impl RetryDecision {
    pub fn allow(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }

    pub fn delay(&self) -> Duration {
        match self {
            RetryDecision::Retry { delay, .. } => *delay,
            RetryDecision::Deny { .. } => Duration::ZERO,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            RetryDecision::Retry { reason, .. } => reason.clone(),
            RetryDecision::Deny { reason, .. } => reason.to_string(),
        }
    }
}

/// Decides whether a failed task is attempted again.
///
/// # Arguments
/// * `task` - the task record (attempts already include the failed one)
/// * `class` - classification of the failure
/// * `global_attempts` - attempts dispatched across the whole run
pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskRecord, class: ErrorClass, global_attempts: u32) -> RetryDecision;

    /// Whether the run may dispatch one more attempt of any kind.
    fn admits_attempt(&self, _global_attempts: u32) -> bool {
        true
    }
}
