//! Errors - 実行エラーの分類
//!
//! ErrorClass は運用上の分類。executor が返す error identifier
//! (`"rate_limit"` など) から `ErrorClassifier` で決まる。

use std::fmt;

use serde::{Deserialize, Serialize};

/// Operational classification of a task failure.
///
/// - Transient: network, rate limit, timeout (retryable)
/// - Permanent: validation, authorization, malformed task (never retryable)
/// - Resource: disk / memory exhaustion (retryable once resources recover)
/// - StateCorruption: ground truth unknown (always fatal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
    Resource,
    StateCorruption,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Transient => "TRANSIENT",
            ErrorClass::Permanent => "PERMANENT",
            ErrorClass::Resource => "RESOURCE",
            ErrorClass::StateCorruption => "STATE_CORRUPTION",
        };
        f.write_str(s)
    }
}

/// Last error of a task: identifier, classification and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Identifier reported by the executor (e.g. "rate_limit", "timeout").
    pub error_id: String,
    pub class: ErrorClass,
    pub message: String,
}

impl TaskError {
    pub fn new(error_id: impl Into<String>, class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            error_id: error_id.into(),
            class,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.error_id, self.class, self.message)
    }
}

/// Well-known error identifiers produced by keel itself.
pub mod ids {
    /// The task exceeded its hard wall-clock timeout.
    pub const TIMEOUT: &str = "timeout";
    /// The operation class's circuit breaker rejected the attempt.
    pub const CIRCUIT_OPEN: &str = "circuit_open";
    /// The executor could not be reached or crashed.
    pub const EXECUTOR_ERROR: &str = "executor_error";
}
