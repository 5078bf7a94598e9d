//! Health observations raised by the monitor.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Metric names used in health events.
pub mod metrics {
    pub const STUCK_TASK: &str = "stuck_task_ms";
    pub const ERROR_RATE: &str = "error_rate";
    pub const CPU: &str = "cpu_percent";
    pub const MEMORY: &str = "memory_percent";
    pub const DISK: &str = "disk_percent";
}

/// One monitor observation. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub at: DateTime<Utc>,
    pub metric: String,
    pub value: f64,
    /// Threshold that was crossed (or the warning threshold for INFO).
    pub threshold: f64,
    pub severity: Severity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    pub message: String,
}

impl HealthEvent {
    pub fn new(
        at: DateTime<Utc>,
        metric: impl Into<String>,
        value: f64,
        threshold: f64,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            at,
            metric: metric.into(),
            value,
            threshold,
            severity,
            task_id: None,
            message: message.into(),
        }
    }

    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

impl fmt::Display for HealthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}={} (threshold {}): {}",
            self.severity, self.metric, self.value, self.threshold, self.message
        )
    }
}

/// Host resource level as last seen by the monitor.
///
/// RESOURCE-class failures are retried only once this is back to `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceLevel {
    Ok,
    Warning,
    Critical,
}

impl From<Severity> for ResourceLevel {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Info => ResourceLevel::Ok,
            Severity::Warning => ResourceLevel::Warning,
            Severity::Critical => ResourceLevel::Critical,
        }
    }
}

/// Classify `value` against a warning / critical pair.
pub fn grade(value: f64, warning: f64, critical: f64) -> Severity {
    if value >= critical {
        Severity::Critical
    } else if value >= warning {
        Severity::Warning
    } else {
        Severity::Info
    }
}
