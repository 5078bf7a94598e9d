//! Task identity, definition, and the per-task record owned by the Run.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attempt::{AttemptOutcome, AttemptRecord};
use super::errors::TaskError;
use super::state::TaskStatus;

/// Stable identifier of a task, as written in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

pub const DEFAULT_OPERATION: &str = "default";

fn default_operation() -> String {
    DEFAULT_OPERATION.to_string()
}

/// Definition of one unit of work.
///
/// `payload` is opaque: keel only hands it to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,

    #[serde(default)]
    pub depends_on: Vec<TaskId>,

    /// Operation class guarded by a circuit breaker (e.g. "github-api").
    #[serde(default = "default_operation")]
    pub operation: String,

    /// Per-task override of the hard execution timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskSpec {
    /// Convenience constructor for tests and programmatic plans.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(id),
            depends_on: Vec::new(),
            operation: default_operation(),
            timeout_ms: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(TaskId::new(id));
        self
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A task inside the Run: definition + status + attempt history.
///
/// All status transitions go through the methods below; the Execution
/// Engine is the only caller that holds a `&mut`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub spec: TaskSpec,

    /// Position in the plan (ties in dependency order break on this).
    pub position: usize,

    pub status: TaskStatus,

    /// Attempts dispatched to the executor. Circuit rejections are not counted.
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TaskError>,

    #[serde(default)]
    pub history: Vec<AttemptRecord>,

    /// Number of operator overrides applied (`keel retry`).
    #[serde(default)]
    pub overrides: u32,
}

impl TaskRecord {
    pub fn new(spec: TaskSpec, position: usize) -> Self {
        Self {
            spec,
            position,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            history: Vec::new(),
            overrides: 0,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.spec.id
    }

    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Mark as running (increment attempts). `delay_ms` is the backoff applied before it.
    pub fn start_attempt(&mut self, now: DateTime<Utc>, delay_ms: u64) {
        self.attempts += 1;
        self.status = TaskStatus::InProgress;
        self.history
            .push(AttemptRecord::started(self.attempts, delay_ms, now));
    }

    /// Mark as completed and close the open attempt.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.close_attempt(now, AttemptOutcome::Succeeded, None);
        self.status = TaskStatus::Completed;
        self.last_error = None;
    }

    /// Close the open attempt as failed. The task goes back to Ready until the
    /// retry decision says otherwise.
    pub fn fail_attempt(&mut self, now: DateTime<Utc>, error: TaskError, timed_out: bool) {
        let outcome = if timed_out {
            AttemptOutcome::TimedOut
        } else {
            AttemptOutcome::Failed
        };
        self.close_attempt(now, outcome, Some(error.clone()));
        self.status = TaskStatus::Ready;
        self.last_error = Some(error);
    }

    /// Record an attempt that the circuit breaker refused. Does not touch `attempts`.
    pub fn record_rejection(&mut self, now: DateTime<Utc>, error: TaskError) {
        let mut record = AttemptRecord::started(self.attempts + 1, 0, now);
        record.finish(now, AttemptOutcome::Rejected, Some(error.clone()));
        self.history.push(record);
        self.status = TaskStatus::Ready;
        self.last_error = Some(error);
    }

    pub fn mark_needs_review(&mut self) {
        self.status = TaskStatus::NeedsReview;
    }

    pub fn mark_failed(&mut self) {
        self.status = TaskStatus::Failed;
    }

    pub fn mark_blocked(&mut self) {
        self.status = TaskStatus::Blocked;
    }

    /// Operator override: put the task back in line with a fresh attempt budget.
    /// History is kept for audit.
    pub fn reset_for_override(&mut self) {
        self.attempts = 0;
        self.overrides += 1;
        self.status = TaskStatus::Ready;
    }

    /// Interrupted attempt (crash / restore): the attempt stays counted.
    pub fn interrupt(&mut self, now: DateTime<Utc>) {
        if self.status == TaskStatus::InProgress {
            self.close_attempt(now, AttemptOutcome::Interrupted, None);
            self.status = TaskStatus::Ready;
        }
    }

    /// Start time of the attempt currently running, if any.
    pub fn running_since(&self) -> Option<DateTime<Utc>> {
        self.history
            .last()
            .filter(|a| a.outcome == AttemptOutcome::Running)
            .map(|a| a.started_at)
    }

    fn close_attempt(
        &mut self,
        now: DateTime<Utc>,
        outcome: AttemptOutcome,
        error: Option<TaskError>,
    ) {
        if let Some(last) = self.history.last_mut() {
            if last.outcome == AttemptOutcome::Running {
                last.finish(now, outcome, error);
            }
        }
    }
}
