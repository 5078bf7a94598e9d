//! Attempt and Decision models for execution history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::TaskError;
use super::task::TaskId;

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    /// Still executing (or the process died while executing).
    Running,
    Succeeded,
    Failed,
    /// Exceeded the hard wall-clock timeout.
    TimedOut,
    /// Refused by an open circuit; the executor was not called.
    Rejected,
    /// Cut off by a crash or a restore.
    Interrupted,
}

/// One entry of a task's retry record.
///
/// Records the attempt number, the backoff applied before it, how it ended
/// and the error classification. This is what an operator sees in an
/// escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub delay_ms: u64,
    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    pub outcome: AttemptOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl AttemptRecord {
    pub fn started(attempt: u32, delay_ms: u64, now: DateTime<Utc>) -> Self {
        Self {
            attempt,
            delay_ms,
            started_at: now,
            ended_at: None,
            outcome: AttemptOutcome::Running,
            error: None,
        }
    }

    pub fn finish(&mut self, now: DateTime<Utc>, outcome: AttemptOutcome, error: Option<TaskError>) {
        self.ended_at = Some(now);
        self.outcome = outcome;
        self.error = error;
    }

    /// Failed in a way that counts toward error-rate detection.
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Failed | AttemptOutcome::TimedOut)
    }
}

/// A decision made during execution, appended to the run journal.
///
/// Records:
/// - What observation/context led to this decision
/// - What policy was applied
/// - What action was taken (retry, escalate, open circuit, override, ...)
///
/// This enables "why did the system do X" explanations after the fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    /// What was observed that triggered this decision.
    pub trigger: serde_json::Value,

    /// Examples: "retry_controller", "circuit_breaker", "operator"
    pub policy: String,

    /// Examples: "schedule_retry", "needs_review", "open_circuit", "override_retry"
    pub decision: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl DecisionRecord {
    pub fn new(
        at: DateTime<Utc>,
        task_id: Option<TaskId>,
        trigger: serde_json::Value,
        policy: impl Into<String>,
        decision: impl Into<String>,
    ) -> Self {
        Self {
            at,
            task_id,
            trigger,
            policy: policy.into(),
            decision: decision.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_as_required_names() {
        let s = serde_json::to_string(&AttemptOutcome::TimedOut).unwrap();
        assert_eq!(s, "\"TIMED_OUT\"");
    }

    #[test]
    fn rejected_attempt_is_not_a_failure_for_error_rate() {
        let now = Utc::now();
        let mut record = AttemptRecord::started(1, 0, now);
        record.finish(now, AttemptOutcome::Rejected, None);
        assert!(!record.is_failure());

        record.outcome = AttemptOutcome::TimedOut;
        assert!(record.is_failure());
    }

    #[test]
    fn decision_record_skips_empty_fields() {
        let record = DecisionRecord::new(
            Utc::now(),
            None,
            serde_json::json!({"op": "api"}),
            "circuit_breaker",
            "open_circuit",
        );
        let v = serde_json::to_value(&record).unwrap();
        assert!(v.get("task_id").is_none());
        assert!(v.get("context").is_none());
        assert_eq!(v["decision"], "open_circuit");
    }
}
