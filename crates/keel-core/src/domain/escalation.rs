//! Escalations to a human operator, and the commands an operator can answer with.

use std::fmt::{self, Write as _};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attempt::AttemptRecord;
use super::decision::DenyReason;
use super::errors::{ErrorClass, TaskError};
use super::health::HealthEvent;
use super::ids::{PointId, RunId};
use super::task::TaskId;

/// What caused the escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationCause {
    /// The retry controller refused another attempt.
    RetryDenied { reason: DenyReason },
    /// Neither the primary nor the backup state file is valid.
    StateCorrupted { detail: String },
    /// A recovery point could not be written; the run is RECOVERING.
    CheckpointFailed { detail: String },
    /// A CRITICAL health event.
    Health { event: HealthEvent },
}

impl fmt::Display for EscalationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationCause::RetryDenied { reason } => write!(f, "retry denied ({reason})"),
            EscalationCause::StateCorrupted { detail } => write!(f, "state corrupted: {detail}"),
            EscalationCause::CheckpointFailed { detail } => {
                write!(f, "recovery point failed: {detail}")
            }
            EscalationCause::Health { event } => write!(f, "health: {event}"),
        }
    }
}

/// Everything an operator needs to decide between resume and abort.
///
/// Carries the failing task, its full retry history, the error class and
/// the most recent valid recovery point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub run_id: RunId,
    pub raised_at: DateTime<Utc>,
    pub cause: EscalationCause,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ErrorClass>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,

    #[serde(default)]
    pub history: Vec<AttemptRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_point: Option<PointId>,
}

impl Escalation {
    pub fn new(run_id: RunId, raised_at: DateTime<Utc>, cause: EscalationCause) -> Self {
        Self {
            run_id,
            raised_at,
            cause,
            task_id: None,
            class: None,
            error: None,
            history: Vec::new(),
            last_point: None,
        }
    }

    /// Does this escalation wait for an operator decision?
    ///
    /// Health escalations are notifications; the run keeps going.
    pub fn needs_decision(&self) -> bool {
        !matches!(self.cause, EscalationCause::Health { .. })
    }

    /// Multi-line text for the console.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "ESCALATION {} ({})", self.run_id, self.raised_at.to_rfc3339());
        let _ = writeln!(out, "  cause: {}", self.cause);
        if let Some(task) = &self.task_id {
            let _ = writeln!(out, "  task: {task}");
        }
        if let Some(class) = self.class {
            let _ = writeln!(out, "  class: {class}");
        }
        if let Some(error) = &self.error {
            let _ = writeln!(out, "  error: {error}");
        }
        if !self.history.is_empty() {
            let _ = writeln!(out, "  history:");
            for a in &self.history {
                let error = a
                    .error
                    .as_ref()
                    .map(|e| format!(" {}", e.error_id))
                    .unwrap_or_default();
                let _ = writeln!(
                    out,
                    "    #{} after {}ms: {:?}{}",
                    a.attempt, a.delay_ms, a.outcome, error
                );
            }
        }
        match &self.last_point {
            Some(point) => {
                let _ = writeln!(out, "  last recovery point: {point}");
            }
            None => {
                let _ = writeln!(out, "  last recovery point: none");
            }
        }
        out
    }
}

/// Which point `recover` restores from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", content = "point", rename_all = "snake_case")]
pub enum RecoverTarget {
    /// Newest point that passes validation.
    Auto,
    Point(PointId),
}

/// Operator answer to an escalation, or an unsolicited control command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "arg", rename_all = "snake_case")]
pub enum OperatorCommand {
    /// Continue with whatever is still runnable.
    Resume,
    /// Retry a task with a fresh attempt budget (logged as an override).
    Retry(TaskId),
    /// Accept the failure of a task; it becomes FAILED.
    Skip(TaskId),
    /// Replace the live state with a recovery point.
    Recover(RecoverTarget),
    Pause,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseCommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("'{0}' needs a task id")]
    MissingTask(&'static str),
    #[error("invalid recovery point id '{0}'")]
    BadPoint(String),
}

impl FromStr for OperatorCommand {
    type Err = ParseCommandError;

    /// `resume`, `retry <task>`, `skip <task>`, `recover [<point>]`, `pause`, `abort`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let verb = words.next().ok_or(ParseCommandError::Empty)?;
        let arg = words.next();
        match verb.to_ascii_lowercase().as_str() {
            "resume" | "continue" => Ok(OperatorCommand::Resume),
            "retry" => arg
                .map(|t| OperatorCommand::Retry(TaskId::new(t)))
                .ok_or(ParseCommandError::MissingTask("retry")),
            "skip" => arg
                .map(|t| OperatorCommand::Skip(TaskId::new(t)))
                .ok_or(ParseCommandError::MissingTask("skip")),
            "recover" => match arg {
                None | Some("--auto") => Ok(OperatorCommand::Recover(RecoverTarget::Auto)),
                Some(p) => p
                    .parse::<PointId>()
                    .map(|id| OperatorCommand::Recover(RecoverTarget::Point(id)))
                    .map_err(|_| ParseCommandError::BadPoint(p.to_string())),
            },
            "pause" => Ok(OperatorCommand::Pause),
            "abort" => Ok(OperatorCommand::Abort),
            other => Err(ParseCommandError::Unknown(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AttemptOutcome;
    use rstest::rstest;
    use ulid::Ulid;

    #[rstest]
    #[case::resume("resume", OperatorCommand::Resume)]
    #[case::retry("retry build", OperatorCommand::Retry(TaskId::new("build")))]
    #[case::skip("  skip  deploy ", OperatorCommand::Skip(TaskId::new("deploy")))]
    #[case::recover_auto("recover", OperatorCommand::Recover(RecoverTarget::Auto))]
    #[case::pause("PAUSE", OperatorCommand::Pause)]
    #[case::abort("abort", OperatorCommand::Abort)]
    fn parse_commands(#[case] input: &str, #[case] expected: OperatorCommand) {
        assert_eq!(input.parse::<OperatorCommand>().unwrap(), expected);
    }

    #[test]
    fn parse_recover_with_point() {
        let id = PointId::from_ulid(Ulid::new());
        let cmd: OperatorCommand = format!("recover {id}").parse().unwrap();
        assert_eq!(cmd, OperatorCommand::Recover(RecoverTarget::Point(id)));
    }

    #[rstest]
    #[case::empty("", ParseCommandError::Empty)]
    #[case::retry_without_task("retry", ParseCommandError::MissingTask("retry"))]
    #[case::unknown("explode", ParseCommandError::Unknown("explode".into()))]
    #[case::bad_point("recover rp-xyz", ParseCommandError::BadPoint("rp-xyz".into()))]
    fn parse_errors(#[case] input: &str, #[case] expected: ParseCommandError) {
        assert_eq!(input.parse::<OperatorCommand>().unwrap_err(), expected);
    }

    #[test]
    fn render_includes_task_history_class_and_point() {
        let now = Utc::now();
        let error = TaskError::new("rate_limit", ErrorClass::Transient, "429");
        let mut attempt = AttemptRecord::started(1, 0, now);
        attempt.finish(now, AttemptOutcome::Failed, Some(error.clone()));
        let point = PointId::from_ulid(Ulid::new());

        let mut escalation = Escalation::new(
            RunId::from_ulid(Ulid::new()),
            now,
            EscalationCause::RetryDenied {
                reason: DenyReason::TaskLimitExceeded,
            },
        );
        escalation.task_id = Some(TaskId::new("fetch"));
        escalation.class = Some(ErrorClass::Transient);
        escalation.error = Some(error);
        escalation.history = vec![attempt];
        escalation.last_point = Some(point);

        let text = escalation.render();
        assert!(text.contains("TASK_LIMIT_EXCEEDED"));
        assert!(text.contains("task: fetch"));
        assert!(text.contains("class: TRANSIENT"));
        assert!(text.contains("#1 after 0ms: Failed rate_limit"));
        assert!(text.contains(&point.to_string()));
        assert!(escalation.needs_decision());
    }
}
