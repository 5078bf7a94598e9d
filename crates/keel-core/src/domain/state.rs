//! Run and task status enums.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of the run as a whole.
///
/// State transitions:
/// - Ready -> Running -> Completed | Failed
/// - any -> Paused (cancellation / operator pause)
/// - any -> Recovering (checkpoint failure, restore in progress)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Ready,
    Running,
    Paused,
    Recovering,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Status of a single task.
///
/// State transitions:
/// - Pending -> Ready -> InProgress -> Completed
/// - InProgress -> Ready (retry scheduled)
/// - InProgress -> NeedsReview (retry denied, escalated)
/// - Pending -> Blocked (a prerequisite will not complete)
/// - NeedsReview | Blocked -> Ready (operator override)
/// - NeedsReview -> Failed (operator accepted the failure)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Failed,
    Blocked,
    NeedsReview,
}

impl TaskStatus {
    /// Can the scheduler pick this task up (subject to prerequisites)?
    pub fn is_schedulable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Ready)
    }

    /// Does this task prevent its dependents from ever running without intervention?
    pub fn blocks_dependents(self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::NeedsReview | TaskStatus::Blocked
        )
    }

    /// Counted in the run's failed count.
    pub fn is_failure(self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::NeedsReview)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Ready => "READY",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Blocked => "BLOCKED",
            TaskStatus::NeedsReview => "NEEDS_REVIEW",
        };
        f.write_str(s)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Ready => "READY",
            RunStatus::Running => "RUNNING",
            RunStatus::Paused => "PAUSED",
            RunStatus::Recovering => "RECOVERING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn statuses_serialize_as_screaming_snake_case() {
        let s = serde_json::to_string(&TaskStatus::NeedsReview).unwrap();
        assert_eq!(s, "\"NEEDS_REVIEW\"");
        let s = serde_json::to_string(&RunStatus::Recovering).unwrap();
        assert_eq!(s, "\"RECOVERING\"");
    }

    #[rstest]
    #[case::failed(TaskStatus::Failed, true)]
    #[case::needs_review(TaskStatus::NeedsReview, true)]
    #[case::blocked(TaskStatus::Blocked, true)]
    #[case::pending(TaskStatus::Pending, false)]
    #[case::completed(TaskStatus::Completed, false)]
    fn blocks_dependents(#[case] status: TaskStatus, #[case] expected: bool) {
        assert_eq!(status.blocks_dependents(), expected);
    }

    #[test]
    fn display_matches_serialized_form() {
        for status in [TaskStatus::InProgress, TaskStatus::NeedsReview] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json.trim_matches('"'), status.to_string());
        }
    }
}
