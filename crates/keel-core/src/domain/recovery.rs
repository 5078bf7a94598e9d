//! Recovery point metadata.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{PointId, RunId};
use super::state::RunStatus;
use super::task::TaskId;

/// Why a recovery point was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryReason {
    PreTask,
    PostTask,
    OnError,
    Manual,
    Periodic,
}

impl RecoveryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryReason::PreTask => "pre-task",
            RecoveryReason::PostTask => "post-task",
            RecoveryReason::OnError => "on-error",
            RecoveryReason::Manual => "manual",
            RecoveryReason::Periodic => "periodic",
        }
    }
}

impl fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown recovery reason '{0}'")]
pub struct ParseReasonError(pub String);

impl FromStr for RecoveryReason {
    type Err = ParseReasonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre-task" => Ok(RecoveryReason::PreTask),
            "post-task" => Ok(RecoveryReason::PostTask),
            "on-error" => Ok(RecoveryReason::OnError),
            "manual" => Ok(RecoveryReason::Manual),
            "periodic" => Ok(RecoveryReason::Periodic),
            other => Err(ParseReasonError(other.to_string())),
        }
    }
}

/// What `list()` returns for each point; also stored as `meta.json` inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointMetadata {
    pub id: PointId,
    pub run_id: RunId,
    pub reason: RecoveryReason,
    pub created_at: DateTime<Utc>,

    /// Task the point was taken around, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    pub run_status: RunStatus,
    pub completed_count: usize,
    pub total_tasks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::pre(RecoveryReason::PreTask)]
    #[case::post(RecoveryReason::PostTask)]
    #[case::on_error(RecoveryReason::OnError)]
    #[case::manual(RecoveryReason::Manual)]
    #[case::periodic(RecoveryReason::Periodic)]
    fn reason_text_forms_agree(#[case] reason: RecoveryReason) {
        let json = serde_json::to_string(&reason).unwrap();
        assert_eq!(json.trim_matches('"'), reason.as_str());
        assert_eq!(reason.as_str().parse::<RecoveryReason>().unwrap(), reason);
    }

    #[test]
    fn unknown_reason_is_rejected() {
        assert!("nightly".parse::<RecoveryReason>().is_err());
    }
}
