//! Status - `keel status` 用のスナップショット
//!
//! 保存済みの state / recovery point / escalation file から組み立てる。
//! engine が動いているかどうかに関係なく読める（書き込みはしない）。

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ErrorClass, Escalation, PointId, PointMetadata, RecoveryReason, Run, RunId, RunOutcome,
    RunStatus, TaskId, TaskStatus,
};
use crate::ports::LoadSource;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLine {
    pub id: TaskId,
    pub status: TaskStatus,
    pub attempts: u32,
    pub overrides: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ErrorClass>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointLine {
    pub id: PointId,
    pub reason: RecoveryReason,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub completed: usize,
}

impl From<&PointMetadata> for PointLine {
    fn from(meta: &PointMetadata) -> Self {
        Self {
            id: meta.id,
            reason: meta.reason,
            created_at: meta.created_at,
            task_id: meta.task_id.clone(),
            completed: meta.completed_count,
        }
    }
}

/// What an operator sees first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
    /// True when the primary state file was unusable and the backup was read.
    pub from_backup: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskId>,
    pub counts: TaskCounts,
    pub global_attempts: u32,
    pub tasks: Vec<TaskLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_point: Option<PointLine>,
    pub point_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<Escalation>,
}

impl RunSummary {
    pub fn new(
        run: &Run,
        source: LoadSource,
        points: &[PointMetadata],
        escalation: Option<Escalation>,
    ) -> Self {
        let pending = run
            .tasks
            .iter()
            .filter(|t| t.status.is_schedulable() || t.status == TaskStatus::InProgress)
            .count();
        let tasks = run
            .tasks
            .iter()
            .map(|t| TaskLine {
                id: t.id().clone(),
                status: t.status,
                attempts: t.attempts,
                overrides: t.overrides,
                error_id: t.last_error.as_ref().map(|e| e.error_id.clone()),
                class: t.last_error.as_ref().map(|e| e.class),
            })
            .collect();

        Self {
            run_id: run.run_id,
            status: run.status,
            updated_at: run.updated_at,
            from_backup: source == LoadSource::Backup,
            current_task: run.current_task.clone(),
            counts: TaskCounts {
                total: run.total_tasks,
                completed: run.completed_count,
                failed: run.failed_count,
                blocked: run.blocked_count,
                pending,
            },
            global_attempts: run.global_attempts,
            tasks,
            outcome: run.outcome.clone(),
            last_point: points.last().map(PointLine::from),
            point_count: points.len(),
            // a stale file from an earlier run is not this run's business
            escalation: escalation.filter(|e| e.run_id == run.run_id),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "run {}  {}", self.run_id, self.status);
        if self.from_backup {
            let _ = writeln!(out, "  (primary state unusable, showing backup)");
        }
        let c = &self.counts;
        let _ = writeln!(
            out,
            "  tasks: {}/{} completed, {} failed, {} blocked, {} pending",
            c.completed, c.total, c.failed, c.blocked, c.pending
        );
        let _ = writeln!(out, "  attempts: {}", self.global_attempts);
        if let Some(task) = &self.current_task {
            let _ = writeln!(out, "  current: {task}");
        }
        let _ = writeln!(out, "  updated: {}", self.updated_at.to_rfc3339());

        for t in &self.tasks {
            let error = match (&t.error_id, t.class) {
                (Some(id), Some(class)) => format!("  last error: {id} [{class}]"),
                _ => String::new(),
            };
            let overrides = if t.overrides > 0 {
                format!(" (+{} override)", t.overrides)
            } else {
                String::new()
            };
            let _ = writeln!(
                out,
                "  - {:<24} {:<13} attempts={}{}{}",
                t.id.as_str(),
                t.status.to_string(),
                t.attempts,
                overrides,
                error
            );
        }

        match &self.last_point {
            Some(p) => {
                let _ = writeln!(
                    out,
                    "  recovery points: {} (latest {} {} at {})",
                    self.point_count,
                    p.id,
                    p.reason,
                    p.created_at.to_rfc3339()
                );
            }
            None => {
                let _ = writeln!(out, "  recovery points: none");
            }
        }
        if let Some(escalation) = &self.escalation {
            out.push('\n');
            out.push_str(&escalation.render());
        }
        out
    }
}
