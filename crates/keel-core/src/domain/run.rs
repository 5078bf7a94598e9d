//! Run record: the top-level execution context and its consistency rules.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attempt::AttemptOutcome;
use super::graph::DependencyGraph;
use super::ids::RunId;
use super::state::{RunStatus, TaskStatus};
use super::task::{TaskId, TaskRecord, TaskSpec};

/// Run record: owns every task.
///
/// Design:
/// - Single source of truth for run progress
/// - State transitions via methods; counters are derived by `refresh_counts`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: RunStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskId>,

    pub total_tasks: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub blocked_count: usize,

    /// Attempts dispatched across all tasks. Bounded by `max_total_retries`.
    pub global_attempts: u32,

    pub tasks: Vec<TaskRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
}

/// Why the run stopped, written when it leaves the running state for good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Tasks that will not complete without intervention.
    Unresolved { tasks: Vec<(TaskId, TaskStatus)> },
    Aborted { reason: String },
}

/// A rule the stored run violates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsistencyError {
    #[error("current task '{0}' does not exist")]
    MissingCurrentTask(TaskId),

    #[error("completed ({completed}) + failed ({failed}) + blocked ({blocked}) exceeds total ({total})")]
    CountsExceedTotal {
        completed: usize,
        failed: usize,
        blocked: usize,
        total: usize,
    },

    #[error("{field} is {recorded} but the tasks say {actual}")]
    CountMismatch {
        field: String,
        recorded: usize,
        actual: usize,
    },

    #[error("task '{0}' appears more than once")]
    DuplicateTask(TaskId),

    #[error("task '{task}' is {status} but {detail}")]
    ConflictingStatus {
        task: TaskId,
        status: TaskStatus,
        detail: String,
    },

    #[error("required field missing: {0}")]
    MissingField(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: TaskId, dependency: TaskId },
}

/// Result of scanning the plan for the next task to run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Scan {
    /// Index (into `Run::tasks`) of the next runnable task.
    pub next: Option<usize>,
    /// Indices of tasks whose prerequisites can no longer complete.
    pub newly_blocked: Vec<usize>,
    /// Indices of BLOCKED tasks whose prerequisites are back in play.
    pub released: Vec<usize>,
}

impl Run {
    /// Create a run from task definitions in plan order.
    pub fn new(run_id: RunId, specs: Vec<TaskSpec>, now: DateTime<Utc>) -> Self {
        let tasks: Vec<TaskRecord> = specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| TaskRecord::new(spec, i))
            .collect();
        let mut run = Self {
            run_id,
            started_at: now,
            updated_at: now,
            status: RunStatus::Ready,
            current_task: None,
            total_tasks: tasks.len(),
            completed_count: 0,
            failed_count: 0,
            blocked_count: 0,
            global_attempts: 0,
            tasks,
            outcome: None,
        };
        run.refresh_counts();
        run
    }

    pub fn index_of(&self, id: &TaskId) -> Option<usize> {
        self.tasks.iter().position(|t| t.id() == id)
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.id() == id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|t| t.id() == id)
    }

    pub fn graph(&self) -> DependencyGraph {
        DependencyGraph::from_specs(self.tasks.iter().map(|t| &t.spec))
    }

    /// Task indices in dependency order (plan order among independent tasks).
    pub fn dependency_order(&self) -> Vec<usize> {
        let ids: Vec<TaskId> = self.tasks.iter().map(|t| t.id().clone()).collect();
        match self.graph().topological_order(&ids) {
            Ok(order) => order.iter().filter_map(|id| self.index_of(id)).collect(),
            // builder rejects cycles; a hand-edited state falls back to plan order
            Err(_) => (0..self.tasks.len()).collect(),
        }
    }

    /// Recompute completed / failed / blocked counts from task statuses.
    pub fn refresh_counts(&mut self) {
        let (completed, failed, blocked) = self.actual_counts();
        self.total_tasks = self.tasks.len();
        self.completed_count = completed;
        self.failed_count = failed;
        self.blocked_count = blocked;
    }

    fn actual_counts(&self) -> (usize, usize, usize) {
        let mut completed = 0;
        let mut failed = 0;
        let mut blocked = 0;
        for task in &self.tasks {
            match task.status {
                TaskStatus::Completed => completed += 1,
                s if s.is_failure() => failed += 1,
                TaskStatus::Blocked => blocked += 1,
                _ => {}
            }
        }
        (completed, failed, blocked)
    }

    /// Find the next runnable task without mutating anything.
    ///
    /// Walks the dependency order. A pending / ready / blocked task whose
    /// prerequisites include a failed, escalated or (still) blocked task is
    /// blocked; a blocked task whose prerequisites recovered (operator
    /// override) is released. Both propagate within the same scan.
    pub fn scan(&self) -> Scan {
        let mut scan = Scan::default();
        let mut effective: HashMap<&TaskId, TaskStatus> =
            self.tasks.iter().map(|t| (t.id(), t.status)).collect();

        for i in self.dependency_order() {
            let task = &self.tasks[i];
            if !(task.status.is_schedulable() || task.status == TaskStatus::Blocked) {
                continue;
            }
            let mut satisfied = true;
            let mut doomed = false;
            for dep in &task.spec.depends_on {
                match effective.get(dep) {
                    Some(TaskStatus::Completed) => {}
                    Some(s) if s.blocks_dependents() => doomed = true,
                    _ => satisfied = false,
                }
            }

            if doomed {
                effective.insert(task.id(), TaskStatus::Blocked);
                if task.status != TaskStatus::Blocked {
                    scan.newly_blocked.push(i);
                }
                continue;
            }
            if task.status == TaskStatus::Blocked {
                effective.insert(task.id(), TaskStatus::Pending);
                scan.released.push(i);
            }
            if satisfied && scan.next.is_none() {
                scan.next = Some(i);
            }
        }
        scan
    }

    /// Apply a scan's status changes. Returns true if anything changed.
    pub fn apply_scan(&mut self, scan: &Scan) -> bool {
        for &i in &scan.newly_blocked {
            self.tasks[i].mark_blocked();
        }
        for &i in &scan.released {
            self.tasks[i].status = TaskStatus::Pending;
        }
        let changed = !scan.newly_blocked.is_empty() || !scan.released.is_empty();
        if changed {
            self.refresh_counts();
        }
        changed
    }

    /// Id of the task that would run next.
    pub fn next_task(&self) -> Option<TaskId> {
        self.scan().next.map(|i| self.tasks[i].id().clone())
    }

    /// Bring a restored / reloaded run to a state the engine can continue from.
    ///
    /// An attempt that was running is closed as interrupted (it stays
    /// counted). Completed tasks are left alone, so they never run twice.
    /// Blocked tasks are re-evaluated by the next `scan`.
    pub fn normalize_for_resume(&mut self, now: DateTime<Utc>) {
        let mut interrupted = false;
        for task in &mut self.tasks {
            if task.status == TaskStatus::InProgress {
                task.interrupt(now);
                interrupted = true;
            }
        }
        if interrupted {
            self.current_task = None;
        }
        self.refresh_counts();
        self.updated_at = now;
    }

    /// Tasks that have not completed, with their status.
    pub fn unresolved(&self) -> Vec<(TaskId, TaskStatus)> {
        self.tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Completed)
            .map(|t| (t.id().clone(), t.status))
            .collect()
    }

    /// Terminal status once nothing is runnable: Completed if every task completed.
    pub fn settle(&mut self, now: DateTime<Utc>) -> RunStatus {
        self.refresh_counts();
        self.current_task = None;
        let unresolved = self.unresolved();
        if unresolved.is_empty() {
            self.status = RunStatus::Completed;
            self.outcome = Some(RunOutcome::Completed);
        } else {
            self.status = RunStatus::Failed;
            self.outcome = Some(RunOutcome::Unresolved { tasks: unresolved });
        }
        self.updated_at = now;
        self.status
    }

    /// Check the consistency rules. An empty list means the run is valid.
    pub fn validate(&self) -> Vec<ConsistencyError> {
        let mut errors = Vec::new();

        let mut seen = HashSet::new();
        for (i, task) in self.tasks.iter().enumerate() {
            if task.id().as_str().is_empty() {
                errors.push(ConsistencyError::MissingField(format!("tasks[{i}].id")));
            }
            if !seen.insert(task.id()) {
                errors.push(ConsistencyError::DuplicateTask(task.id().clone()));
            }
        }

        for task in &self.tasks {
            for dep in &task.spec.depends_on {
                if !seen.contains(dep) {
                    errors.push(ConsistencyError::UnknownDependency {
                        task: task.id().clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        if let Some(current) = &self.current_task {
            if !seen.contains(current) {
                errors.push(ConsistencyError::MissingCurrentTask(current.clone()));
            }
        }

        let sum = self.completed_count + self.failed_count + self.blocked_count;
        if sum > self.total_tasks {
            errors.push(ConsistencyError::CountsExceedTotal {
                completed: self.completed_count,
                failed: self.failed_count,
                blocked: self.blocked_count,
                total: self.total_tasks,
            });
        }

        let (completed, failed, blocked) = self.actual_counts();
        for (field, recorded, actual) in [
            ("total_tasks", self.total_tasks, self.tasks.len()),
            ("completed_count", self.completed_count, completed),
            ("failed_count", self.failed_count, failed),
            ("blocked_count", self.blocked_count, blocked),
        ] {
            if recorded != actual {
                errors.push(ConsistencyError::CountMismatch {
                    field: field.to_string(),
                    recorded,
                    actual,
                });
            }
        }

        for task in &self.tasks {
            if task.status == TaskStatus::InProgress && self.current_task.as_ref() != Some(task.id())
            {
                errors.push(ConsistencyError::ConflictingStatus {
                    task: task.id().clone(),
                    status: task.status,
                    detail: "it is not the current task".to_string(),
                });
            }
            if task.status == TaskStatus::Completed
                && !task
                    .history
                    .iter()
                    .any(|a| a.outcome == AttemptOutcome::Succeeded)
            {
                errors.push(ConsistencyError::ConflictingStatus {
                    task: task.id().clone(),
                    status: task.status,
                    detail: "no attempt succeeded".to_string(),
                });
            }
        }

        let attempts: u32 = self.tasks.iter().map(|t| t.attempts).sum();
        if attempts > self.global_attempts {
            errors.push(ConsistencyError::CountMismatch {
                field: "global_attempts".to_string(),
                recorded: self.global_attempts as usize,
                actual: attempts as usize,
            });
        }

        errors
    }
}
