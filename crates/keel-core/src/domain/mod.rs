//! Domain model (ids, run / task records, decisions, circuit state, escalations).
//!
//! ここは純粋なデータと状態遷移だけ。I/O は ports / impls 側。

pub mod attempt;
pub mod circuit;
pub mod decision;
pub mod errors;
pub mod escalation;
pub mod graph;
pub mod health;
pub mod ids;
pub mod plan;
pub mod recovery;
pub mod run;
pub mod state;
pub mod task;

pub use attempt::{AttemptOutcome, AttemptRecord, DecisionRecord};
pub use circuit::{Admission, CircuitPhase, CircuitState};
pub use decision::{Decider, DenyReason, RetryDecision};
pub use errors::{ErrorClass, TaskError};
pub use escalation::{
    Escalation, EscalationCause, OperatorCommand, ParseCommandError, RecoverTarget,
};
pub use graph::DependencyGraph;
pub use health::{HealthEvent, ResourceLevel, Severity};
pub use ids::{PointId, RunId};
pub use plan::{Plan, PlanError};
pub use recovery::{PointMetadata, RecoveryReason};
pub use run::{ConsistencyError, Run, RunOutcome, Scan};
pub use state::{RunStatus, TaskStatus};
pub use task::{TaskId, TaskRecord, TaskSpec};
