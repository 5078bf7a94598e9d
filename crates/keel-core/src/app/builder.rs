//! EngineBuilder - Engine / HealthMonitor / gateway の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装（ports は差し替え可能、未指定ならファイル実装）
//! - 起動時検証（Fail-fast 設計）
//! - StateStore は engine だけ、他には StateReader として渡す

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::engine::{Engine, Finished};
use super::health_monitor::HealthMonitor;
use super::intervention::{InterventionGateway, OperatorHandle};
use super::recovery::RecoveryManager;
use crate::config::{ConfigError, OrchestratorConfig};
use crate::domain::{ConsistencyError, Decider, DependencyGraph, Plan, Run, TaskId};
use crate::error::KeelError;
use crate::impls::{DirPointStore, FileStateStore, HEALTH_FILE, JOURNAL_FILE};
use crate::ports::{
    Clock, EventSink, HostProbe, HostSample, IdGenerator, NoopEventSink, PointStore,
    StateReader, StateStore, StaticProbe, SystemClock, TaskExecutor, UlidGenerator,
};

/// BuildError は構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("the plan has no tasks")]
    EmptyPlan,

    #[error("task '{0}' is defined more than once")]
    DuplicateTask(TaskId),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("dependency cycle: {}", render_cycle(.0))]
    Cycle(Vec<TaskId>),

    #[error("no task executor configured")]
    MissingExecutor,

    #[error("neither a plan nor a run to resume was given")]
    MissingRun,

    #[error("the run to resume is inconsistent: {0:?}")]
    Inconsistent(Vec<ConsistencyError>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn render_cycle(path: &[TaskId]) -> String {
    path.iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

enum Source {
    Plan(Plan),
    Resume(Run),
}

/// EngineBuilder は Orchestrator を構築
///
/// # 使用例
/// ```ignore
/// let orchestrator = EngineBuilder::new(config)
///     .plan(plan)
///     .executor(Arc::new(MyExecutor))
///     .build()?;
/// let outcome = orchestrator.run().await?;
/// ```
///
/// # Fail-fast 設計
/// - build() で plan を検証（空、重複、未知の依存、循環）
/// - executor がなければ BuildError
/// - 失敗した build は state を一切書かない
pub struct EngineBuilder {
    config: OrchestratorConfig,
    source: Option<Source>,
    state: Option<(Arc<dyn StateStore>, Arc<dyn StateReader>)>,
    points: Option<Arc<dyn PointStore>>,
    executor: Option<Arc<dyn TaskExecutor>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    sink: Option<Arc<dyn EventSink>>,
    probe: Option<Arc<dyn HostProbe>>,
    decider: Option<Arc<dyn Decider>>,
    cancel: Option<CancellationToken>,
    unattended: Option<bool>,
    escalation_file: Option<Option<PathBuf>>,
}

impl EngineBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            source: None,
            state: None,
            points: None,
            executor: None,
            clock: None,
            ids: None,
            sink: None,
            probe: None,
            decider: None,
            cancel: None,
            unattended: None,
            escalation_file: None,
        }
    }

    /// Start a new run from a plan.
    pub fn plan(mut self, plan: Plan) -> Self {
        self.source = Some(Source::Plan(plan));
        self
    }

    /// Continue a run loaded from the state store.
    pub fn resume_from(mut self, run: Run) -> Self {
        self.source = Some(Source::Resume(run));
        self
    }

    /// The same store becomes the engine's writer and every other component's reader.
    pub fn state_store<S: StateStore + 'static>(mut self, store: Arc<S>) -> Self {
        let reader: Arc<dyn StateReader> = store.clone();
        let writer: Arc<dyn StateStore> = store;
        self.state = Some((writer, reader));
        self
    }

    pub fn point_store(mut self, points: Arc<dyn PointStore>) -> Self {
        self.points = Some(points);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn host_probe(mut self, probe: Arc<dyn HostProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Replace the retry controller built from `[retry]`.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Overrides `execution.unattended`.
    pub fn unattended(mut self, unattended: bool) -> Self {
        self.unattended = Some(unattended);
        self
    }

    /// Where the pending escalation is persisted (`None` disables it).
    pub fn escalation_file(mut self, path: Option<PathBuf>) -> Self {
        self.escalation_file = Some(path);
        self
    }

    /// 検証してから組み立てる
    ///
    /// # 検証
    /// - config の値域
    /// - plan: 空でない、ID の重複なし、依存先が存在する、循環なし
    /// - resume: 保存済み run の整合性
    pub fn build(self) -> Result<Orchestrator, BuildError> {
        self.config.validate()?;
        let executor = self.executor.ok_or(BuildError::MissingExecutor)?;
        let source = self.source.ok_or(BuildError::MissingRun)?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));

        let file_backed = self.state.is_none();
        let (store, reader) = self.state.unwrap_or_else(|| {
            let store = Arc::new(FileStateStore::new(&self.config.state_dir));
            let reader: Arc<dyn StateReader> = store.clone();
            (store as Arc<dyn StateStore>, reader)
        });
        let points: Arc<dyn PointStore> = self.points.unwrap_or_else(|| {
            Arc::new(
                DirPointStore::new(self.config.points_dir())
                    .with_attachment(self.config.state_dir.join(JOURNAL_FILE))
                    .with_attachment(self.config.state_dir.join(HEALTH_FILE)),
            )
        });
        let sink: Arc<dyn EventSink> = self.sink.unwrap_or_else(|| Arc::new(NoopEventSink));
        let probe: Arc<dyn HostProbe> = self
            .probe
            .unwrap_or_else(|| Arc::new(StaticProbe::new(HostSample::default())));
        let decider: Arc<dyn Decider> = self
            .decider
            .unwrap_or_else(|| Arc::new(self.config.retry.controller()));
        let cancel = self.cancel.unwrap_or_default();
        let unattended = self.unattended.unwrap_or(self.config.execution.unattended);
        let escalation_file = self
            .escalation_file
            .unwrap_or_else(|| file_backed.then(|| self.config.escalation_path()));

        let run = match source {
            Source::Plan(plan) => {
                check_plan(&plan)?;
                let run = Run::new(ids.generate_run_id(), plan.tasks, clock.now());
                info!(run = %run.run_id, tasks = run.total_tasks, "new run");
                run
            }
            Source::Resume(run) => {
                let errors = reader.validate(&run);
                if !errors.is_empty() {
                    return Err(BuildError::Inconsistent(errors));
                }
                info!(run = %run.run_id, status = %run.status, "resuming run");
                run
            }
        };

        let (gateway, operator) = InterventionGateway::new(unattended, escalation_file);
        let monitor = HealthMonitor::new(
            self.config.health.clone(),
            self.config.execution.task_timeout_ms,
            Arc::clone(&reader),
            probe,
            Arc::clone(&clock),
            Arc::clone(&sink),
            gateway.handle(),
        );
        let recovery = RecoveryManager::new(
            points,
            reader,
            Arc::clone(&clock),
            ids,
            self.config.recovery.clone(),
        );
        let resources = monitor.resource_levels();
        let engine = Engine::new(
            run,
            store,
            recovery,
            decider,
            executor,
            gateway,
            sink,
            clock,
            resources,
            self.config,
            cancel,
        );

        Ok(Orchestrator {
            engine,
            monitor,
            operator: Some(operator),
        })
    }
}

/// Plan の静的検証
fn check_plan(plan: &Plan) -> Result<(), BuildError> {
    if plan.tasks.is_empty() {
        return Err(BuildError::EmptyPlan);
    }
    let mut known = HashSet::new();
    for spec in &plan.tasks {
        if !known.insert(&spec.id) {
            return Err(BuildError::DuplicateTask(spec.id.clone()));
        }
    }
    for spec in &plan.tasks {
        if let Some(dependency) = spec.depends_on.iter().find(|d| !known.contains(d)) {
            return Err(BuildError::UnknownDependency {
                task: spec.id.clone(),
                dependency: dependency.clone(),
            });
        }
    }
    if let Some(cycle) = DependencyGraph::from_specs(&plan.tasks).detect_cycle() {
        return Err(BuildError::Cycle(cycle));
    }
    Ok(())
}

/// How a run ended, with the final state.
#[derive(Debug)]
pub struct Outcome {
    pub finished: Finished,
    pub run: Run,
}

/// Orchestrator は engine と health monitor の組
///
/// monitor は engine と並行に別タスクで動き、engine が止まると止まる。
pub struct Orchestrator {
    engine: Engine,
    monitor: HealthMonitor,
    operator: Option<OperatorHandle>,
}

impl Orchestrator {
    /// Operator end of the gateway. If nobody takes it, every escalation is deferred.
    pub fn take_operator(&mut self) -> Option<OperatorHandle> {
        self.operator.take()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.engine.cancel_token()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Run the engine to its end with the monitor alongside.
    pub async fn run(mut self) -> Result<Outcome, KeelError> {
        drop(self.operator.take());

        let stop = CancellationToken::new();
        let monitor = self.monitor.spawn(stop.clone());
        let result = self.engine.run().await;
        stop.cancel();
        if let Err(e) = monitor.await {
            tracing::warn!(error = %e, "health monitor task failed");
        }

        let finished = result?;
        Ok(Outcome {
            finished,
            run: self.engine.run_state().clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskSpec;
    use crate::impls::{MemoryPointStore, MemoryStateStore};
    use crate::ports::{TaskContext, TaskOutcome};
    use async_trait::async_trait;
    use rstest::rstest;

    struct Succeed;

    #[async_trait]
    impl TaskExecutor for Succeed {
        async fn execute(&self, _ctx: &TaskContext) -> TaskOutcome {
            TaskOutcome::Success
        }
    }

    fn builder(plan: Plan) -> EngineBuilder {
        EngineBuilder::new(OrchestratorConfig::default())
            .plan(plan)
            .state_store(Arc::new(MemoryStateStore::new()))
            .point_store(Arc::new(MemoryPointStore::new()))
            .executor(Arc::new(Succeed))
    }

    #[test]
    fn test_build_success() {
        let plan = Plan::new(vec![TaskSpec::new("a"), TaskSpec::new("b").depends_on("a")]);
        let orchestrator = builder(plan).build().unwrap();
        assert_eq!(orchestrator.engine().run_state().total_tasks, 2);
    }

    #[rstest]
    #[case::empty(Plan::default(), "EmptyPlan")]
    #[case::duplicate(Plan::new(vec![TaskSpec::new("a"), TaskSpec::new("a")]), "DuplicateTask")]
    #[case::unknown(Plan::new(vec![TaskSpec::new("a").depends_on("ghost")]), "UnknownDependency")]
    #[case::cycle(
        Plan::new(vec![TaskSpec::new("a").depends_on("b"), TaskSpec::new("b").depends_on("a")]),
        "Cycle"
    )]
    fn test_build_rejects_bad_plans(#[case] plan: Plan, #[case] expected: &str) {
        let err = builder(plan).build().err().unwrap();
        assert!(format!("{err:?}").starts_with(expected), "{err:?}");
    }

    #[test]
    fn test_build_missing_executor() {
        let result = EngineBuilder::new(OrchestratorConfig::default())
            .plan(Plan::new(vec![TaskSpec::new("a")]))
            .state_store(Arc::new(MemoryStateStore::new()))
            .build();
        assert!(matches!(result, Err(BuildError::MissingExecutor)));
    }

    #[test]
    fn test_build_rejects_inconsistent_resume() {
        let plan = Plan::new(vec![TaskSpec::new("a")]);
        let mut run = builder(plan.clone()).build().unwrap().engine().run_state().clone();
        run.completed_count = 1;
        let result = builder(plan).resume_from(run).build();
        assert!(matches!(result, Err(BuildError::Inconsistent(_))));
    }
}
