//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::app::EngineBuilder;
use keel_core::config::OrchestratorConfig;
use keel_core::domain::{Plan, TaskSpec};
use keel_core::impls::{MemoryPointStore, MemoryStateStore};
use keel_core::ports::{MemoryEventSink, TaskContext, TaskExecutor, TaskOutcome, TokioClock};

/// One scripted step of a task.
#[derive(Debug, Clone)]
pub enum Step {
    Outcome(TaskOutcome),
    /// Sleep, then succeed (for timeouts).
    Sleep(Duration),
    /// Never finish.
    Hang,
}

/// Executor that replays a script per task, then succeeds.
#[derive(Default)]
pub struct Scripted {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<(String, tokio::time::Instant)>>,
}

impl Scripted {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, task: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(task.to_string(), steps.into_iter().collect());
        self
    }

    pub fn fail(self, task: &str, error_id: &str, times: usize) -> Self {
        let steps = (0..times).map(|i| Step::Outcome(TaskOutcome::failure(error_id, format!("failure {}", i + 1))));
        self.script(task, steps)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn calls_for(&self, task: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(t, _)| t == task).count()
    }

    pub fn call_times(&self, task: &str) -> Vec<tokio::time::Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == task)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl TaskExecutor for Scripted {
    async fn execute(&self, ctx: &TaskContext) -> TaskOutcome {
        let step = {
            self.calls
                .lock()
                .unwrap()
                .push((ctx.task_id.to_string(), tokio::time::Instant::now()));
            self.scripts
                .lock()
                .unwrap()
                .get_mut(ctx.task_id.as_str())
                .and_then(|s| s.pop_front())
        };
        match step {
            None => TaskOutcome::Success,
            Some(Step::Outcome(outcome)) => outcome,
            Some(Step::Sleep(d)) => {
                tokio::time::sleep(d).await;
                TaskOutcome::Success
            }
            Some(Step::Hang) => std::future::pending().await,
        }
    }
}

/// Config with deterministic backoff and the given per-task / run ceilings.
pub fn config(max_per_task: u32, max_total: u32) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.retry.max_retries_per_task = max_per_task;
    config.retry.max_total_retries = max_total;
    config.retry.base_delay_ms = 1_000;
    config.retry.backoff_factor = 2.0;
    config.retry.jitter_ratio = 0.0;
    config.execution.unattended = true;
    config
}

pub fn chain(ids: &[&str]) -> Plan {
    let mut tasks: Vec<TaskSpec> = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        let mut spec = TaskSpec::new(*id);
        if i > 0 {
            spec = spec.depends_on(ids[i - 1]);
        }
        tasks.push(spec);
    }
    Plan::new(tasks)
}

pub struct Harness {
    pub state: Arc<MemoryStateStore>,
    pub points: Arc<MemoryPointStore>,
    pub sink: Arc<MemoryEventSink>,
    pub executor: Arc<Scripted>,
}

impl Harness {
    pub fn new(executor: Scripted) -> Self {
        Self {
            state: Arc::new(MemoryStateStore::new()),
            points: Arc::new(MemoryPointStore::new()),
            sink: Arc::new(MemoryEventSink::new()),
            executor: Arc::new(executor),
        }
    }

    /// Builder over in-memory stores and a clock that follows tokio time.
    pub fn builder(&self, config: OrchestratorConfig) -> EngineBuilder {
        EngineBuilder::new(config)
            .state_store(self.state.clone())
            .point_store(self.points.clone())
            .event_sink(self.sink.clone())
            .executor(self.executor.clone())
            .clock(Arc::new(TokioClock::new()))
    }
}
