//! Engine - 実行ループ（single writer）
//!
//! # 状態遷移
//! LOADING → READY → RUNNING ⇄ {RETRYING, BLOCKED} → COMPLETED | FAILED
//! （PAUSED / RECOVERING はどこからでも）
//!
//! # 1 タスクの流れ
//! 1. scan で前提タスクを確認。前提が失敗していれば BLOCKED
//! 2. pre-task recovery point
//! 3. circuit breaker に問い合わせ。OPEN なら executor を呼ばずに失敗扱い
//! 4. 実行（hard timeout 付き）
//! 5. 成功 → COMPLETED → post-task recovery point
//! 6. 失敗 → 分類 → Decider。retry なら on-error point → backoff 待ち → 2 へ。
//!    deny なら NEEDS_REVIEW → on-error point → gateway
//!
//! Run を書き換えるのはこの型だけ。カウンタ（attempts / global_attempts）の
//! increment もここだけで行う。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::breaker::{CircuitBreakers, Transition};
use super::intervention::{InterventionGateway, Resolution};
use super::recovery::RecoveryManager;
use crate::config::OrchestratorConfig;
use crate::domain::errors::ids;
use crate::domain::{
    Admission, Decider, DecisionRecord, DenyReason, ErrorClass, Escalation, EscalationCause,
    OperatorCommand, PointId, RecoverTarget, RecoveryReason, ResourceLevel, RetryDecision, Run,
    RunOutcome, RunStatus, TaskError, TaskId, TaskStatus,
};
use crate::error::KeelError;
use crate::policy::ErrorClassifier;
use crate::ports::{Clock, EventSink, StateStore, TaskContext, TaskExecutor, TaskOutcome};

/// Where the loop is, for logs. PAUSED / RECOVERING live on the run itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Loading,
    Ready,
    Running,
    Retrying,
    Blocked,
    Completed,
    Failed,
}

impl EnginePhase {
    pub fn name(self) -> &'static str {
        match self {
            EnginePhase::Loading => "LOADING",
            EnginePhase::Ready => "READY",
            EnginePhase::Running => "RUNNING",
            EnginePhase::Retrying => "RETRYING",
            EnginePhase::Blocked => "BLOCKED",
            EnginePhase::Completed => "COMPLETED",
            EnginePhase::Failed => "FAILED",
        }
    }
}

/// Why `Engine::run` returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finished {
    Completed,
    /// Nothing runnable is left, but these tasks did not complete.
    Failed {
        unresolved: Vec<(TaskId, TaskStatus)>,
    },
    Paused {
        point: Option<PointId>,
    },
    Aborted {
        reason: String,
    },
    /// A task reported STATE_CORRUPTION; the run was halted.
    StateCorrupted {
        detail: String,
    },
    /// A recovery point could not be written and nobody decided what to do.
    Recovering {
        detail: String,
    },
}

impl Finished {
    pub fn run_status(&self) -> RunStatus {
        match self {
            Finished::Completed => RunStatus::Completed,
            Finished::Paused { .. } => RunStatus::Paused,
            Finished::Recovering { .. } => RunStatus::Recovering,
            Finished::Failed { .. } | Finished::Aborted { .. } | Finished::StateCorrupted { .. } => {
                RunStatus::Failed
            }
        }
    }
}

/// What the caller should do next.
#[derive(Debug)]
enum Flow {
    /// Carry on with the current step.
    Proceed,
    /// The live state changed under us (restore); go back to the scan.
    Reschedule,
    Stop(Finished),
}

/// Result of one failed or rejected attempt.
enum Next {
    /// Attempt the same task again; the backoff already elapsed.
    Again(Duration),
    Done(Flow),
}

pub struct Engine {
    run: Run,
    store: Arc<dyn StateStore>,
    recovery: RecoveryManager,
    decider: Arc<dyn Decider>,
    classifier: ErrorClassifier,
    breakers: CircuitBreakers,
    executor: Arc<dyn TaskExecutor>,
    gateway: InterventionGateway,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    resources: watch::Receiver<ResourceLevel>,
    config: OrchestratorConfig,
    cancel: CancellationToken,
    last_point: Option<PointId>,
    completed_since_periodic: u32,
    phase: EnginePhase,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run: Run,
        store: Arc<dyn StateStore>,
        recovery: RecoveryManager,
        decider: Arc<dyn Decider>,
        executor: Arc<dyn TaskExecutor>,
        gateway: InterventionGateway,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        resources: watch::Receiver<ResourceLevel>,
        config: OrchestratorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run,
            store,
            recovery,
            decider,
            classifier: config.classifier(),
            breakers: CircuitBreakers::new(config.circuit.clone()),
            executor,
            gateway,
            sink,
            clock,
            resources,
            config,
            cancel,
            last_point: None,
            completed_since_periodic: 0,
            phase: EnginePhase::Loading,
        }
    }

    /// The live run (what was last saved, plus nothing).
    pub fn run_state(&self) -> &Run {
        &self.run
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive the run until it completes, fails, pauses or is aborted.
    pub async fn run(&mut self) -> Result<Finished, KeelError> {
        let result = self.drive().await;
        self.gateway.finished(self.run.status);
        match &result {
            Ok(finished) => info!(run = %self.run.run_id, status = %self.run.status, ?finished, "engine stopped"),
            Err(e) => error!(run = %self.run.run_id, error = %e, "engine stopped on error"),
        }
        result
    }

    async fn drive(&mut self) -> Result<Finished, KeelError> {
        self.enter(EnginePhase::Loading);
        if self.last_point.is_none() {
            match self.recovery.latest().await {
                Ok(latest) => self.last_point = latest.map(|m| m.id),
                Err(e) => warn!(error = %e, "could not list recovery points"),
            }
        }

        self.run.normalize_for_resume(self.clock.now());
        self.run.status = RunStatus::Running;
        self.run.outcome = None;
        self.save().await?;
        info!(
            run = %self.run.run_id,
            tasks = self.run.total_tasks,
            completed = self.run.completed_count,
            global_attempts = self.run.global_attempts,
            "run started"
        );
        self.enter(EnginePhase::Ready);

        loop {
            if self.cancel.is_cancelled() {
                return self.pause().await;
            }
            if let Some(command) = self.gateway.try_command().await {
                if let Flow::Stop(finished) = self.apply(command).await? {
                    return Ok(finished);
                }
                continue;
            }

            let scan = self.run.scan();
            if self.run.apply_scan(&scan) {
                for &i in &scan.newly_blocked {
                    warn!(task = %self.run.tasks[i].id(), "task blocked by a prerequisite that will not complete");
                }
                for &i in &scan.released {
                    info!(task = %self.run.tasks[i].id(), "blocked task released");
                }
                if !scan.newly_blocked.is_empty() {
                    self.enter(EnginePhase::Blocked);
                }
                self.save().await?;
            }

            let Some(index) = scan.next else {
                return self.settle().await;
            };
            if let Flow::Stop(finished) = self.run_task(index).await? {
                return Ok(finished);
            }
        }
    }

    async fn run_task(&mut self, index: usize) -> Result<Flow, KeelError> {
        let id = self.run.tasks[index].id().clone();
        let operation = self.run.tasks[index].spec.operation.clone();
        let mut delay = Duration::ZERO;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(Flow::Stop(self.pause().await?));
            }
            if !self.decider.admits_attempt(self.run.global_attempts) {
                let detail = format!("run attempts exhausted: {}", self.run.global_attempts);
                return self.give_up(index, DenyReason::GlobalLimitExceeded, detail).await;
            }

            self.run.current_task = Some(id.clone());
            self.run.tasks[index].mark_ready();
            self.save().await?;
            self.enter(EnginePhase::Running);
            match self.checkpoint(RecoveryReason::PreTask, Some(&id)).await? {
                Flow::Proceed => {}
                other => return Ok(other),
            }

            let now = self.clock.now();
            let (admission, transition) = self.breakers.admit(&operation, now);
            if let Some(transition) = transition {
                self.journal_circuit(&operation, transition, &id).await;
            }
            if let Admission::Rejected { retry_at } = admission {
                match self.reject(index, &operation, retry_at).await? {
                    Next::Again(wait) => {
                        delay = wait;
                        continue;
                    }
                    Next::Done(flow) => return Ok(flow),
                }
            }

            let attempt = {
                let task = &mut self.run.tasks[index];
                task.start_attempt(now, delay.as_millis() as u64);
                task.attempts
            };
            self.run.global_attempts += 1;
            self.save().await?;
            info!(task = %id, attempt, operation = %operation, "attempt started");

            let spec = &self.run.tasks[index].spec;
            let timeout = self.config.task_timeout(spec.timeout_ms);
            let ctx = TaskContext {
                run_id: self.run.run_id,
                task_id: id.clone(),
                attempt,
                operation: operation.clone(),
                payload: spec.payload.clone(),
                timeout,
            };
            let executor = Arc::clone(&self.executor);
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => None,
                result = tokio::time::timeout(timeout, executor.execute(&ctx)) => Some(result),
            };

            let (error_id, message, timed_out) = match outcome {
                None => {
                    self.run.tasks[index].interrupt(self.clock.now());
                    self.breakers.release(&operation);
                    warn!(task = %id, attempt, "attempt interrupted by cancellation");
                    return Ok(Flow::Stop(self.pause().await?));
                }
                Some(Ok(TaskOutcome::Success)) => return self.succeed(index, &operation).await,
                Some(Ok(TaskOutcome::Failure { error_id, message })) => (error_id, message, false),
                Some(Err(_)) => (
                    ids::TIMEOUT.to_string(),
                    format!("no result within {timeout:?}"),
                    true,
                ),
            };
            match self.fail(index, &operation, error_id, message, timed_out).await? {
                Next::Again(wait) => delay = wait,
                Next::Done(flow) => return Ok(flow),
            }
        }
    }

    async fn succeed(&mut self, index: usize, operation: &str) -> Result<Flow, KeelError> {
        let now = self.clock.now();
        let transition = self.breakers.record_success(operation);

        let task = &mut self.run.tasks[index];
        task.complete(now);
        let id = task.id().clone();
        let attempts = task.attempts;
        self.run.current_task = None;
        self.run.refresh_counts();
        self.save().await?;
        info!(
            task = %id,
            attempts,
            completed = self.run.completed_count,
            total = self.run.total_tasks,
            "task completed"
        );
        if let Some(transition) = transition {
            self.journal_circuit(operation, transition, &id).await;
        }

        match self.checkpoint(RecoveryReason::PostTask, Some(&id)).await? {
            Flow::Proceed => {}
            other => return Ok(other),
        }
        let every = self.config.recovery.periodic_every_tasks;
        if every > 0 {
            self.completed_since_periodic += 1;
            if self.completed_since_periodic >= every {
                self.completed_since_periodic = 0;
                match self.checkpoint(RecoveryReason::Periodic, None).await? {
                    Flow::Proceed => {}
                    other => return Ok(other),
                }
            }
        }
        Ok(Flow::Proceed)
    }

    async fn fail(
        &mut self,
        index: usize,
        operation: &str,
        error_id: String,
        message: String,
        timed_out: bool,
    ) -> Result<Next, KeelError> {
        let now = self.clock.now();
        let class = self.classifier.classify(&error_id);
        let transition = match class {
            ErrorClass::Transient | ErrorClass::Resource => self.breakers.record_failure(operation, now),
            // the dependency answered; the request itself was refused
            ErrorClass::Permanent => self.breakers.record_success(operation),
            ErrorClass::StateCorruption => None,
        };

        let error = TaskError::new(error_id, class, message);
        let task = &mut self.run.tasks[index];
        task.fail_attempt(now, error.clone(), timed_out);
        let id = task.id().clone();
        let attempt = task.attempts;
        warn!(task = %id, attempt, error_id = %error.error_id, class = %class, timed_out, "attempt failed");
        if let Some(transition) = transition {
            self.journal_circuit(operation, transition, &id).await;
        }

        if class == ErrorClass::StateCorruption {
            return Ok(Next::Done(self.halt_corrupted(index, &error).await?));
        }

        let decision = self
            .decider
            .decide(&self.run.tasks[index], class, self.run.global_attempts);
        self.journal_retry(&id, &error, &decision, now).await;

        match decision {
            RetryDecision::Retry { delay, reason } => {
                info!(task = %id, delay_ms = delay.as_millis() as u64, %reason, "retry scheduled");
                self.enter(EnginePhase::Retrying);
                self.save().await?;
                match self.checkpoint(RecoveryReason::OnError, Some(&id)).await? {
                    Flow::Proceed => {}
                    other => return Ok(Next::Done(other)),
                }
                if class == ErrorClass::Resource && !self.wait_for_resources().await {
                    return Ok(Next::Done(Flow::Stop(self.pause().await?)));
                }
                if !self.sleep(delay).await {
                    return Ok(Next::Done(Flow::Stop(self.pause().await?)));
                }
                Ok(Next::Again(delay))
            }
            RetryDecision::Deny { reason, detail } => {
                Ok(Next::Done(self.give_up(index, reason, detail).await?))
            }
        }
    }

    /// The circuit refused the attempt: a failure without calling the executor.
    async fn reject(
        &mut self,
        index: usize,
        operation: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<Next, KeelError> {
        let now = self.clock.now();
        let error = TaskError::new(
            ids::CIRCUIT_OPEN,
            ErrorClass::Transient,
            format!("circuit '{operation}' is open until {}", retry_at.to_rfc3339()),
        );
        let task = &mut self.run.tasks[index];
        task.record_rejection(now, error.clone());
        let id = task.id().clone();
        warn!(task = %id, operation, retry_at = %retry_at, "attempt rejected by open circuit");

        let decision = self
            .decider
            .decide(&self.run.tasks[index], ErrorClass::Transient, self.run.global_attempts);
        self.journal_retry(&id, &error, &decision, now).await;

        match decision {
            RetryDecision::Retry { delay, .. } => {
                // the circuit admits a probe strictly after retry_at
                let until_probe = (retry_at - now + ChronoDuration::milliseconds(1))
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                let wait = delay.max(until_probe);
                self.enter(EnginePhase::Retrying);
                self.save().await?;
                match self.checkpoint(RecoveryReason::OnError, Some(&id)).await? {
                    Flow::Proceed => {}
                    other => return Ok(Next::Done(other)),
                }
                if !self.sleep(wait).await {
                    return Ok(Next::Done(Flow::Stop(self.pause().await?)));
                }
                Ok(Next::Again(wait))
            }
            RetryDecision::Deny { reason, detail } => {
                Ok(Next::Done(self.give_up(index, reason, detail).await?))
            }
        }
    }

    /// Retry denied: NEEDS_REVIEW, on-error point, hand off to the operator.
    async fn give_up(
        &mut self,
        index: usize,
        reason: DenyReason,
        detail: String,
    ) -> Result<Flow, KeelError> {
        let task = &mut self.run.tasks[index];
        task.mark_needs_review();
        let id = task.id().clone();
        self.run.current_task = None;
        self.run.refresh_counts();
        self.save().await?;
        warn!(task = %id, %reason, %detail, "retry denied, task needs review");
        self.enter(EnginePhase::Blocked);

        match self.checkpoint(RecoveryReason::OnError, Some(&id)).await? {
            Flow::Proceed => {}
            other => return Ok(other),
        }
        let escalation = self.escalation(EscalationCause::RetryDenied { reason }, Some(&id));
        match self.gateway.escalate(escalation, &self.cancel).await {
            Resolution::Command(command) => self.apply(command).await,
            Resolution::Deferred => Ok(Flow::Proceed),
            Resolution::Cancelled => Ok(Flow::Stop(self.pause().await?)),
        }
    }

    async fn halt_corrupted(&mut self, index: usize, error: &TaskError) -> Result<Flow, KeelError> {
        let task = &mut self.run.tasks[index];
        task.mark_needs_review();
        let id = task.id().clone();
        let detail = error.to_string();

        self.run.current_task = None;
        self.run.status = RunStatus::Failed;
        self.run.outcome = Some(RunOutcome::Aborted {
            reason: format!("state corruption: {detail}"),
        });
        self.run.refresh_counts();
        self.save().await?;
        self.enter(EnginePhase::Failed);

        let escalation = self.escalation(
            EscalationCause::StateCorrupted {
                detail: detail.clone(),
            },
            Some(&id),
        );
        self.gateway.report(escalation).await;
        Ok(Flow::Stop(Finished::StateCorrupted { detail }))
    }

    /// Take a recovery point, then apply retention. A failure never passes
    /// silently: the run goes RECOVERING and the operator decides.
    async fn checkpoint(
        &mut self,
        reason: RecoveryReason,
        task: Option<&TaskId>,
    ) -> Result<Flow, KeelError> {
        loop {
            let detail = match self.recovery.create(reason, task.cloned(), None).await {
                Ok(meta) => {
                    self.last_point = Some(meta.id);
                    if let Err(e) = self.recovery.prune().await {
                        warn!(error = %e, "recovery point pruning failed");
                    }
                    return Ok(Flow::Proceed);
                }
                Err(e) => e.to_string(),
            };
            error!(%reason, task = ?task, error = %detail, "recovery point failed, run is recovering");

            let previous = self.run.status;
            self.run.status = RunStatus::Recovering;
            self.save().await?;
            let escalation = self.escalation(
                EscalationCause::CheckpointFailed {
                    detail: detail.clone(),
                },
                task,
            );
            match self.gateway.escalate(escalation, &self.cancel).await {
                Resolution::Command(
                    OperatorCommand::Resume | OperatorCommand::Retry(_) | OperatorCommand::Skip(_),
                ) => {
                    info!(%reason, "retrying recovery point");
                    self.run.status = previous;
                    self.save().await?;
                }
                Resolution::Command(command) => {
                    self.run.status = previous;
                    return self.apply(command).await;
                }
                Resolution::Deferred => return Ok(Flow::Stop(Finished::Recovering { detail })),
                Resolution::Cancelled => return Ok(Flow::Stop(self.pause().await?)),
            }
        }
    }

    async fn apply(&mut self, command: OperatorCommand) -> Result<Flow, KeelError> {
        match command {
            OperatorCommand::Resume => {
                info!("operator resumed the run");
                Ok(Flow::Proceed)
            }
            OperatorCommand::Retry(id) => {
                self.override_retry(&id).await?;
                Ok(Flow::Proceed)
            }
            OperatorCommand::Skip(id) => {
                self.skip(&id).await?;
                Ok(Flow::Proceed)
            }
            OperatorCommand::Recover(target) => self.recover(target).await,
            OperatorCommand::Pause => Ok(Flow::Stop(self.pause().await?)),
            OperatorCommand::Abort => Ok(Flow::Stop(self.abort("aborted by operator").await?)),
        }
    }

    /// Fresh attempt budget for one task. The run-wide ceiling still applies.
    async fn override_retry(&mut self, id: &TaskId) -> Result<(), KeelError> {
        let Some(index) = self.run.index_of(id) else {
            warn!(task = %id, "override for unknown task ignored");
            return Ok(());
        };
        let task = &mut self.run.tasks[index];
        let previous = task.status;
        if matches!(previous, TaskStatus::Completed | TaskStatus::InProgress) {
            warn!(task = %id, status = %previous, "override ignored");
            return Ok(());
        }
        task.reset_for_override();
        let overrides = task.overrides;
        self.run.refresh_counts();
        self.save().await?;
        warn!(task = %id, from = %previous, overrides, "operator override: task gets a fresh attempt budget");

        let record = DecisionRecord::new(
            self.clock.now(),
            Some(id.clone()),
            json!({ "status": previous }),
            "operator",
            "override_retry",
        )
        .with_context(json!({
            "overrides": overrides,
            "global_attempts": self.run.global_attempts,
        }));
        self.sink.decision(&record).await;
        Ok(())
    }

    async fn skip(&mut self, id: &TaskId) -> Result<(), KeelError> {
        let Some(index) = self.run.index_of(id) else {
            warn!(task = %id, "skip for unknown task ignored");
            return Ok(());
        };
        let task = &mut self.run.tasks[index];
        let previous = task.status;
        if previous == TaskStatus::Completed {
            warn!(task = %id, "skip ignored, task already completed");
            return Ok(());
        }
        task.mark_failed();
        if self.run.current_task.as_ref() == Some(id) {
            self.run.current_task = None;
        }
        self.run.refresh_counts();
        self.save().await?;
        warn!(task = %id, from = %previous, "operator accepted the failure");

        let record = DecisionRecord::new(
            self.clock.now(),
            Some(id.clone()),
            json!({ "status": previous }),
            "operator",
            "skip",
        );
        self.sink.decision(&record).await;
        Ok(())
    }

    /// Replace the live state with a recovery point.
    async fn recover(&mut self, target: RecoverTarget) -> Result<Flow, KeelError> {
        self.run.status = RunStatus::Recovering;
        self.save().await?;

        match self.recovery.restore_target(target).await {
            Ok(restored) => {
                let spent = self.run.global_attempts;
                let mut run = restored.run;
                run.normalize_for_resume(self.clock.now());
                // a restore never refunds attempts already spent
                run.global_attempts = run.global_attempts.max(spent);
                run.status = RunStatus::Running;
                run.outcome = None;
                self.run = run;
                self.last_point = Some(restored.point.id);
                self.save().await?;
                warn!(point = %restored.point.id, next = ?restored.next_task, "live state replaced from recovery point");

                let record = DecisionRecord::new(
                    self.clock.now(),
                    None,
                    json!({ "target": target }),
                    "operator",
                    "recover",
                )
                .with_context(json!({ "point": restored.point.id }));
                self.sink.decision(&record).await;
            }
            Err(e) => {
                error!(error = %e, "restore failed, keeping the live state");
                self.run.status = RunStatus::Running;
                self.save().await?;
            }
        }
        Ok(Flow::Reschedule)
    }

    async fn pause(&mut self) -> Result<Finished, KeelError> {
        self.save().await?;
        let current = self.run.current_task.clone();
        let point = match self
            .recovery
            .create(RecoveryReason::Manual, current, Some("pause".to_string()))
            .await
        {
            Ok(meta) => {
                self.last_point = Some(meta.id);
                Some(meta.id)
            }
            Err(e) => {
                error!(error = %e, "could not take the pause recovery point");
                None
            }
        };
        self.run.status = RunStatus::Paused;
        self.save().await?;
        info!(run = %self.run.run_id, point = ?point, "run paused");
        Ok(Finished::Paused { point })
    }

    async fn abort(&mut self, reason: &str) -> Result<Finished, KeelError> {
        self.run.current_task = None;
        self.run.status = RunStatus::Failed;
        self.run.outcome = Some(RunOutcome::Aborted {
            reason: reason.to_string(),
        });
        self.save().await?;
        self.enter(EnginePhase::Failed);
        warn!(run = %self.run.run_id, reason, "run aborted");
        Ok(Finished::Aborted {
            reason: reason.to_string(),
        })
    }

    async fn settle(&mut self) -> Result<Finished, KeelError> {
        let status = self.run.settle(self.clock.now());
        self.save().await?;
        if status == RunStatus::Completed {
            self.enter(EnginePhase::Completed);
            info!(run = %self.run.run_id, tasks = self.run.total_tasks, attempts = self.run.global_attempts, "run completed");
            return Ok(Finished::Completed);
        }
        let unresolved = self.run.unresolved();
        self.enter(EnginePhase::Failed);
        warn!(run = %self.run.run_id, unresolved = unresolved.len(), "run failed with unresolved tasks");
        Ok(Finished::Failed { unresolved })
    }

    fn escalation(&self, cause: EscalationCause, task: Option<&TaskId>) -> Escalation {
        let mut escalation = Escalation::new(self.run.run_id, self.clock.now(), cause);
        if let Some(task) = task.and_then(|id| self.run.task(id)) {
            escalation.task_id = Some(task.id().clone());
            escalation.class = task.last_error.as_ref().map(|e| e.class);
            escalation.error = task.last_error.clone();
            escalation.history = task.history.clone();
        }
        escalation.last_point = self.last_point;
        escalation
    }

    /// False if cancelled first.
    async fn sleep(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return true;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Wait until the monitor reports resources back to normal. False if cancelled first.
    async fn wait_for_resources(&mut self) -> bool {
        if *self.resources.borrow() == ResourceLevel::Ok {
            return true;
        }
        info!("waiting for host resources to recover");
        let resources = &mut self.resources;
        let cancel = &self.cancel;
        tokio::select! {
            _ = cancel.cancelled() => false,
            changed = async { resources.wait_for(|level| *level == ResourceLevel::Ok).await.map(|_| ()) } => {
                if changed.is_err() {
                    warn!("health monitor is gone, not waiting for resources");
                }
                true
            }
        }
    }

    async fn save(&mut self) -> Result<(), KeelError> {
        self.run.updated_at = self.clock.now();
        self.store.save(&self.run).await?;
        Ok(())
    }

    fn enter(&mut self, phase: EnginePhase) {
        if self.phase != phase {
            debug!(from = self.phase.name(), to = phase.name(), "engine phase");
            self.phase = phase;
        }
    }

    async fn journal_retry(
        &self,
        id: &TaskId,
        error: &TaskError,
        decision: &RetryDecision,
        at: DateTime<Utc>,
    ) {
        let attempts = self.run.task(id).map(|t| t.attempts).unwrap_or_default();
        let verdict = if decision.allow() {
            "schedule_retry"
        } else {
            "needs_review"
        };
        let record = DecisionRecord::new(
            at,
            Some(id.clone()),
            json!({
                "error_id": error.error_id,
                "class": error.class,
                "attempts": attempts,
            }),
            "retry_controller",
            verdict,
        )
        .with_context(json!({
            "reason": decision.reason(),
            "delay_ms": decision.delay().as_millis() as u64,
            "global_attempts": self.run.global_attempts,
        }));
        self.sink.decision(&record).await;
    }

    async fn journal_circuit(&self, operation: &str, transition: Transition, id: &TaskId) {
        let verdict = match transition.to {
            "OPEN" => "open_circuit",
            "HALF_OPEN" => "probe_circuit",
            _ => "close_circuit",
        };
        let record = DecisionRecord::new(
            self.clock.now(),
            Some(id.clone()),
            json!({ "operation": operation, "from": transition.from }),
            "circuit_breaker",
            verdict,
        );
        self.sink.decision(&record).await;
    }
}
