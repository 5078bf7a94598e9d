//! End-to-end behaviour of the orchestrator over in-memory stores.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{Harness, Scripted, Step, chain, config};
use keel_core::app::{HealthMonitor, InterventionGateway, Notice};
use keel_core::domain::health::metrics;
use keel_core::domain::{
    AttemptOutcome, ErrorClass, Plan, RecoveryReason, Run, RunId, RunStatus, Severity, TaskId,
    TaskSpec, TaskStatus,
};
use keel_core::impls::{FileStateStore, MemoryStateStore};
use keel_core::ports::{
    HostSample, LoadSource, ManualClock, MemoryEventSink, PointStore, StateReader, StateStore,
    StaticProbe,
};
use keel_core::Finished;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

#[tokio::test(start_paused = true)]
async fn transient_failures_then_success_complete_the_task() {
    let h = Harness::new(Scripted::new().fail("fetch", "network", 2));
    let outcome = h
        .builder(config(3, 100))
        .plan(chain(&["fetch"]))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.finished, Finished::Completed);
    let task = &outcome.run.tasks[0];
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 3);
    assert_eq!(outcome.run.status, RunStatus::Completed);
    assert_eq!(h.executor.calls_for("fetch"), 3);

    let delays: Vec<u64> = task.history.iter().map(|a| a.delay_ms).collect();
    assert_eq!(delays, vec![0, 1_000, 2_000]);
}

#[tokio::test(start_paused = true)]
async fn retries_exhausted_leave_task_for_review_with_on_error_point() {
    let h = Harness::new(Scripted::new().fail("fetch", "network", 4));
    let outcome = h
        .builder(config(3, 100))
        .plan(chain(&["fetch", "build"]))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    let fetch = &outcome.run.tasks[0];
    assert_eq!(fetch.status, TaskStatus::NeedsReview);
    assert_eq!(fetch.attempts, 3);
    assert_eq!(outcome.run.tasks[1].status, TaskStatus::Blocked);
    assert_eq!(h.executor.calls_for("build"), 0);

    assert!(matches!(
        &outcome.finished,
        Finished::Failed { unresolved } if unresolved.len() == 2
    ));
    assert_eq!(outcome.run.status, RunStatus::Failed);

    let points = h.points.list().await.unwrap();
    assert!(points.iter().any(|p| p.reason == RecoveryReason::OnError
        && p.task_id == Some(TaskId::new("fetch"))
        && p.run_status == RunStatus::Running));
}

#[tokio::test(start_paused = true)]
async fn failing_attempts_keep_the_point_directory_bounded() {
    let h = Harness::new(Scripted::new().fail("fetch", "network", 3));
    let mut cfg = config(3, 100);
    cfg.recovery.keep_last = 2;
    cfg.recovery.on_error_retention_ms = 0;

    let outcome = h
        .builder(cfg)
        .plan(chain(&["fetch"]))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(outcome.run.tasks[0].status, TaskStatus::NeedsReview);

    // three pre-task and three on-error points were taken; only the last pair survives
    let points = h.points.list().await.unwrap();
    let reasons: Vec<RecoveryReason> = points.iter().map(|p| p.reason).collect();
    assert_eq!(reasons, vec![RecoveryReason::PreTask, RecoveryReason::OnError]);
}

#[tokio::test(start_paused = true)]
async fn open_circuit_rejects_without_calling_the_executor() {
    let h = Harness::new(Scripted::new().fail("sync", "rate_limit", 5));
    let mut cfg = config(10, 100);
    cfg.circuit.failure_threshold = 5;
    cfg.circuit.reset_timeout_ms = 60_000;

    let plan = Plan::new(vec![TaskSpec::new("sync").operation("github-api")]);
    let outcome = h.builder(cfg).plan(plan).build().unwrap().run().await.unwrap();

    assert_eq!(outcome.finished, Finished::Completed);
    let sync = &outcome.run.tasks[0];
    // five failures, the probe that succeeded; the rejection never reached the executor
    assert_eq!(h.executor.calls_for("sync"), 6);
    assert_eq!(sync.attempts, 6);
    assert_eq!(sync.history[5].outcome, AttemptOutcome::Rejected);
    assert_eq!(
        sync.history[5].error.as_ref().map(|e| e.error_id.as_str()),
        Some("circuit_open")
    );
    assert_eq!(sync.history[6].outcome, AttemptOutcome::Succeeded);

    // the probe waited out the reset timeout after the fifth failure
    let calls = h.executor.call_times("sync");
    assert!(calls[5] - calls[4] > Duration::from_secs(60));

    let decisions = h.sink.decisions();
    assert!(decisions.iter().any(|d| d.decision == "open_circuit"));
    assert!(decisions.iter().any(|d| d.decision == "close_circuit"));
}

#[tokio::test]
async fn missing_primary_falls_back_to_backup() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStateStore::new(dir.path());
    let run = Run::new(
        RunId::from_ulid(Ulid::new()),
        vec![TaskSpec::new("a"), TaskSpec::new("b").depends_on("a")],
        Utc::now(),
    );
    store.save(&run).await.unwrap();
    store.save(&run).await.unwrap();

    tokio::fs::remove_file(store.primary_path()).await.unwrap();

    let (loaded, source) = store.load_with_source().await.unwrap();
    assert_eq!(source, LoadSource::Backup);
    assert_eq!(loaded, run);
}

#[tokio::test(start_paused = true)]
async fn stuck_task_reaches_the_operator_within_one_interval() {
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let state = Arc::new(MemoryStateStore::new());

    let mut run = Run::new(
        RunId::from_ulid(Ulid::new()),
        vec![TaskSpec::new("deploy")],
        start,
    );
    run.current_task = Some(TaskId::new("deploy"));
    run.tasks[0].start_attempt(start, 0);
    run.global_attempts = 1;
    state.save(&run).await.unwrap();
    // three times the task's 1s timeout
    clock.advance(Duration::from_millis(3_000));

    let mut cfg = config(3, 100);
    cfg.health.interval_ms = 5_000;
    let (gateway, mut operator) = InterventionGateway::new(false, None);
    let sink = Arc::new(MemoryEventSink::new());
    let monitor = HealthMonitor::new(
        cfg.health.clone(),
        1_000,
        state.clone(),
        Arc::new(StaticProbe::default()),
        clock.clone(),
        sink.clone(),
        gateway.handle(),
    );

    let cancel = CancellationToken::new();
    let handle = monitor.spawn(cancel.clone());
    let notice = tokio::time::timeout(cfg.health.interval(), operator.next_notice())
        .await
        .expect("notified within one interval");

    match notice {
        Some(Notice::Health(event)) => {
            assert_eq!(event.severity, Severity::Critical);
            assert_eq!(event.metric, metrics::STUCK_TASK);
            assert_eq!(event.task_id, Some(TaskId::new("deploy")));
        }
        other => panic!("unexpected notice: {other:?}"),
    }
    cancel.cancel();
    handle.await.unwrap();
    assert!(sink
        .health_events()
        .iter()
        .any(|e| e.severity == Severity::Critical && e.metric == metrics::STUCK_TASK));
}

#[tokio::test(start_paused = true)]
async fn attempt_ceilings_hold_when_everything_fails() {
    let h = Harness::new(
        Scripted::new()
            .fail("a", "network", 100)
            .fail("b", "network", 100)
            .fail("c", "network", 100),
    );
    let plan = Plan::new(vec![
        TaskSpec::new("a"),
        TaskSpec::new("b"),
        TaskSpec::new("c"),
    ]);
    let outcome = h
        .builder(config(3, 5))
        .plan(plan)
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    let run = &outcome.run;
    let total: u32 = run.tasks.iter().map(|t| t.attempts).sum();
    assert!(total <= 5, "dispatched {total} attempts");
    assert_eq!(run.global_attempts, total);
    assert!(run.tasks.iter().all(|t| t.attempts <= 3));
    assert_eq!(h.executor.calls().len() as u32, total);
    assert!(run.tasks.iter().all(|t| t.status == TaskStatus::NeedsReview));
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_skips_retry_and_blocks_only_dependents() {
    let h = Harness::new(Scripted::new().fail("validate", "validation", 1));
    let plan = Plan::new(vec![
        TaskSpec::new("validate"),
        TaskSpec::new("publish").depends_on("validate"),
        TaskSpec::new("notify"),
    ]);
    let outcome = h
        .builder(config(3, 100))
        .plan(plan)
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    let run = &outcome.run;
    assert_eq!(run.tasks[0].status, TaskStatus::NeedsReview);
    assert_eq!(run.tasks[0].attempts, 1);
    assert_eq!(
        run.tasks[0].last_error.as_ref().map(|e| e.class),
        Some(ErrorClass::Permanent)
    );
    assert_eq!(run.tasks[1].status, TaskStatus::Blocked);
    assert_eq!(run.tasks[2].status, TaskStatus::Completed);
    assert_eq!(h.executor.calls(), vec!["validate", "notify"]);

    let denial = h
        .sink
        .decisions()
        .into_iter()
        .find(|d| d.decision == "needs_review")
        .unwrap();
    assert_eq!(denial.context.unwrap()["reason"], "NON_RETRYABLE_ERROR");
}

#[tokio::test(start_paused = true)]
async fn hard_timeout_is_retried_as_transient() {
    let h = Harness::new(Scripted::new().script("slow", [Step::Sleep(Duration::from_secs(30))]));
    let plan = Plan::new(vec![TaskSpec {
        timeout_ms: Some(1_000),
        ..TaskSpec::new("slow")
    }]);
    let outcome = h
        .builder(config(3, 100))
        .plan(plan)
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    let slow = &outcome.run.tasks[0];
    assert_eq!(slow.status, TaskStatus::Completed);
    assert_eq!(slow.attempts, 2);
    assert_eq!(slow.history[0].outcome, AttemptOutcome::TimedOut);
    assert_eq!(
        slow.history[0].error.as_ref().map(|e| (e.error_id.as_str(), e.class)),
        Some(("timeout", ErrorClass::Transient))
    );
}

#[tokio::test(start_paused = true)]
async fn state_corruption_halts_the_run() {
    let h = Harness::new(Scripted::new().fail("migrate", "state_corruption", 1));
    let outcome = h
        .builder(config(3, 100))
        .plan(chain(&["migrate", "verify"]))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert!(matches!(outcome.finished, Finished::StateCorrupted { .. }));
    assert_eq!(outcome.run.status, RunStatus::Failed);
    assert_eq!(outcome.run.tasks[0].status, TaskStatus::NeedsReview);
    assert_eq!(outcome.run.tasks[0].attempts, 1);
    assert_eq!(h.executor.calls_for("verify"), 0);
    assert!(!h.sink.decisions().iter().any(|d| d.decision == "schedule_retry"));
}

#[tokio::test(start_paused = true)]
async fn failed_recovery_point_stops_in_recovering() {
    let h = Harness::new(Scripted::new());
    h.points.fail_writes(true);
    let outcome = h
        .builder(config(3, 100))
        .plan(chain(&["a"]))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert!(matches!(outcome.finished, Finished::Recovering { .. }));
    assert_eq!(outcome.run.status, RunStatus::Recovering);
    assert!(h.executor.calls().is_empty());
    let saved = h.state.load().await.unwrap();
    assert_eq!(saved.status, RunStatus::Recovering);
}

#[tokio::test(start_paused = true)]
async fn resource_failure_waits_for_the_monitor() {
    let h = Harness::new(Scripted::new().fail("archive", "disk_full", 2));
    let probe = Arc::new(StaticProbe::new(HostSample {
        disk_percent: Some(99.0),
        ..Default::default()
    }));
    let mut cfg = config(5, 100);
    cfg.health.interval_ms = 1_000;

    let release = probe.clone();
    let started = tokio::time::Instant::now();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(20)).await;
        release.set(HostSample {
            disk_percent: Some(40.0),
            ..Default::default()
        });
    });

    let outcome = h
        .builder(cfg)
        .host_probe(probe)
        .plan(chain(&["archive"]))
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.finished, Finished::Completed);
    let calls = h.executor.call_times("archive");
    assert_eq!(calls.len(), 3);
    assert!(calls[2] - started >= Duration::from_secs(20));
    assert_eq!(
        outcome.run.tasks[0].last_error, None,
        "completed task keeps no last error"
    );
}
