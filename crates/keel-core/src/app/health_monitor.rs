//! HealthMonitor - 定期的な watchdog
//!
//! # フロー（tick ごと）
//! 1. StateReader で run を読む（書き込みはしない）
//! 2. stuck task / error rate / host resource をそれぞれ閾値で判定
//! 3. 全 event を EventSink へ。CRITICAL は即 gateway へ、
//!    WARNING は溜めて `warning_digest_every` tick ごとにまとめて出す
//! 4. memory / disk の水準を watch channel で engine に公開
//!    （RESOURCE エラーの retry はこれが Ok に戻るまで待つ）

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::intervention::GatewayHandle;
use crate::config::HealthConfig;
use crate::domain::health::{grade, metrics};
use crate::domain::{HealthEvent, ResourceLevel, Run, Severity};
use crate::ports::{Clock, EventSink, HostProbe, StateReader, StoreError};

pub struct HealthMonitor {
    config: HealthConfig,
    default_timeout_ms: u64,
    state: Arc<dyn StateReader>,
    probe: Arc<dyn HostProbe>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    gateway: GatewayHandle,
    resources: watch::Sender<ResourceLevel>,
    pending: Vec<HealthEvent>,
    ticks: u64,
}

impl HealthMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: HealthConfig,
        default_timeout_ms: u64,
        state: Arc<dyn StateReader>,
        probe: Arc<dyn HostProbe>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
        gateway: GatewayHandle,
    ) -> Self {
        let (resources, _) = watch::channel(ResourceLevel::Ok);
        Self {
            config,
            default_timeout_ms,
            state,
            probe,
            clock,
            sink,
            gateway,
            resources,
            pending: Vec::new(),
            ticks: 0,
        }
    }

    /// Resource level as of the last tick.
    pub fn resource_levels(&self) -> watch::Receiver<ResourceLevel> {
        self.resources.subscribe()
    }

    /// Run every check once and dispatch the resulting events.
    pub async fn tick(&mut self) -> Vec<HealthEvent> {
        let now = self.clock.now();
        let mut events = Vec::new();

        match self.state.load().await {
            Ok(run) => {
                events.extend(self.check_stuck(&run, now));
                events.push(self.check_error_rate(&run, now));
            }
            Err(StoreError::NotFound) => {}
            Err(e) => warn!(error = %e, "health monitor could not read state"),
        }
        events.extend(self.check_resources(now).await);

        for event in &events {
            self.dispatch(event).await;
        }

        self.ticks += 1;
        if self.ticks % u64::from(self.config.warning_digest_every) == 0 {
            self.flush_digest();
        }
        events
    }

    /// Tick on `health.interval_ms` until cancelled.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                }
            }
            self.flush_digest();
            debug!("health monitor stopped");
        })
    }

    fn check_stuck(&self, run: &Run, now: DateTime<Utc>) -> Option<HealthEvent> {
        let task = run.task(run.current_task.as_ref()?)?;
        let since = task.running_since()?;
        let elapsed = (now - since).num_milliseconds().max(0) as f64;

        let timeout = task.spec.timeout_ms.unwrap_or(self.default_timeout_ms);
        let (warning, critical) = self.config.stuck_thresholds(timeout);
        let severity = grade(elapsed, warning as f64, critical as f64);
        let threshold = if severity == Severity::Critical {
            critical
        } else {
            warning
        };
        let message = format!(
            "task {} running for {}s (timeout {}s)",
            task.id(),
            elapsed as u64 / 1000,
            timeout / 1000
        );
        Some(
            HealthEvent::new(now, metrics::STUCK_TASK, elapsed, threshold as f64, severity, message)
                .for_task(task.id().clone()),
        )
    }

    fn check_error_rate(&self, run: &Run, now: DateTime<Utc>) -> HealthEvent {
        let since = now - ChronoDuration::milliseconds(self.config.error_window_ms as i64);
        let failures = run
            .tasks
            .iter()
            .flat_map(|t| t.history.iter())
            .filter(|a| a.is_failure())
            .filter(|a| a.ended_at.is_some_and(|at| at >= since && at <= now))
            .count() as f64;

        let warning = f64::from(self.config.error_rate_warning);
        let critical = f64::from(self.config.error_rate_critical);
        let severity = grade(failures, warning, critical);
        let threshold = if severity == Severity::Critical {
            critical
        } else {
            warning
        };
        HealthEvent::new(
            now,
            metrics::ERROR_RATE,
            failures,
            threshold,
            severity,
            format!(
                "{failures} failed attempts in the last {}s",
                self.config.error_window_ms / 1000
            ),
        )
    }

    async fn check_resources(&self, now: DateTime<Utc>) -> Vec<HealthEvent> {
        let sample = self.probe.sample().await;
        let c = &self.config;
        let checks = [
            (metrics::CPU, sample.cpu_percent, c.cpu_warning, c.cpu_critical),
            (metrics::MEMORY, sample.memory_percent, c.memory_warning, c.memory_critical),
            (metrics::DISK, sample.disk_percent, c.disk_warning, c.disk_critical),
        ];

        let mut level = ResourceLevel::Ok;
        let mut events = Vec::new();
        for (metric, value, warning, critical) in checks {
            let Some(value) = value else { continue };
            let severity = grade(value, warning, critical);
            if metric != metrics::CPU {
                level = level.max(ResourceLevel::from(severity));
            }
            let threshold = if severity == Severity::Critical {
                critical
            } else {
                warning
            };
            events.push(HealthEvent::new(
                now,
                metric,
                value,
                threshold,
                severity,
                format!("{metric} at {value:.1}%"),
            ));
        }

        let previous = self.resources.send_replace(level);
        if previous != level {
            debug!(from = ?previous, to = ?level, "resource level changed");
        }
        events
    }

    async fn dispatch(&mut self, event: &HealthEvent) {
        self.sink.health(event).await;
        match event.severity {
            Severity::Info => debug!(metric = %event.metric, value = event.value, "health ok"),
            Severity::Warning => {
                warn!(metric = %event.metric, value = event.value, threshold = event.threshold, task = ?event.task_id, "{}", event.message);
                self.pending.push(event.clone());
            }
            Severity::Critical => {
                error!(metric = %event.metric, value = event.value, threshold = event.threshold, task = ?event.task_id, "{}", event.message);
                self.gateway.critical(event.clone());
            }
        }
    }

    fn flush_digest(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.gateway.digest(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::intervention::{InterventionGateway, Notice, OperatorHandle};
    use crate::domain::{ErrorClass, RunId, TaskError, TaskId, TaskSpec};
    use crate::impls::MemoryStateStore;
    use crate::ports::{HostSample, ManualClock, MemoryEventSink, StateStore, StaticProbe};
    use chrono::TimeZone;
    use std::time::Duration;
    use ulid::Ulid;

    struct Fixture {
        state: Arc<MemoryStateStore>,
        probe: Arc<StaticProbe>,
        clock: Arc<ManualClock>,
        sink: Arc<MemoryEventSink>,
        operator: OperatorHandle,
        monitor: HealthMonitor,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn fixture(config: HealthConfig) -> Fixture {
        let state = Arc::new(MemoryStateStore::new());
        let probe = Arc::new(StaticProbe::default());
        let clock = Arc::new(ManualClock::new(start()));
        let sink = Arc::new(MemoryEventSink::new());
        let (gateway, operator) = InterventionGateway::new(false, None);
        let monitor = HealthMonitor::new(
            config,
            60_000,
            state.clone(),
            probe.clone(),
            clock.clone(),
            sink.clone(),
            gateway.handle(),
        );
        // the monitor's handle keeps the notice channel open
        drop(gateway);
        Fixture {
            state,
            probe,
            clock,
            sink,
            operator,
            monitor,
        }
    }

    fn running_run(timeout_ms: u64) -> Run {
        let mut spec = TaskSpec::new("slow");
        spec.timeout_ms = Some(timeout_ms);
        let mut run = Run::new(RunId::from_ulid(Ulid::new()), vec![spec], start());
        run.current_task = Some(TaskId::new("slow"));
        run.tasks[0].start_attempt(start(), 0);
        run.global_attempts = 1;
        run
    }

    #[tokio::test]
    async fn stuck_task_escalates_from_warning_to_critical() {
        let mut f = fixture(HealthConfig::default());
        f.state.save(&running_run(1_000)).await.unwrap();

        f.clock.advance(Duration::from_millis(1_500));
        let events = f.monitor.tick().await;
        let stuck = events.iter().find(|e| e.metric == metrics::STUCK_TASK).unwrap();
        assert_eq!(stuck.severity, Severity::Warning);
        assert_eq!(stuck.task_id, Some(TaskId::new("slow")));

        f.clock.advance(Duration::from_millis(1_500));
        let events = f.monitor.tick().await;
        let stuck = events.iter().find(|e| e.metric == metrics::STUCK_TASK).unwrap();
        assert_eq!(stuck.severity, Severity::Critical);
        assert_eq!(stuck.threshold, 2_000.0);

        assert!(matches!(f.operator.try_notice(), Some(Notice::Health(e)) if e.metric == metrics::STUCK_TASK));
        assert_eq!(f.sink.health_events().len(), events.len() * 2);
    }

    #[tokio::test]
    async fn warnings_are_batched_into_a_digest() {
        let mut f = fixture(HealthConfig {
            warning_digest_every: 2,
            ..HealthConfig::default()
        });
        f.probe.set(HostSample {
            memory_percent: Some(90.0),
            ..HostSample::default()
        });

        f.monitor.tick().await;
        assert!(f.operator.try_notice().is_none());

        f.monitor.tick().await;
        match f.operator.try_notice() {
            Some(Notice::Digest(events)) => {
                assert_eq!(events.len(), 2);
                assert!(events.iter().all(|e| e.metric == metrics::MEMORY));
            }
            other => panic!("expected digest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_rate_counts_failures_inside_the_window() {
        let mut f = fixture(HealthConfig {
            error_window_ms: 60_000,
            error_rate_warning: 2,
            error_rate_critical: 3,
            ..HealthConfig::default()
        });
        let mut run = Run::new(
            RunId::from_ulid(Ulid::new()),
            vec![TaskSpec::new("flaky")],
            start(),
        );
        let error = TaskError::new("network", ErrorClass::Transient, "reset");
        for minute in [0, 2, 2] {
            let at = start() + ChronoDuration::minutes(minute);
            run.tasks[0].start_attempt(at, 0);
            run.tasks[0].fail_attempt(at, error.clone(), false);
            run.global_attempts += 1;
        }
        f.state.save(&run).await.unwrap();
        f.clock.advance(Duration::from_secs(150));

        let events = f.monitor.tick().await;
        let rate = events.iter().find(|e| e.metric == metrics::ERROR_RATE).unwrap();
        assert_eq!(rate.value, 2.0);
        assert_eq!(rate.severity, Severity::Warning);
    }

    #[tokio::test]
    async fn resource_level_follows_memory_and_disk() {
        let mut f = fixture(HealthConfig::default());
        let levels = f.monitor.resource_levels();

        f.probe.set(HostSample {
            cpu_percent: Some(99.0),
            memory_percent: Some(10.0),
            disk_percent: Some(96.0),
        });
        f.monitor.tick().await;
        assert_eq!(*levels.borrow(), ResourceLevel::Critical);

        f.probe.set(HostSample {
            cpu_percent: Some(99.0),
            memory_percent: Some(10.0),
            disk_percent: Some(40.0),
        });
        f.monitor.tick().await;
        assert_eq!(*levels.borrow(), ResourceLevel::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_monitor_ticks_until_cancelled() {
        let f = fixture(HealthConfig {
            interval_ms: 1_000,
            ..HealthConfig::default()
        });
        f.probe.set(HostSample {
            disk_percent: Some(99.0),
            ..HostSample::default()
        });
        let cancel = CancellationToken::new();
        let join = f.monitor.spawn(cancel.clone());
        let mut operator = f.operator;

        let notice = tokio::time::timeout(Duration::from_millis(1_500), operator.next_notice())
            .await
            .unwrap();
        assert!(matches!(notice, Some(Notice::Health(e)) if e.metric == metrics::DISK));

        cancel.cancel();
        join.await.unwrap();
    }
}
