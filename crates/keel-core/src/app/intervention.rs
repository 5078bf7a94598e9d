//! InterventionGateway - 人間のオペレーターへの引き継ぎ
//!
//! # 設計
//! - engine 側は `InterventionGateway`、オペレーター側（CLI の console など）は
//!   `OperatorHandle` を持つ。間は tokio の channel だけ
//! - 判断が必要な escalation は `oneshot` の返信を待つ。待ちは cancel 可能で、
//!   その間も health monitor は別タスクで動き続ける
//! - 最新の escalation は `escalation.json` にも書く（プロセス終了後の `keel status` 用）

use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::{Escalation, HealthEvent, OperatorCommand, RunStatus};
use crate::impls::atomic::write_atomic;

/// Something the operator side should look at.
#[derive(Debug)]
pub enum Notice {
    /// `reply` is `None` when nobody waits for an answer (unattended / health).
    Escalation {
        escalation: Escalation,
        reply: Option<oneshot::Sender<OperatorCommand>>,
    },
    /// A CRITICAL health event, pushed as soon as it is seen.
    Health(HealthEvent),
    /// Aggregated WARNING events.
    Digest(Vec<HealthEvent>),
    /// The engine stopped.
    Finished(RunStatus),
}

/// How an escalation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Command(OperatorCommand),
    /// No decision now (unattended, or no operator attached). The task stays escalated.
    Deferred,
    /// The wait was cancelled.
    Cancelled,
}

pub struct InterventionGateway {
    notices: mpsc::UnboundedSender<Notice>,
    commands: mpsc::UnboundedReceiver<OperatorCommand>,
    unattended: bool,
    escalation_file: Option<PathBuf>,
}

/// Operator end of the gateway.
pub struct OperatorHandle {
    notices: mpsc::UnboundedReceiver<Notice>,
    commands: mpsc::UnboundedSender<OperatorCommand>,
}

/// Notification-only end, for the health monitor.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    notices: mpsc::UnboundedSender<Notice>,
}

impl InterventionGateway {
    pub fn new(unattended: bool, escalation_file: Option<PathBuf>) -> (Self, OperatorHandle) {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let gateway = Self {
            notices: notice_tx,
            commands: command_rx,
            unattended,
            escalation_file,
        };
        let operator = OperatorHandle {
            notices: notice_rx,
            commands: command_tx,
        };
        (gateway, operator)
    }

    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            notices: self.notices.clone(),
        }
    }

    pub fn is_unattended(&self) -> bool {
        self.unattended
    }

    /// Surface an escalation and, when it needs one, wait for the operator's decision.
    pub async fn escalate(
        &mut self,
        escalation: Escalation,
        cancel: &CancellationToken,
    ) -> Resolution {
        if !escalation.needs_decision() || self.unattended {
            self.report(escalation).await;
            return Resolution::Deferred;
        }
        self.announce(&escalation).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self.notices.send(Notice::Escalation {
            escalation,
            reply: Some(reply_tx),
        });
        if sent.is_err() {
            warn!("no operator attached, escalation deferred");
            return Resolution::Deferred;
        }

        let resolution = tokio::select! {
            _ = cancel.cancelled() => Resolution::Cancelled,
            reply = reply_rx => match reply {
                Ok(command) => Resolution::Command(command),
                Err(_) => Resolution::Deferred,
            },
            Some(command) = self.commands.recv() => Resolution::Command(command),
        };
        if let Resolution::Command(command) = &resolution {
            info!(?command, "operator decision received");
            self.clear().await;
        }
        resolution
    }

    /// Surface an escalation without waiting for an answer.
    pub async fn report(&mut self, escalation: Escalation) {
        self.announce(&escalation).await;
        let _ = self.notices.send(Notice::Escalation {
            escalation,
            reply: None,
        });
    }

    async fn announce(&self, escalation: &Escalation) {
        error!(
            run = %escalation.run_id,
            task = ?escalation.task_id,
            class = ?escalation.class,
            last_point = ?escalation.last_point,
            cause = %escalation.cause,
            "escalated to operator"
        );
        self.persist(escalation).await;
    }

    /// An operator command sent without an escalation pending, if any.
    /// Any command supersedes the persisted escalation.
    pub async fn try_command(&mut self) -> Option<OperatorCommand> {
        let command = self.commands.try_recv().ok()?;
        info!(?command, "operator command received");
        self.clear().await;
        Some(command)
    }

    pub fn finished(&self, status: RunStatus) {
        let _ = self.notices.send(Notice::Finished(status));
    }

    async fn persist(&self, escalation: &Escalation) {
        let Some(path) = &self.escalation_file else {
            return;
        };
        let bytes = match serde_json::to_vec_pretty(escalation) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode escalation");
                return;
            }
        };
        if let Err(e) = write_atomic(path, &bytes).await {
            warn!(path = %path.display(), error = %e, "failed to write escalation file");
        }
    }

    async fn clear(&self) {
        let Some(path) = &self.escalation_file else {
            return;
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to clear escalation file"),
        }
    }
}

impl GatewayHandle {
    pub fn critical(&self, event: HealthEvent) {
        let _ = self.notices.send(Notice::Health(event));
    }

    pub fn digest(&self, events: Vec<HealthEvent>) {
        if !events.is_empty() {
            let _ = self.notices.send(Notice::Digest(events));
        }
    }
}

impl OperatorHandle {
    /// Next notice; `None` once the engine and the monitor are gone.
    pub async fn next_notice(&mut self) -> Option<Notice> {
        self.notices.recv().await
    }

    pub fn try_notice(&mut self) -> Option<Notice> {
        self.notices.try_recv().ok()
    }

    /// Send an unsolicited command (e.g. `pause`). False if the engine is gone.
    pub fn send(&self, command: OperatorCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn commander(&self) -> mpsc::UnboundedSender<OperatorCommand> {
        self.commands.clone()
    }
}

/// Read a persisted escalation, if one is pending.
pub async fn read_escalation(path: &std::path::Path) -> Option<Escalation> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(escalation) => Some(escalation),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable escalation file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EscalationCause, DenyReason, RunId, Severity, TaskId};
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::TempDir;
    use ulid::Ulid;

    fn denied() -> Escalation {
        let mut e = Escalation::new(
            RunId::from_ulid(Ulid::new()),
            Utc::now(),
            EscalationCause::RetryDenied {
                reason: DenyReason::TaskLimitExceeded,
            },
        );
        e.task_id = Some(TaskId::new("deploy"));
        e
    }

    #[tokio::test]
    async fn operator_reply_resolves_escalation_and_clears_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("escalation.json");
        let (mut gateway, mut operator) = InterventionGateway::new(false, Some(path.clone()));

        let answer = tokio::spawn(async move {
            match operator.next_notice().await {
                Some(Notice::Escalation {
                    escalation,
                    reply: Some(reply),
                }) => {
                    assert_eq!(escalation.task_id, Some(TaskId::new("deploy")));
                    reply.send(OperatorCommand::Skip(TaskId::new("deploy"))).unwrap();
                }
                other => panic!("unexpected notice: {other:?}"),
            }
            operator
        });

        let cancel = CancellationToken::new();
        let resolution = gateway.escalate(denied(), &cancel).await;
        assert_eq!(
            resolution,
            Resolution::Command(OperatorCommand::Skip(TaskId::new("deploy")))
        );
        answer.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unattended_defers_and_keeps_the_report() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("escalation.json");
        let (mut gateway, mut operator) = InterventionGateway::new(true, Some(path.clone()));

        let resolution = gateway.escalate(denied(), &CancellationToken::new()).await;
        assert_eq!(resolution, Resolution::Deferred);
        assert!(matches!(
            operator.try_notice(),
            Some(Notice::Escalation { reply: None, .. })
        ));
        let stored = read_escalation(&path).await.unwrap();
        assert_eq!(stored.task_id, Some(TaskId::new("deploy")));
    }

    #[tokio::test]
    async fn dropped_operator_defers() {
        let (mut gateway, operator) = InterventionGateway::new(false, None);
        drop(operator);
        let resolution = gateway.escalate(denied(), &CancellationToken::new()).await;
        assert_eq!(resolution, Resolution::Deferred);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_the_wait() {
        let (mut gateway, _operator) = InterventionGateway::new(false, None);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel();
        });

        let resolution = gateway.escalate(denied(), &cancel).await;
        assert_eq!(resolution, Resolution::Cancelled);
    }

    #[tokio::test]
    async fn typed_command_answers_a_pending_escalation() {
        let (mut gateway, operator) = InterventionGateway::new(false, None);
        assert!(operator.send(OperatorCommand::Abort));
        let resolution = gateway.escalate(denied(), &CancellationToken::new()).await;
        assert_eq!(resolution, Resolution::Command(OperatorCommand::Abort));
    }

    #[tokio::test]
    async fn unsolicited_command_supersedes_the_stored_escalation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("escalation.json");
        let (mut gateway, operator) = InterventionGateway::new(true, Some(path.clone()));
        gateway.escalate(denied(), &CancellationToken::new()).await;
        assert!(path.exists());

        assert_eq!(gateway.try_command().await, None);
        assert!(path.exists());

        operator.send(OperatorCommand::Retry(TaskId::new("deploy")));
        assert_eq!(
            gateway.try_command().await,
            Some(OperatorCommand::Retry(TaskId::new("deploy")))
        );
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn health_notices_reach_the_operator() {
        let (gateway, mut operator) = InterventionGateway::new(false, None);
        let monitor = gateway.handle();
        let event = HealthEvent::new(Utc::now(), "disk_percent", 97.0, 95.0, Severity::Critical, "disk");

        monitor.digest(Vec::new());
        monitor.critical(event.clone());
        gateway.finished(RunStatus::Completed);

        assert!(matches!(operator.try_notice(), Some(Notice::Health(e)) if e == event));
        assert!(matches!(
            operator.try_notice(),
            Some(Notice::Finished(RunStatus::Completed))
        ));
    }
}
