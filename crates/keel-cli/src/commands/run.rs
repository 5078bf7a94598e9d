//! run / resume / retry - engine をこのプロセスで動かす
//!
//! # 流れ
//! 1. state directory の lock を取る
//! 2. EngineBuilder に CLI 側の ports（CommandExecutor, JsonlEventSink, ProcProbe）を渡す
//! 3. console（オペレーター）と停止の監視（Ctrl-C, pause marker）を別タスクで起動
//! 4. 終わり方を表示して exit code に変換

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use keel_core::domain::{
    OperatorCommand, Plan, PointId, RunId, RunStatus, TaskId, TaskStatus,
};
use keel_core::impls::{FileStateStore, JsonlEventSink, ProcProbe};
use keel_core::ports::{LoadSource, StateReader, StoreError};
use keel_core::{EngineBuilder, Finished, Outcome};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Context;
use crate::console::Console;
use crate::executor::CommandExecutor;
use crate::exit_error::{self, EXIT_OTHER, EXIT_STATE_CORRUPTED, ExitError};
use crate::lock::StateLock;
use crate::output::{OutputFormat, print_json};

/// How often the pause marker is looked for.
const MARKER_POLL: Duration = Duration::from_secs(1);

/// `keel run <plan>`
pub async fn start(ctx: &Context, plan_path: &Path, unattended: bool) -> Result<()> {
    let plan = Plan::load(plan_path)?;
    let _lock = StateLock::acquire(&ctx.config.state_dir)?;

    let store = FileStateStore::new(&ctx.config.state_dir);
    match store.load().await {
        Ok(run) if !run.status.is_terminal() => {
            return Err(ExitError::new(
                EXIT_OTHER,
                format!(
                    "run {} is {}; continue it with `keel resume` or restore it with `keel recover`",
                    run.run_id, run.status
                ),
            )
            .into());
        }
        Ok(run) => info!(previous = %run.run_id, status = %run.status, "replacing a finished run"),
        Err(StoreError::NotFound) => {}
        Err(e) => return Err(unusable_state(e)),
    }

    let builder = EngineBuilder::new(ctx.config.clone()).plan(plan);
    drive(ctx, builder, None, unattended).await
}

/// `keel resume`, and `keel retry <task>` (resume with an override queued).
pub async fn resume(ctx: &Context, command: Option<OperatorCommand>, unattended: bool) -> Result<()> {
    let dir = &ctx.config.state_dir;
    let _lock = StateLock::acquire(dir)?;

    let store = FileStateStore::new(dir);
    let (run, source) = match store.load_with_source().await {
        Ok(loaded) => loaded,
        Err(StoreError::NotFound) => {
            return Err(ExitError::new(
                EXIT_OTHER,
                format!("no run in {}; start one with `keel run <plan>`", dir.display()),
            )
            .into());
        }
        Err(e) => return Err(unusable_state(e)),
    };
    if source == LoadSource::Backup {
        warn!("primary state file unusable, resuming from the backup copy");
    }

    if let Some(OperatorCommand::Retry(task)) = &command {
        if run.index_of(task).is_none() {
            return Err(
                ExitError::new(EXIT_OTHER, format!("run {} has no task '{task}'", run.run_id)).into(),
            );
        }
    }
    if run.status == RunStatus::Completed && command.is_none() {
        println!("run {} already completed", run.run_id);
        return Ok(());
    }

    let builder = EngineBuilder::new(ctx.config.clone()).resume_from(run);
    drive(ctx, builder, command, unattended).await
}

fn unusable_state(e: StoreError) -> anyhow::Error {
    match e {
        e @ StoreError::StateCorrupted { .. } => ExitError::new(
            EXIT_STATE_CORRUPTED,
            format!("{e}\nrestore a recovery point with `keel recover --auto`"),
        )
        .into(),
        other => other.into(),
    }
}

async fn drive(
    ctx: &Context,
    builder: EngineBuilder,
    queued: Option<OperatorCommand>,
    unattended: bool,
) -> Result<()> {
    let config = &ctx.config;
    let unattended = unattended || config.execution.unattended || !std::io::stdin().is_terminal();
    let marker = config.pause_marker();
    clear_stale_marker(&marker).await;

    let cancel = CancellationToken::new();
    let mut orchestrator = builder
        .executor(Arc::new(CommandExecutor::new()))
        .event_sink(Arc::new(JsonlEventSink::new(&config.state_dir)))
        .host_probe(Arc::new(ProcProbe::new(&config.state_dir)))
        .cancel_token(cancel.clone())
        .unattended(unattended)
        .build()?;

    let console = orchestrator.take_operator().map(|operator| {
        if let Some(command) = queued {
            operator.send(command);
        }
        Console::new(operator).spawn()
    });
    let watcher = tokio::spawn(watch_for_stop(cancel.clone(), marker));

    let result = orchestrator.run().await;
    watcher.abort();
    if let Some(console) = console {
        // ends on the engine's Finished notice
        let _ = tokio::time::timeout(Duration::from_secs(1), console).await;
    }

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) if e.is_state_corruption() => {
            return Err(ExitError::new(
                EXIT_STATE_CORRUPTED,
                format!("{e}\nrestore a recovery point with `keel recover --auto`"),
            )
            .into());
        }
        Err(e) => return Err(e.into()),
    };

    let report = RunReport::new(&outcome);
    match ctx.format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => print!("{}", report.render()),
    }
    match exit_error::code_for(&outcome.finished) {
        0 => Ok(()),
        code => Err(ExitError::silent(code).into()),
    }
}

/// A marker left from an earlier run would pause this one at once.
async fn clear_stale_marker(marker: &Path) {
    if tokio::fs::remove_file(marker).await.is_ok() {
        warn!(path = %marker.display(), "removed a stale pause request");
    }
}

/// Cancel the engine on Ctrl-C or when `keel pause` drops the marker.
/// The engine treats cancellation as a pause.
async fn watch_for_stop(cancel: CancellationToken, marker: PathBuf) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut poll = tokio::time::interval(MARKER_POLL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = &mut ctrl_c => {
                warn!("interrupted, pausing the run");
                break;
            }
            _ = poll.tick() => {
                if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
                    let _ = tokio::fs::remove_file(&marker).await;
                    info!("pause requested");
                    break;
                }
            }
        }
    }
    cancel.cancel();
}

/// What `keel run` prints when the engine stops.
#[derive(Debug, Serialize)]
struct RunReport {
    run_id: RunId,
    status: RunStatus,
    ending: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    point: Option<PointId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    unresolved: Vec<(TaskId, TaskStatus)>,
    completed: usize,
    total: usize,
    global_attempts: u32,
}

impl RunReport {
    fn new(outcome: &Outcome) -> Self {
        let run = &outcome.run;
        let mut report = Self {
            run_id: run.run_id,
            status: run.status,
            ending: "completed",
            detail: None,
            point: None,
            unresolved: Vec::new(),
            completed: run.completed_count,
            total: run.total_tasks,
            global_attempts: run.global_attempts,
        };
        match &outcome.finished {
            Finished::Completed => {}
            Finished::Failed { unresolved } => {
                report.ending = "failed";
                report.unresolved = unresolved.clone();
            }
            Finished::Paused { point } => {
                report.ending = "paused";
                report.point = *point;
            }
            Finished::Aborted { reason } => {
                report.ending = "aborted";
                report.detail = Some(reason.clone());
            }
            Finished::StateCorrupted { detail } => {
                report.ending = "state_corrupted";
                report.detail = Some(detail.clone());
            }
            Finished::Recovering { detail } => {
                report.ending = "recovering";
                report.detail = Some(detail.clone());
            }
        }
        report
    }

    fn render(&self) -> String {
        let mut out = format!(
            "run {} {}: {}/{} tasks completed, {} attempts\n",
            self.run_id, self.ending, self.completed, self.total, self.global_attempts
        );
        if let Some(detail) = &self.detail {
            out.push_str(&format!("  {detail}\n"));
        }
        for (task, status) in &self.unresolved {
            out.push_str(&format!("  - {task}: {status}\n"));
        }
        match self.ending {
            "paused" => {
                if let Some(point) = self.point {
                    out.push_str(&format!("  recovery point {point}\n"));
                }
                out.push_str("  continue with `keel resume`\n");
            }
            "failed" => out.push_str("  see `keel status`; `keel retry <task>` gives a task a fresh budget\n"),
            "state_corrupted" | "recovering" => {
                out.push_str("  restore a recovery point with `keel recover`\n")
            }
            _ => {}
        }
        out
    }
}
