//! Recover command handler
//!
//! Works without a running engine and without a usable live state: the
//! chosen point is validated, written as the live state (PAUSED) and
//! journaled. `keel resume` continues from there.

use anyhow::Result;
use chrono::{DateTime, Utc};
use keel_core::app::RecoveryManager;
use keel_core::domain::{DecisionRecord, PointMetadata, RecoverTarget, Run, RunStatus};
use keel_core::impls::{FileStateStore, JsonlEventSink};
use keel_core::ports::{EventSink, StateReader, StateStore, StoreError};
use serde_json::json;
use tracing::{info, warn};

use super::Context;
use super::points::{manager, render_points};
use crate::RecoverArgs;
use crate::exit_error::{EXIT_OTHER, ExitError};
use crate::lock::StateLock;
use crate::output::{OutputFormat, print_json};

pub async fn handle(ctx: &Context, args: &RecoverArgs) -> Result<()> {
    let config = &ctx.config;
    let _lock = StateLock::acquire(&config.state_dir)?;
    let manager = manager(config);

    let target = if let Some(point) = &args.point {
        let id = point
            .parse()
            .map_err(|e| ExitError::new(EXIT_OTHER, format!("{e}")))?;
        RecoverTarget::Point(id)
    } else if args.interactive {
        match choose(&manager).await? {
            Some(target) => target,
            None => {
                println!("nothing restored");
                return Ok(());
            }
        }
    } else {
        RecoverTarget::Auto
    };

    let store = FileStateStore::new(&config.state_dir);
    let previous = match store.load().await {
        Ok(run) => Some(run),
        Err(StoreError::NotFound) => None,
        Err(e) => {
            warn!(error = %e, "live state unusable, restoring over it");
            None
        }
    };

    let restored = manager
        .restore_target(target)
        .await
        .map_err(|e| ExitError::new(EXIT_OTHER, format!("recover failed: {e}")))?;
    let now = Utc::now();
    let run = as_live_state(restored.run, previous.as_ref(), now);
    store.save(&run).await?;
    clear_escalation(ctx).await;
    info!(point = %restored.point.id, next = ?restored.next_task, "live state replaced from recovery point");

    let record = DecisionRecord::new(now, None, json!({ "target": target }), "operator", "recover")
        .with_context(json!({ "point": restored.point.id, "offline": true }));
    JsonlEventSink::new(&config.state_dir).decision(&record).await;

    match ctx.format {
        OutputFormat::Json => print_json(&json!({
            "point": restored.point,
            "next_task": restored.next_task,
            "run_id": run.run_id,
            "status": run.status,
        }))?,
        OutputFormat::Text => {
            println!(
                "restored {} ({}, {}/{} tasks completed)",
                restored.point.id, restored.point.reason, run.completed_count, run.total_tasks
            );
            match &restored.next_task {
                Some(task) => println!("next task: {task}; continue with `keel resume`"),
                None => println!("nothing left to run; `keel resume` settles the run"),
            }
        }
    }
    Ok(())
}

/// The snapshot becomes the live state: interrupted attempts are closed, and
/// attempts already spent by the same run are never refunded.
fn as_live_state(mut run: Run, previous: Option<&Run>, now: DateTime<Utc>) -> Run {
    run.normalize_for_resume(now);
    if let Some(previous) = previous.filter(|p| p.run_id == run.run_id) {
        run.global_attempts = run.global_attempts.max(previous.global_attempts);
    }
    run.status = RunStatus::Paused;
    run.outcome = None;
    run
}

/// The pending escalation was about the state that was just replaced.
async fn clear_escalation(ctx: &Context) {
    let path = ctx.config.escalation_path();
    match tokio::fs::remove_file(&path).await {
        Ok(()) => info!(path = %path.display(), "cleared pending escalation"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to clear escalation file"),
    }
}

async fn choose(manager: &RecoveryManager) -> Result<Option<RecoverTarget>> {
    let points = manager.list().await?;
    if points.is_empty() {
        return Err(ExitError::new(EXIT_OTHER, "no recovery points").into());
    }
    eprint!("{}", render_points(&points));
    eprint!("restore which point? [number, id, enter = newest valid, q = quit] ");

    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await??;
    pick(&points, &answer).map_err(|msg| ExitError::new(EXIT_OTHER, msg).into())
}

/// Numbers refer to `render_points` order (newest first).
fn pick(points: &[PointMetadata], answer: &str) -> Result<Option<RecoverTarget>, String> {
    let answer = answer.trim();
    match answer {
        "" => return Ok(Some(RecoverTarget::Auto)),
        "q" | "quit" => return Ok(None),
        _ => {}
    }
    if let Ok(n) = answer.parse::<usize>() {
        return n
            .checked_sub(1)
            .and_then(|i| points.iter().rev().nth(i))
            .map(|p| Some(RecoverTarget::Point(p.id)))
            .ok_or_else(|| format!("no point #{n}"));
    }
    answer
        .parse()
        .map(|id| Some(RecoverTarget::Point(id)))
        .map_err(|_| format!("'{answer}' is neither a number from the list nor a point id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::domain::{
        AttemptOutcome, PointId, RecoveryReason, RunId, TaskId, TaskSpec, TaskStatus,
    };
    use rstest::rstest;

    const RUN: &str = "run-01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OLD: &str = "rp-01ARZ3NDEKTSV4RRFFQ69G5FA1";
    const NEW: &str = "rp-01ARZ3NDEKTSV4RRFFQ69G5FA2";

    fn meta(id: &str) -> PointMetadata {
        PointMetadata {
            id: id.parse().unwrap(),
            run_id: RUN.parse().unwrap(),
            reason: RecoveryReason::PreTask,
            created_at: Utc::now(),
            task_id: None,
            note: None,
            run_status: RunStatus::Running,
            completed_count: 0,
            total_tasks: 1,
        }
    }

    fn point(id: &str) -> Option<RecoverTarget> {
        Some(RecoverTarget::Point(id.parse::<PointId>().unwrap()))
    }

    #[rstest]
    #[case::enter("\n", Ok(Some(RecoverTarget::Auto)))]
    #[case::quit("q\n", Ok(None))]
    #[case::newest("1", Ok(point(NEW)))]
    #[case::oldest(" 2 ", Ok(point(OLD)))]
    #[case::by_id(OLD, Ok(point(OLD)))]
    #[case::out_of_range("3", Err("no point #3".to_string()))]
    #[case::zero("0", Err("no point #0".to_string()))]
    fn answers(#[case] answer: &str, #[case] expected: Result<Option<RecoverTarget>, String>) {
        let points = vec![meta(OLD), meta(NEW)];
        assert_eq!(pick(&points, answer), expected);
    }

    #[test]
    fn garbage_answer_is_rejected() {
        assert!(pick(&[meta(OLD)], "latest please").is_err());
    }

    fn snapshot(global_attempts: u32) -> Run {
        let now = Utc::now();
        let mut run = Run::new(RUN.parse::<RunId>().unwrap(), vec![TaskSpec::new("a")], now);
        run.status = RunStatus::Running;
        run.tasks[0].start_attempt(now, 0);
        run.current_task = Some(TaskId::new("a"));
        run.global_attempts = global_attempts;
        run.refresh_counts();
        run
    }

    #[test]
    fn live_state_keeps_attempts_already_spent() {
        let later = snapshot(7);
        let run = as_live_state(snapshot(1), Some(&later), Utc::now());

        assert_eq!(run.global_attempts, 7);
        assert_eq!(run.status, RunStatus::Paused);
        assert_eq!(run.tasks[0].status, TaskStatus::Ready);
        assert_eq!(run.tasks[0].history[0].outcome, AttemptOutcome::Interrupted);
        assert!(run.validate().is_empty());
    }

    #[test]
    fn attempts_of_another_run_are_ignored() {
        let mut other = snapshot(9);
        other.run_id = "run-01ARZ3NDEKTSV4RRFFQ69G5FA9".parse().unwrap();
        let run = as_live_state(snapshot(1), Some(&other), Utc::now());
        assert_eq!(run.global_attempts, 1);
    }
}
