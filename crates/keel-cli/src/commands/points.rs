//! Recovery point listing and pruning.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use keel_core::app::RecoveryManager;
use keel_core::config::OrchestratorConfig;
use keel_core::domain::PointMetadata;
use keel_core::impls::{DirPointStore, FileStateStore};
use keel_core::ports::{PointStore, SystemClock, UlidGenerator};

use super::Context;
use crate::lock::StateLock;
use crate::output::{OutputFormat, format_age, print_json};

pub fn manager(config: &OrchestratorConfig) -> RecoveryManager {
    RecoveryManager::new(
        Arc::new(DirPointStore::new(config.points_dir())),
        Arc::new(FileStateStore::new(&config.state_dir)),
        Arc::new(SystemClock),
        Arc::new(UlidGenerator::new(SystemClock)),
        config.recovery.clone(),
    )
}

pub async fn list(ctx: &Context) -> Result<()> {
    let points = DirPointStore::new(ctx.config.points_dir()).list().await?;
    match ctx.format {
        OutputFormat::Json => print_json(&points)?,
        OutputFormat::Text => print!("{}", render_points(&points)),
    }
    Ok(())
}

pub async fn prune(ctx: &Context) -> Result<()> {
    let _lock = StateLock::acquire(&ctx.config.state_dir)?;
    let removed = manager(&ctx.config).prune().await?;
    match ctx.format {
        OutputFormat::Json => print_json(&serde_json::json!({ "removed": removed }))?,
        OutputFormat::Text => println!("pruned {} recovery point(s)", removed.len()),
    }
    Ok(())
}

/// Newest first, numbered from 1.
pub fn render_points(points: &[PointMetadata]) -> String {
    if points.is_empty() {
        return "no recovery points\n".to_string();
    }
    let now = Utc::now();
    let mut out = String::new();
    for (n, p) in points.iter().rev().enumerate() {
        let task = p.task_id.as_ref().map(|t| t.as_str()).unwrap_or("-");
        let note = p.note.as_deref().map(|n| format!("  ({n})")).unwrap_or_default();
        out.push_str(&format!(
            "{:>3}. {}  {:<9} {:>4} ago  task={:<16} {}/{} done  {}{}\n",
            n + 1,
            p.id,
            p.reason.to_string(),
            format_age(p.created_at, now),
            task,
            p.completed_count,
            p.total_tasks,
            p.run_status,
            note
        ));
    }
    out
}
