//! Pause command handler
//!
//! Drops the pause marker; the running engine picks it up within a second,
//! interrupts the current attempt and saves a manual recovery point.

use anyhow::{Context as _, Result};
use chrono::Utc;
use keel_core::impls::FileStateStore;
use keel_core::ports::{StateReader, StoreError};

use super::Context;
use crate::exit_error::{EXIT_OTHER, ExitError};

pub async fn handle(ctx: &Context) -> Result<()> {
    let dir = &ctx.config.state_dir;
    match FileStateStore::new(dir).load().await {
        Ok(run) if run.status.is_terminal() => {
            println!("run {} is already {}; nothing to pause", run.run_id, run.status);
            return Ok(());
        }
        Err(StoreError::NotFound) => {
            return Err(ExitError::new(EXIT_OTHER, format!("no run in {}", dir.display())).into());
        }
        _ => {}
    }

    let marker = ctx.config.pause_marker();
    tokio::fs::write(&marker, Utc::now().to_rfc3339())
        .await
        .with_context(|| format!("writing {}", marker.display()))?;
    println!("pause requested");
    Ok(())
}
