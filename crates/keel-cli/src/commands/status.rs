//! Status command handler

use anyhow::Result;
use keel_core::app::{RunSummary, read_escalation};
use keel_core::impls::{DirPointStore, FileStateStore};
use keel_core::ports::{PointStore, StateReader, StoreError};

use super::Context;
use crate::exit_error::{EXIT_STATE_CORRUPTED, ExitError};
use crate::output::{OutputFormat, print_json};

pub async fn handle(ctx: &Context) -> Result<()> {
    let config = &ctx.config;
    let store = FileStateStore::new(&config.state_dir);
    let (run, source) = match store.load_with_source().await {
        Ok(loaded) => loaded,
        Err(StoreError::NotFound) => {
            println!("no run in {}", config.state_dir.display());
            return Ok(());
        }
        Err(e @ StoreError::StateCorrupted { .. }) => {
            return Err(ExitError::new(
                EXIT_STATE_CORRUPTED,
                format!("{e}\nrecovery points: `keel points`; restore with `keel recover`"),
            )
            .into());
        }
        Err(e) => return Err(e.into()),
    };

    let points = DirPointStore::new(config.points_dir()).list().await?;
    let escalation = read_escalation(&config.escalation_path()).await;
    let summary = RunSummary::new(&run, source, &points, escalation);

    match ctx.format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Text => print!("{}", summary.render()),
    }
    Ok(())
}
