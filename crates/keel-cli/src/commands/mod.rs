//! Command handlers.
//!
//! `run`, `resume` and `retry` drive the engine in this process; the rest
//! work on the files in the state directory.

mod pause;
mod points;
mod recover;
mod run;
mod status;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use keel_core::OrchestratorConfig;
use keel_core::domain::{OperatorCommand, TaskId};

use crate::output::OutputFormat;
use crate::{Cli, Command};

/// What every handler needs: the resolved config and the output format.
pub struct Context {
    pub config: OrchestratorConfig,
    pub format: OutputFormat,
}

impl Context {
    pub fn new(
        config_path: Option<PathBuf>,
        state_dir: Option<PathBuf>,
        format: OutputFormat,
    ) -> Result<Self> {
        let mut config =
            OrchestratorConfig::load(config_path.as_deref()).context("loading configuration")?;
        if let Some(dir) = state_dir {
            config.state_dir = dir;
        }
        Ok(Self { config, format })
    }
}

pub async fn dispatch(cli: Cli) -> Result<()> {
    let ctx = Context::new(cli.config, cli.state_dir, cli.output)?;
    match cli.command {
        Command::Run { plan, attend } => run::start(&ctx, &plan, attend.unattended).await,
        Command::Resume { attend } => run::resume(&ctx, None, attend.unattended).await,
        Command::Retry { task, attend } => {
            let command = OperatorCommand::Retry(TaskId::new(task));
            run::resume(&ctx, Some(command), attend.unattended).await
        }
        Command::Recover(args) => recover::handle(&ctx, &args).await,
        Command::Status => status::handle(&ctx).await,
        Command::Pause => pause::handle(&ctx).await,
        Command::Points => points::list(&ctx).await,
        Command::Prune => points::prune(&ctx).await,
    }
}
