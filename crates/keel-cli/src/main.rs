//! keel - resilient execution orchestrator CLI
//!
//! ```text
//! keel run plan.toml          # new run
//! keel status                 # saved state, points, pending escalation
//! keel retry deploy           # fresh attempt budget for one task, then continue
//! keel recover --auto         # restore the newest valid recovery point
//! keel pause                  # ask the running engine to stop
//! keel resume                 # continue the saved run
//! ```

mod commands;
mod console;
mod executor;
mod exit_error;
mod lock;
mod logging;
mod output;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::exit_error::{EXIT_OTHER, ExitError};
use crate::output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "keel", version, about = "Resilient execution orchestrator")]
pub struct Cli {
    /// Config file (default: ./keel.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// State directory, overriding `state_dir` from the config
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[arg(short = 'o', long, value_enum, default_value_t, global = true)]
    pub output: OutputFormat,

    /// Debug logging (KEEL_LOG / RUST_LOG take precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a new run from a plan file (TOML or JSON)
    Run {
        plan: PathBuf,
        #[command(flatten)]
        attend: AttendArgs,
    },
    /// Continue the saved run
    Resume {
        #[command(flatten)]
        attend: AttendArgs,
    },
    /// Show the saved run, its recovery points and any pending escalation
    Status,
    /// Give a task a fresh attempt budget and continue the run
    Retry {
        task: String,
        #[command(flatten)]
        attend: AttendArgs,
    },
    /// Replace the live state with a recovery point
    Recover(RecoverArgs),
    /// Ask the running engine to pause
    Pause,
    /// List recovery points
    Points,
    /// Remove recovery points outside the retention policy
    Prune,
}

#[derive(Debug, Clone, Copy, Args)]
pub struct AttendArgs {
    /// Never wait for an operator; escalated tasks are deferred
    #[arg(long)]
    pub unattended: bool,
}

#[derive(Debug, Clone, Args)]
#[group(multiple = false)]
pub struct RecoverArgs {
    /// Newest point that passes validation (the default)
    #[arg(long)]
    pub auto: bool,

    /// Pick a point from a list
    #[arg(long)]
    pub interactive: bool,

    /// A specific point id (`rp-...`)
    #[arg(long)]
    pub point: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Err(err) = commands::dispatch(cli).await {
        let (code, message) = match err.downcast_ref::<ExitError>() {
            Some(exit) => (exit.code, exit.message.clone()),
            None => (EXIT_OTHER, format!("error: {err:#}")),
        };
        if !message.is_empty() {
            eprintln!("{message}");
        }
        std::process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case::run(&["keel", "run", "plan.toml", "--unattended"])]
    #[case::status_json(&["keel", "status", "-o", "json"])]
    #[case::retry(&["keel", "retry", "deploy"])]
    #[case::recover_point(&["keel", "recover", "--point", "rp-01ARZ3NDEKTSV4RRFFQ69G5FAV"])]
    #[case::global_state_dir(&["keel", "--state-dir", "/tmp/k", "pause"])]
    fn accepted(#[case] argv: &[&str]) {
        assert!(Cli::try_parse_from(argv).is_ok());
    }

    #[rstest]
    #[case::two_targets(&["keel", "recover", "--auto", "--point", "rp-x"])]
    #[case::retry_without_task(&["keel", "retry"])]
    #[case::run_without_plan(&["keel", "run"])]
    fn rejected(#[case] argv: &[&str]) {
        assert!(Cli::try_parse_from(argv).is_err());
    }
}
