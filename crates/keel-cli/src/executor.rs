//! CommandExecutor - task payload をコマンドとして実行する TaskExecutor
//!
//! payload の形:
//!
//! ```toml
//! payload = { command = ["./deploy.sh", "--prod"], cwd = "deploy", env = { STAGE = "prod" }, exit_codes = { "75" = "rate_limit", "2" = "validation" } }
//! ```
//!
//! - exit 0 は成功
//! - それ以外の exit code は `exit_codes` で error id に変換、なければ `command_failed`
//! - timeout したら子プロセスは kill（`kill_on_drop`）

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use keel_core::ports::{TaskContext, TaskExecutor, TaskOutcome};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

pub const COMMAND_FAILED: &str = "command_failed";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandPayload {
    command: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    /// Exit code (as a string key) -> error identifier.
    #[serde(default)]
    exit_codes: BTreeMap<String, String>,
}

impl CommandPayload {
    fn error_for(&self, code: i32) -> String {
        self.exit_codes
            .get(&code.to_string())
            .cloned()
            .unwrap_or_else(|| COMMAND_FAILED.to_string())
    }
}

/// Runs each task's `payload.command`. Relative `cwd`s resolve against the
/// directory keel was started in.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        Self
    }

    fn command(&self, payload: &CommandPayload, ctx: &TaskContext) -> Option<Command> {
        let (program, args) = payload.command.split_first()?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&payload.env)
            .env("KEEL_RUN_ID", ctx.run_id.to_string())
            .env("KEEL_TASK_ID", ctx.task_id.as_str())
            .env("KEEL_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &payload.cwd {
            cmd.current_dir(cwd);
        }
        Some(cmd)
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, ctx: &TaskContext) -> TaskOutcome {
        let payload: CommandPayload = match serde_json::from_value(ctx.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => return TaskOutcome::failure("malformed_task", format!("bad payload: {e}")),
        };
        let Some(mut cmd) = self.command(&payload, ctx) else {
            return TaskOutcome::failure("malformed_task", "payload.command is empty");
        };

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return TaskOutcome::failure("not_found", format!("{}: {e}", payload.command[0]));
            }
            Err(e) => return TaskOutcome::failure(COMMAND_FAILED, format!("spawn: {e}")),
        };

        let output = match tokio::time::timeout(ctx.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return TaskOutcome::failure(COMMAND_FAILED, format!("wait: {e}")),
            Err(_) => {
                return TaskOutcome::failure(
                    "timeout",
                    format!("killed after {}ms", ctx.timeout.as_millis()),
                );
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(task = %ctx.task_id, stdout = %stdout.trim_end(), "command output");
        }
        if output.status.success() {
            return TaskOutcome::Success;
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = stderr.lines().last().unwrap_or_default().trim();
        match output.status.code() {
            Some(code) => TaskOutcome::failure(
                payload.error_for(code),
                format!("exit {code}: {tail}").trim_end_matches(": ").to_string(),
            ),
            None => TaskOutcome::failure(COMMAND_FAILED, format!("terminated by signal: {tail}")),
        }
    }
}
