//! Error type that carries a process exit code.
//!
//! Commands return `ExitError` instead of calling `std::process::exit()`;
//! `main()` is the only place that terminates the process.

use std::fmt;

use keel_core::Finished;

pub const EXIT_FAILED: i32 = 2;
pub const EXIT_STATE_CORRUPTED: i32 = 3;
pub const EXIT_ABORTED: i32 = 4;
pub const EXIT_PAUSED: i32 = 5;
pub const EXIT_OTHER: i32 = 1;

#[derive(Debug)]
pub struct ExitError {
    pub code: i32,
    pub message: String,
}

impl ExitError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Exit code without a message; the caller already reported.
    pub fn silent(code: i32) -> Self {
        Self::new(code, String::new())
    }
}

/// Process exit code for how a run ended.
pub fn code_for(finished: &Finished) -> i32 {
    match finished {
        Finished::Completed => 0,
        Finished::Failed { .. } => EXIT_FAILED,
        Finished::StateCorrupted { .. } => EXIT_STATE_CORRUPTED,
        Finished::Aborted { .. } => EXIT_ABORTED,
        Finished::Paused { .. } => EXIT_PAUSED,
        Finished::Recovering { .. } => EXIT_OTHER,
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExitError {}
