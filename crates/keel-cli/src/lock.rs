//! Exclusive lock on the state directory.
//!
//! The engine is the only writer of the state files. Every command that
//! writes them (run, resume, retry, recover, prune) holds this lock first.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use fs2::FileExt;

use crate::exit_error::{EXIT_OTHER, ExitError};

pub const LOCK_FILE: &str = "keel.lock";

/// Released on drop.
#[derive(Debug)]
pub struct StateLock {
    file: File,
}

impl StateLock {
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("creating {}", state_dir.display()))?;
        let path = state_dir.join(LOCK_FILE);

        // no truncate before the lock is ours: the file holds the owner's pid
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            let owner = std::fs::read_to_string(&path).unwrap_or_default();
            return Err(ExitError::new(
                EXIT_OTHER,
                format!(
                    "{} is in use by another keel process (pid {})",
                    state_dir.display(),
                    owner.trim()
                ),
            )
            .into());
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
