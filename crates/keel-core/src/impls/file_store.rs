//! File-backed state store: `state.json` plus `state.json.bak`.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::atomic::write_atomic;
use crate::domain::Run;
use crate::ports::{LoadSource, StateReader, StateStore, StoreError};

pub const STATE_FILE: &str = "state.json";
pub const BACKUP_FILE: &str = "state.json.bak";

/// Why one copy of the state could not be used.
#[derive(Debug)]
enum CopyError {
    Missing,
    Unreadable(std::io::Error),
    Malformed(serde_json::Error),
    Inconsistent(Vec<String>),
}

impl fmt::Display for CopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyError::Missing => f.write_str("missing"),
            CopyError::Unreadable(e) => write!(f, "unreadable: {e}"),
            CopyError::Malformed(e) => write!(f, "malformed: {e}"),
            CopyError::Inconsistent(errors) => write!(f, "invalid: {}", errors.join("; ")),
        }
    }
}

/// State store over two files in one directory.
///
/// save: temp + rename the primary, then the same for the backup.
/// load: primary first; if missing or invalid, the backup.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    primary: PathBuf,
    backup: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            primary: dir.join(STATE_FILE),
            backup: dir.join(BACKUP_FILE),
        }
    }

    pub fn primary_path(&self) -> &Path {
        &self.primary
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    async fn read_copy(path: &Path) -> Result<Run, CopyError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(CopyError::Missing),
            Err(e) => return Err(CopyError::Unreadable(e)),
        };
        let run: Run = serde_json::from_slice(&bytes).map_err(CopyError::Malformed)?;
        let errors = run.validate();
        if errors.is_empty() {
            Ok(run)
        } else {
            Err(CopyError::Inconsistent(
                errors.iter().map(|e| e.to_string()).collect(),
            ))
        }
    }
}

#[async_trait]
impl StateReader for FileStateStore {
    async fn load_with_source(&self) -> Result<(Run, LoadSource), StoreError> {
        let primary_err = match Self::read_copy(&self.primary).await {
            Ok(run) => return Ok((run, LoadSource::Primary)),
            Err(e) => e,
        };

        match Self::read_copy(&self.backup).await {
            Ok(run) => {
                warn!(
                    primary = %self.primary.display(),
                    reason = %primary_err,
                    "primary state unusable, loaded backup"
                );
                Ok((run, LoadSource::Backup))
            }
            Err(CopyError::Missing) if matches!(primary_err, CopyError::Missing) => {
                Err(StoreError::NotFound)
            }
            Err(backup_err) => Err(StoreError::StateCorrupted {
                primary: primary_err.to_string(),
                backup: backup_err.to_string(),
            }),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, run: &Run) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(run)?;
        write_atomic(&self.primary, &bytes).await?;
        write_atomic(&self.backup, &bytes).await?;
        debug!(run_id = %run.run_id, status = %run.status, "state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunId, TaskSpec};
    use chrono::Utc;
    use ulid::Ulid;

    fn sample_run() -> Run {
        Run::new(
            RunId::from_ulid(Ulid::new()),
            vec![TaskSpec::new("a"), TaskSpec::new("b").depends_on("a")],
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn save_then_load_from_primary() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let run = sample_run();

        store.save(&run).await.unwrap();

        let (loaded, source) = store.load_with_source().await.unwrap();
        assert_eq!(source, LoadSource::Primary);
        assert_eq!(loaded, run);
        assert!(store.backup_path().exists());
    }

    #[tokio::test]
    async fn corrupt_primary_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let run = sample_run();
        store.save(&run).await.unwrap();

        std::fs::write(store.primary_path(), b"{ truncated").unwrap();

        let (loaded, source) = store.load_with_source().await.unwrap();
        assert_eq!(source, LoadSource::Backup);
        assert_eq!(loaded.run_id, run.run_id);
    }

    #[tokio::test]
    async fn inconsistent_primary_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let run = sample_run();
        store.save(&run).await.unwrap();

        let mut bad = run.clone();
        bad.completed_count = 5;
        std::fs::write(store.primary_path(), serde_json::to_vec(&bad).unwrap()).unwrap();

        let (_, source) = store.load_with_source().await.unwrap();
        assert_eq!(source, LoadSource::Backup);
    }

    #[tokio::test]
    async fn both_copies_bad_is_state_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        std::fs::write(store.primary_path(), b"garbage").unwrap();
        std::fs::write(store.backup_path(), b"also garbage").unwrap();

        let err = store.load().await.unwrap_err();
        match err {
            StoreError::StateCorrupted { primary, backup } => {
                assert!(primary.starts_with("malformed"));
                assert!(backup.starts_with("malformed"));
            }
            other => panic!("expected StateCorrupted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nothing_saved_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(matches!(store.load().await, Err(StoreError::NotFound)));
    }
}
