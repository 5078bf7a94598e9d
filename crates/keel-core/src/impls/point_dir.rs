//! Recovery points on disk: one directory per point.
//!
//! ```text
//! points/
//!   rp-01J.../
//!     meta.json      PointMetadata
//!     state.json     the Run at capture time
//!     journal.jsonl  copies of the supporting logs, when present
//! ```
//!
//! A point is assembled under `<id>.tmp` and renamed into place, so a
//! listed point is always complete.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use super::atomic::write_atomic;
use crate::domain::{PointId, PointMetadata, Run};
use crate::ports::{PointStore, PointStoreError};

const META_FILE: &str = "meta.json";
const SNAPSHOT_FILE: &str = "state.json";

#[derive(Debug, Clone)]
pub struct DirPointStore {
    root: PathBuf,
    /// Log files copied into every point.
    attachments: Vec<PathBuf>,
}

impl DirPointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachments.push(path.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn point_dir(&self, id: PointId) -> PathBuf {
        self.root.join(id.to_string())
    }

    async fn read_meta(dir: &Path) -> Result<PointMetadata, PointStoreError> {
        let bytes = tokio::fs::read(dir.join(META_FILE)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl PointStore for DirPointStore {
    async fn write(&self, meta: &PointMetadata, run: &Run) -> Result<(), PointStoreError> {
        let final_dir = self.point_dir(meta.id);
        let staging = self.root.join(format!("{}.tmp", meta.id));
        if tokio::fs::try_exists(&staging).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&staging).await?;

        write_atomic(&staging.join(SNAPSHOT_FILE), &serde_json::to_vec_pretty(run)?).await?;
        for source in &self.attachments {
            let Some(name) = source.file_name() else { continue };
            match tokio::fs::read(source).await {
                Ok(bytes) => write_atomic(&staging.join(name), &bytes).await?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        // meta last: its presence marks the point as complete
        write_atomic(&staging.join(META_FILE), &serde_json::to_vec_pretty(meta)?).await?;

        tokio::fs::rename(&staging, &final_dir).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PointMetadata>, PointStoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut points = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(".tmp") || name.parse::<PointId>().is_err() {
                continue;
            }
            match Self::read_meta(&path).await {
                Ok(meta) => points.push(meta),
                Err(e) => warn!(point = name, error = %e, "skipping unreadable recovery point"),
            }
        }
        points.sort_by_key(|m| m.id);
        Ok(points)
    }

    async fn read(&self, id: PointId) -> Result<Run, PointStoreError> {
        let path = self.point_dir(id).join(SNAPSHOT_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PointStoreError::UnknownPoint(id));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn remove(&self, id: PointId) -> Result<(), PointStoreError> {
        match tokio::fs::remove_dir_all(self.point_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PointStoreError::UnknownPoint(id))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RecoveryReason, RunId, TaskSpec};
    use chrono::Utc;
    use ulid::Ulid;

    fn meta_for(run: &Run, id: PointId) -> PointMetadata {
        PointMetadata {
            id,
            run_id: run.run_id,
            reason: RecoveryReason::Manual,
            created_at: Utc::now(),
            task_id: None,
            note: Some("before deploy".into()),
            run_status: run.status,
            completed_count: run.completed_count,
            total_tasks: run.total_tasks,
        }
    }

    #[tokio::test]
    async fn write_list_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let journal = dir.path().join("journal.jsonl");
        std::fs::write(&journal, "{}\n").unwrap();
        let store = DirPointStore::new(dir.path().join("points")).with_attachment(&journal);

        let run = Run::new(RunId::from_ulid(Ulid::new()), vec![TaskSpec::new("a")], Utc::now());
        let first = PointId::from_ulid(Ulid::from_parts(1, 1));
        let second = PointId::from_ulid(Ulid::from_parts(2, 1));
        store.write(&meta_for(&run, second), &run).await.unwrap();
        store.write(&meta_for(&run, first), &run).await.unwrap();

        let listed: Vec<PointId> = store.list().await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(listed, vec![first, second]);
        assert!(store.root().join(first.to_string()).join("journal.jsonl").exists());

        assert_eq!(store.read(first).await.unwrap(), run);

        store.remove(first).await.unwrap();
        assert!(matches!(
            store.read(first).await,
            Err(PointStoreError::UnknownPoint(_))
        ));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_ignores_staging_and_foreign_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirPointStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("rp-01J00000000000000000000000.tmp")).unwrap();
        std::fs::create_dir_all(dir.path().join("lost+found")).unwrap();

        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_root_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirPointStore::new(dir.path().join("never-created"));
        assert!(store.list().await.unwrap().is_empty());
    }
}
