//! In-memory state and point stores (tests, dry runs).
//!
//! Both keep serialized JSON rather than live structs, so a snapshot is a
//! copy by construction.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::{PointId, PointMetadata, Run};
use crate::ports::{
    LoadSource, PointStore, PointStoreError, StateReader, StateStore, StoreError,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    primary: Mutex<Option<String>>,
    saves: Mutex<u64>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored document verbatim (e.g. with garbage).
    pub fn set_raw(&self, raw: impl Into<String>) {
        *lock(&self.primary) = Some(raw.into());
    }

    pub fn save_count(&self) -> u64 {
        *lock(&self.saves)
    }
}

#[async_trait]
impl StateReader for MemoryStateStore {
    async fn load_with_source(&self) -> Result<(Run, LoadSource), StoreError> {
        let raw = lock(&self.primary).clone().ok_or(StoreError::NotFound)?;
        let run: Run = serde_json::from_str(&raw).map_err(|e| StoreError::StateCorrupted {
            primary: format!("malformed: {e}"),
            backup: "none".to_string(),
        })?;
        let errors = run.validate();
        if !errors.is_empty() {
            return Err(StoreError::StateCorrupted {
                primary: errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
                backup: "none".to_string(),
            });
        }
        Ok((run, LoadSource::Primary))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, run: &Run) -> Result<(), StoreError> {
        let raw = serde_json::to_string(run)?;
        *lock(&self.primary) = Some(raw);
        *lock(&self.saves) += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryPointStore {
    points: Mutex<BTreeMap<PointId, (PointMetadata, String)>>,
    fail_writes: Mutex<bool>,
}

impl MemoryPointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `write` fail with an i/o error.
    pub fn fail_writes(&self, fail: bool) {
        *lock(&self.fail_writes) = fail;
    }
}

#[async_trait]
impl PointStore for MemoryPointStore {
    async fn write(&self, meta: &PointMetadata, run: &Run) -> Result<(), PointStoreError> {
        if *lock(&self.fail_writes) {
            return Err(PointStoreError::Io(std::io::Error::other(
                "point store unavailable",
            )));
        }
        let raw = serde_json::to_string(run)?;
        lock(&self.points).insert(meta.id, (meta.clone(), raw));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PointMetadata>, PointStoreError> {
        Ok(lock(&self.points)
            .values()
            .map(|(meta, _)| meta.clone())
            .collect())
    }

    async fn read(&self, id: PointId) -> Result<Run, PointStoreError> {
        let raw = lock(&self.points)
            .get(&id)
            .map(|(_, raw)| raw.clone())
            .ok_or(PointStoreError::UnknownPoint(id))?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn remove(&self, id: PointId) -> Result<(), PointStoreError> {
        lock(&self.points)
            .remove(&id)
            .map(|_| ())
            .ok_or(PointStoreError::UnknownPoint(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunId, TaskSpec};
    use chrono::Utc;
    use ulid::Ulid;

    #[tokio::test]
    async fn memory_store_round_trips_and_counts_saves() {
        let store = MemoryStateStore::new();
        assert!(matches!(store.load().await, Err(StoreError::NotFound)));

        let run = Run::new(RunId::from_ulid(Ulid::new()), vec![TaskSpec::new("a")], Utc::now());
        store.save(&run).await.unwrap();
        assert_eq!(store.load().await.unwrap(), run);
        assert_eq!(store.save_count(), 1);

        store.set_raw("nope");
        assert!(matches!(
            store.load().await,
            Err(StoreError::StateCorrupted { .. })
        ));
    }
}
