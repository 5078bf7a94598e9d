//! RecoveryManager - recovery point の作成・一覧・復元・prune
//!
//! # 方針
//! - 作成時は StateStore を *読む* だけ（書き込みハンドルは持たない）。
//!   engine が save した直後に呼ぶので、point はその時点の正本のコピーになる
//! - 復元は snapshot を validate してから返す。live state への反映は engine の仕事
//! - 「最新」は PointId の順序で決まる（ID が時刻由来で単調増加）

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tracing::{debug, info, warn};

use crate::config::RecoveryConfig;
use crate::domain::{
    ConsistencyError, PointId, PointMetadata, RecoverTarget, RecoveryReason, Run, TaskId,
};
use crate::ports::{Clock, IdGenerator, PointStore, PointStoreError, StateReader, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Points(#[from] PointStoreError),

    #[error("no recovery points")]
    NoPoints,

    #[error("no recovery point passes validation")]
    NoValidPoint,

    #[error("recovery point {point} is inconsistent: {}", render(.errors))]
    Invalid {
        point: PointId,
        errors: Vec<ConsistencyError>,
    },
}

fn render(errors: &[ConsistencyError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// A validated snapshot, ready to become the live state.
#[derive(Debug, Clone)]
pub struct Restored {
    pub run: Run,
    pub point: PointMetadata,
    /// Task the engine will pick up first after resuming from this point.
    pub next_task: Option<TaskId>,
}

pub struct RecoveryManager {
    points: Arc<dyn PointStore>,
    state: Arc<dyn StateReader>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: RecoveryConfig,
}

impl RecoveryManager {
    pub fn new(
        points: Arc<dyn PointStore>,
        state: Arc<dyn StateReader>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            points,
            state,
            clock,
            ids,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Snapshot the saved state. Returns only once the point is durable.
    pub async fn create(
        &self,
        reason: RecoveryReason,
        task_id: Option<TaskId>,
        note: Option<String>,
    ) -> Result<PointMetadata, RecoveryError> {
        let run = self.state.load().await?;
        let meta = PointMetadata {
            id: self.ids.generate_point_id(),
            run_id: run.run_id,
            reason,
            created_at: self.clock.now(),
            task_id,
            note,
            run_status: run.status,
            completed_count: run.completed_count,
            total_tasks: run.total_tasks,
        };
        self.points.write(&meta, &run).await?;
        debug!(point = %meta.id, reason = %reason, task = ?meta.task_id, "recovery point created");
        Ok(meta)
    }

    /// Every point, oldest first.
    pub async fn list(&self) -> Result<Vec<PointMetadata>, RecoveryError> {
        Ok(self.points.list().await?)
    }

    pub async fn latest(&self) -> Result<Option<PointMetadata>, RecoveryError> {
        Ok(self.points.list().await?.pop())
    }

    /// Raw snapshot, not validated.
    pub async fn snapshot(&self, id: PointId) -> Result<Run, RecoveryError> {
        Ok(self.points.read(id).await?)
    }

    /// Validate a point and return it. `None` means the latest point.
    pub async fn restore(&self, id: Option<PointId>) -> Result<Restored, RecoveryError> {
        let list = self.points.list().await?;
        let point = match id {
            Some(id) => list
                .into_iter()
                .find(|m| m.id == id)
                .ok_or(PointStoreError::UnknownPoint(id))?,
            None => list.into_iter().last().ok_or(RecoveryError::NoPoints)?,
        };
        self.load_point(point).await
    }

    /// `Auto` walks back from the newest point to the first one that validates.
    pub async fn restore_target(&self, target: RecoverTarget) -> Result<Restored, RecoveryError> {
        match target {
            RecoverTarget::Point(id) => self.restore(Some(id)).await,
            RecoverTarget::Auto => {
                let list = self.points.list().await?;
                if list.is_empty() {
                    return Err(RecoveryError::NoPoints);
                }
                for point in list.into_iter().rev() {
                    let id = point.id;
                    match self.load_point(point).await {
                        Ok(restored) => return Ok(restored),
                        Err(e) => warn!(point = %id, error = %e, "skipping unusable recovery point"),
                    }
                }
                Err(RecoveryError::NoValidPoint)
            }
        }
    }

    async fn load_point(&self, point: PointMetadata) -> Result<Restored, RecoveryError> {
        let run = self.points.read(point.id).await?;
        let errors = self.state.validate(&run);
        if !errors.is_empty() {
            return Err(RecoveryError::Invalid {
                point: point.id,
                errors,
            });
        }

        let mut resumed = run.clone();
        resumed.normalize_for_resume(self.clock.now());
        let next_task = resumed.next_task();

        info!(point = %point.id, reason = %point.reason, next = ?next_task, "recovery point restored");
        Ok(Restored {
            run,
            point,
            next_task,
        })
    }

    /// Keep the newest `keep_last` points and every on-error point inside the
    /// retention window; remove the rest. Returns the removed ids.
    pub async fn prune(&self) -> Result<Vec<PointId>, RecoveryError> {
        let list = self.points.list().await?;
        let cutoff = self.clock.now()
            - ChronoDuration::milliseconds(self.config.on_error_retention_ms as i64);

        let mut keep: HashSet<PointId> = list
            .iter()
            .rev()
            .take(self.config.keep_last)
            .map(|m| m.id)
            .collect();
        keep.extend(
            list.iter()
                .filter(|m| m.reason == RecoveryReason::OnError && m.created_at >= cutoff)
                .map(|m| m.id),
        );

        let mut removed = Vec::new();
        for meta in list.into_iter().filter(|m| !keep.contains(&m.id)) {
            self.points.remove(meta.id).await?;
            removed.push(meta.id);
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), kept = keep.len(), "pruned recovery points");
        }
        Ok(removed)
    }
}
