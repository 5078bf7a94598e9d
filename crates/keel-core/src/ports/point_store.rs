//! PointStore port - recovery point の保存先
//!
//! point は作成後に変更されない（immutable）。削除は prune だけ。

use async_trait::async_trait;

use crate::domain::{PointId, PointMetadata, Run};

#[derive(Debug, thiserror::Error)]
pub enum PointStoreError {
    #[error("recovery point i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("recovery point serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown recovery point {0}")]
    UnknownPoint(PointId),
}

#[async_trait]
pub trait PointStore: Send + Sync {
    /// Persist a snapshot. Must not return before the point is durable.
    async fn write(&self, meta: &PointMetadata, run: &Run) -> Result<(), PointStoreError>;

    /// Every point, oldest first.
    async fn list(&self) -> Result<Vec<PointMetadata>, PointStoreError>;

    async fn read(&self, id: PointId) -> Result<Run, PointStoreError>;

    async fn remove(&self, id: PointId) -> Result<(), PointStoreError>;
}
