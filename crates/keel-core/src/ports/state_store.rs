//! StateStore port - Run の正本（source of truth）
//!
//! # 設計原則
//! - 書き込みは Execution Engine だけ（single writer）
//! - 他のコンポーネントには `StateReader` しか渡さない。
//!   書き込みハンドルを持っていないこと自体が並行制御になる
//! - save は reader から見て atomic（temp に書いて rename、その後 backup）

use async_trait::async_trait;

use crate::domain::{ConsistencyError, Run};

/// Where `load` found a valid run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    /// The primary was missing or invalid; the backup was used.
    Backup,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Neither copy is usable. Fatal: the ground truth is unknown.
    #[error("state corrupted (primary: {primary}; backup: {backup})")]
    StateCorrupted { primary: String, backup: String },

    /// No state has been saved yet.
    #[error("no saved state")]
    NotFound,
}

/// Read-only view of the state store.
#[async_trait]
pub trait StateReader: Send + Sync {
    /// Load the current run, falling back to the backup if the primary is unusable.
    async fn load_with_source(&self) -> Result<(Run, LoadSource), StoreError>;

    async fn load(&self) -> Result<Run, StoreError> {
        Ok(self.load_with_source().await?.0)
    }

    /// Consistency rules; an empty list means valid.
    fn validate(&self, run: &Run) -> Vec<ConsistencyError> {
        run.validate()
    }
}

/// Write handle. Only the engine (and offline operator commands) hold one.
#[async_trait]
pub trait StateStore: StateReader {
    async fn save(&self, run: &Run) -> Result<(), StoreError>;
}
