use thiserror::Error;

use crate::app::builder::BuildError;
use crate::app::recovery::RecoveryError;
use crate::config::ConfigError;
use crate::domain::PlanError;
use crate::ports::StoreError;

#[derive(Debug, Error)]
pub enum KeelError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    /// Neither state copy is usable; the ground truth is unknown.
    #[error("state corrupted: {0}")]
    StateCorrupted(String),

    #[error("aborted: {0}")]
    Aborted(String),
}

impl KeelError {
    /// `StoreError::StateCorrupted` and our own variant are the same condition.
    pub fn is_state_corruption(&self) -> bool {
        matches!(
            self,
            KeelError::StateCorrupted(_) | KeelError::Store(StoreError::StateCorrupted { .. })
        )
    }
}
