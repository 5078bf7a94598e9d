//! Decision policies: retry ceilings / backoff and error classification.

pub mod classify;
pub mod retry;

pub use classify::ErrorClassifier;
pub use retry::{RetryController, RetryPolicy};
