//! keel-core
//!
//! Resilient execution orchestrator: runs a plan of dependent tasks with
//! durable state, recovery points, retry / circuit-breaker policies, a
//! health watchdog and escalation to a human operator.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, run / task records, decision, circuit, health, escalation）
//! - **policy**: 純粋な判断ロジック（RetryController, ErrorClassifier）
//! - **ports**: 抽象化レイヤー（StateStore, PointStore, TaskExecutor, Clock, など）
//! - **impls**: ports の実装（state directory 上のファイル、テスト用の memory 実装）
//! - **app**: アプリケーションロジック（builder, engine, recovery, health monitor, gateway）
//! - **config**: `keel.toml`

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod policy;
pub mod ports;

/// Marker file in the state directory; its presence asks a running engine to pause.
pub const PAUSE_MARKER: &str = "pause.request";

/// The pending escalation, for operators who were not attached when it was raised.
pub const ESCALATION_FILE: &str = "escalation.json";

pub use app::{EngineBuilder, Finished, Orchestrator, Outcome};
pub use config::OrchestratorConfig;
pub use error::KeelError;
