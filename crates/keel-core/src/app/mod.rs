//! App - アプリケーション層
//!
//! ports を組み合わせて orchestrator の振る舞いを実装する。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: 構築とワイヤリング（起動時検証）
//! - **Engine**: 実行ループ。Run を書き換える唯一の場所
//! - **RecoveryManager**: recovery point の作成・復元・prune
//! - **CircuitBreakers**: operation ごとの circuit breaker
//! - **HealthMonitor**: 定期 watchdog（別タスク）
//! - **InterventionGateway**: オペレーターへの escalation
//! - **RunSummary**: `keel status` 用のビュー

pub mod breaker;
pub mod builder;
pub mod engine;
pub mod health_monitor;
pub mod intervention;
pub mod recovery;
pub mod status;

pub use self::breaker::{CircuitBreakers, Transition};
pub use self::builder::{BuildError, EngineBuilder, Orchestrator, Outcome};
pub use self::engine::{Engine, EnginePhase, Finished};
pub use self::health_monitor::HealthMonitor;
pub use self::intervention::{
    read_escalation, GatewayHandle, InterventionGateway, Notice, OperatorHandle, Resolution,
};
pub use self::recovery::{RecoveryError, RecoveryManager, Restored};
pub use self::status::{PointLine, RunSummary, TaskCounts, TaskLine};
