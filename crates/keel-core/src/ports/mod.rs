//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部（ファイルシステム、executor、ホスト）へのインターフェース。
//! 実装は impls（と keel-cli）側にある。

pub mod clock;
pub mod event_sink;
pub mod executor;
pub mod host_probe;
pub mod id_generator;
pub mod point_store;
pub mod state_store;

pub use self::clock::{Clock, FixedClock, ManualClock, SystemClock, TokioClock};
pub use self::event_sink::{EventSink, MemoryEventSink, NoopEventSink};
pub use self::executor::{TaskContext, TaskExecutor, TaskOutcome};
pub use self::host_probe::{HostProbe, HostSample, StaticProbe};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::point_store::{PointStore, PointStoreError};
pub use self::state_store::{LoadSource, StateReader, StateStore, StoreError};
