//! Implementations of the ports (files under the state directory, memory for tests).

pub mod atomic;
pub mod file_store;
pub mod journal;
pub mod memory;
pub mod point_dir;
pub mod proc_probe;

pub use file_store::{FileStateStore, BACKUP_FILE, STATE_FILE};
pub use journal::{read_jsonl, JsonlEventSink, HEALTH_FILE, JOURNAL_FILE};
pub use memory::{MemoryPointStore, MemoryStateStore};
pub use point_dir::DirPointStore;
pub use proc_probe::ProcProbe;
