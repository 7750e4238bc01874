pub mod config;
pub mod status;
pub mod sync;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::EngineConfig;
pub use status::{Progress, Severity, StatusSink, StatusUpdate, SyncStats};
pub use sync::conflict::{AskDecision, ConflictCase, ConflictPolicy};
pub use sync::engine::{EngineError, EngineStatus, SyncEngine};
pub use sync::local_watcher::{WatcherEvent, WatcherEventKind};
pub use sync::state_store::TrackedFile;
