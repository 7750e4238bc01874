pub mod backoff;
pub mod conflict;
pub mod engine;
pub mod local_tree;
pub mod local_watcher;
pub mod paths;
pub mod probe;
pub mod queue;
pub mod remote_tree;
pub mod retry;
pub mod state_store;
