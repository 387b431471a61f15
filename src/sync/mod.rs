//! Sync Module - Offline queue to remote store synchronization
//!
//! Provides:
//! - Dispatch: routes queued operations to remote store calls
//! - Progress: throughput and ETA tracking per run
//! - Engine: sync runs with pause/resume/stop and network-reactive pausing
//!
//! Architecture:
//! - Items are claimed from the queue before dispatch, so no item is sent twice
//! - Duplicate inserts are settled, never retried
//! - Duplicate events across data sources are resolved after each batch

pub mod dispatch;
pub mod engine;
pub mod progress;

#[cfg(test)]
mod tests;

pub use dispatch::{classify, should_retry_on_error, ErrorClass, RemoteDispatcher};
pub use engine::{SyncEngine, SyncEngineConfig, SyncError, SyncEvent, SyncResult, SyncState};
pub use progress::SyncProgress;
