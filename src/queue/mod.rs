//! Offline queue
//!
//! Durable queue of pending remote mutations and the manager that drains it.

pub mod health;
pub mod item;
pub mod manager;
pub mod storage;

pub use health::{HealthStatus, ProcessingStats, QueueHealth};
pub use item::{
    retry_backoff, ItemMetadata, OperationType, Priority, QueueItem, QueueOperation, QueueStatus,
    DEFAULT_MAX_RETRIES,
};
pub use manager::{
    BatchProcessingResult, FailureDisposition, ItemOutcome, ProcessingCallback, ProcessingResult,
    QueueError, QueueManager, QueueManagerConfig,
};
pub use storage::{
    DeadLetterEntry, DeadLetterReason, ItemUpdate, MaintenanceReport, OfflineStorage, QueueFilter,
    StorageConfig, StorageError, StorageStats,
};
