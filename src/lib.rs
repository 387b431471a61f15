//! # CommLog Sync
//!
//! Offline-first sync core for call and SMS logs. Events and contacts are
//! queued locally, drained to a remote store when the network allows, and
//! duplicate events from different data sources are resolved remotely.

pub mod config;
pub mod conflict;
pub mod crypto;
pub mod db;
pub mod models;
pub mod network;
pub mod queue;
pub mod remote;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use config::{ConfigError, SyncSettings};
pub use conflict::{Conflict, ConflictResolver, ConflictResolverConfig, ConflictSummary, DetectOptions, TimeWindow};
pub use crypto::DeviceSecret;
pub use db::Database;
pub use models::{CommunicationEvent, Contact, DataSource, Direction, EventType, SyncHealthRecord};
pub use network::{ConnectionQuality, ConnectivityProvider, ConnectivityReport, NetworkDetector, NetworkState, SyncStrategy};
pub use queue::{OfflineStorage, OperationType, Priority, QueueHealth, QueueItem, QueueManager, QueueOperation};
pub use remote::{RemoteError, RemoteStore};
pub use sync::{SyncEngine, SyncEvent, SyncProgress, SyncResult, SyncState};

use crypto::{CryptoError, PayloadCodec};
use db::DbError;
use std::path::Path;
use std::sync::Arc;
use sync::RemoteDispatcher;

const DATABASE_FILE: &str = "offline_queue.db";
const DEVICE_SECRET_FILE: &str = "device.key";

/// Initialize `env_logger` with an `info` default; later calls are no-ops
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

// ============================================================================
// Composition Root
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Every component of the sync core, wired together
///
/// Queue items are dispatched to `remote` both by the engine and by the
/// queue manager's own background passes.
pub struct SyncCore {
    pub db: Database,
    pub settings: SyncSettings,
    pub storage: OfflineStorage,
    pub network: NetworkDetector,
    pub queue: QueueManager,
    pub resolver: Arc<ConflictResolver>,
    pub engine: SyncEngine,
}

impl SyncCore {
    pub fn new(
        db: Database,
        remote: Arc<dyn RemoteStore>,
        settings: SyncSettings,
        device_secret: Option<DeviceSecret>,
    ) -> Result<Self, CoreError> {
        settings.validate()?;

        let secret = if settings.storage.encrypt_payloads {
            if device_secret.is_none() {
                log::warn!("Payload encryption enabled but no device secret given; storing unencrypted");
            }
            device_secret
        } else {
            None
        };
        let codec = PayloadCodec::new(secret, settings.storage.compression_threshold_bytes);
        let storage = OfflineStorage::new(db.clone(), codec, settings.storage.clone());

        let network = NetworkDetector::new(settings.network.clone());
        let queue = QueueManager::new(storage.clone(), network.clone(), settings.queue.clone());

        let dispatcher = RemoteDispatcher::new(remote.clone());
        for operation_type in OperationType::ALL {
            queue.register_processing_callback(operation_type, Arc::new(dispatcher.clone()));
        }

        let resolver = Arc::new(ConflictResolver::new(remote, settings.resolver_config()));
        let engine = SyncEngine::new(queue.clone(), resolver.clone(), dispatcher, settings.engine.clone());

        Ok(Self {
            db,
            settings,
            storage,
            network,
            queue,
            resolver,
            engine,
        })
    }

    /// Open the queue database and device secret under `data_dir`
    pub fn open(data_dir: &Path, remote: Arc<dyn RemoteStore>) -> Result<Self, CoreError> {
        let db = Database::new(data_dir.join(DATABASE_FILE))?;
        let settings = SyncSettings::load(&db)?;
        let secret = DeviceSecret::load_or_create(&data_dir.join(DEVICE_SECRET_FILE))?;
        Self::new(db, remote, settings, Some(secret))
    }

    /// `open` in the platform data directory
    pub fn open_default(remote: Arc<dyn RemoteStore>) -> Result<Self, CoreError> {
        let db_path = Database::default_path()?;
        let data_dir = db_path
            .parent()
            .ok_or_else(|| DbError::Io("Database path has no parent directory".to_string()))?;
        Self::open(data_dir, remote)
    }

    /// Follow platform connectivity and start background queue upkeep
    pub async fn start(&self, provider: Option<Arc<dyn ConnectivityProvider>>) {
        if let Some(provider) = provider {
            self.network.initialize(provider).await;
        }
        self.queue.start();
        log::info!("Sync core started");
    }

    /// Stop any run, wait for in-flight items, and stop background tasks
    pub async fn shutdown(&self) {
        self.engine.stop_sync().await;
        self.queue.shutdown();
        self.network.shutdown();
        log::info!("Sync core shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryRemoteStore, RemoteOp};
    use crate::test_support::sample_event;

    fn manual_settings() -> SyncSettings {
        let mut settings = SyncSettings::default();
        settings.queue.auto_process_on_enqueue = false;
        settings.engine.inter_batch_delay_ms = 0;
        settings
    }

    #[tokio::test]
    async fn test_core_wires_queue_to_remote() {
        init_logging();
        let remote = Arc::new(MemoryRemoteStore::new());
        let core = SyncCore::new(
            Database::in_memory().unwrap(),
            remote.clone(),
            manual_settings(),
            Some(DeviceSecret::from_bytes([9u8; 32])),
        )
        .unwrap();
        core.network.update(ConnectivityReport::wifi(Some(90)));

        core.queue.enqueue_event(sample_event("user-1"), Priority::High).await.unwrap();
        let batch = core.queue.start_processing().await.unwrap();
        assert_eq!(batch.successful, 1);

        core.queue.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();
        let result = core.engine.start_sync().await.unwrap();
        assert!(result.success);
        assert_eq!(result.total_processed, 1);
        assert_eq!(remote.call_count(Some(RemoteOp::Insert)), 2);

        core.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_persists_secret_and_settings() {
        let dir = tempfile::tempdir().unwrap();
        let remote: Arc<dyn RemoteStore> = Arc::new(MemoryRemoteStore::new());

        {
            let core = SyncCore::open(dir.path(), remote.clone()).unwrap();
            let mut settings = core.settings.clone();
            settings.engine.batch_size = 12;
            settings.save(&core.db).unwrap();
            core.queue
                .enqueue_event(sample_event("user-1"), Priority::Normal)
                .await
                .unwrap();
        }

        let core = SyncCore::open(dir.path(), remote).unwrap();
        assert_eq!(core.settings.engine.batch_size, 12);
        assert!(dir.path().join(DEVICE_SECRET_FILE).exists());
        // Same secret, so the queued payload still decrypts
        let pending = core.storage.retrieve_many(queue::QueueFilter::default(), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut settings = SyncSettings::default();
        settings.engine.batch_size = 0;
        let result = SyncCore::new(
            Database::in_memory().unwrap(),
            Arc::new(MemoryRemoteStore::new()),
            settings,
            None,
        );
        assert!(matches!(result, Err(CoreError::Config(_))));
    }
}
