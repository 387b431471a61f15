//! Queue Manager - enqueue, batch processing, retry policy and health
//!
//! Owns the in-memory processing state (which items are claimed) on top of
//! `OfflineStorage`. Processing passes claim ready items, hand each one to
//! the callback registered for its operation type, and settle the outcome:
//!
//! - success → item deleted
//! - conflict (remote already holds the record) → item deleted
//! - retryable failure → `failed` with exponential backoff, dead-lettered
//!   once the retry budget is spent
//! - non-retryable failure → dead-lettered
//!
//! A background maintenance task and a reconnect listener keep the queue
//! draining without the host having to drive it.

use super::health::{evaluate_health, HealthThresholds, ProcessingStats, QueueHealth, StatsTracker};
use super::item::{now_millis, retry_backoff, OperationType, Priority, QueueItem, QueueOperation};
use super::storage::{DeadLetterReason, ItemUpdate, MaintenanceReport, OfflineStorage, QueueFilter, StorageError};
use super::QueueStatus;
use crate::models::{CommunicationEvent, Contact, SyncHealthRecord};
use crate::network::{ListenerHandle, NetworkDetector, SyncStrategy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueManagerConfig {
    pub max_queue_size: u64,
    pub max_memory_usage_mb: f64,
    pub processing_batch_size: usize,
    pub max_processing_concurrency: usize,
    pub maintenance_interval_secs: u64,
    pub performance_monitoring_enabled: bool,
    pub default_max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub stale_item_age_hours: u64,
    /// Schedule a processing pass after every enqueue
    pub auto_process_on_enqueue: bool,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_memory_usage_mb: 50.0,
            processing_batch_size: 50,
            max_processing_concurrency: 5,
            maintenance_interval_secs: 300,
            performance_monitoring_enabled: true,
            default_max_retries: 5,
            retry_base_delay_ms: 30_000,
            retry_max_delay_ms: 3_600_000,
            stale_item_age_hours: 24,
            auto_process_on_enqueue: true,
        }
    }
}

impl QueueManagerConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    fn health_thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            max_queue_size: self.max_queue_size,
            max_memory_usage_mb: self.max_memory_usage_mb,
            stale_item_age: Duration::from_secs(self.stale_item_age_hours * 3600),
        }
    }
}

// ============================================================================
// Data Types
// ============================================================================

/// Outcome reported by a processing callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub success: bool,
    pub error: Option<String>,
    pub retry_recommended: bool,
    /// Remote already holds an equivalent record
    pub conflict: bool,
}

impl ProcessingResult {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
            retry_recommended: false,
            conflict: false,
        }
    }

    pub fn failure(error: impl Into<String>, retry_recommended: bool) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            retry_recommended,
            conflict: false,
        }
    }

    pub fn conflict(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            retry_recommended: false,
            conflict: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub item_id: String,
    pub operation_type: OperationType,
    pub result: ProcessingResult,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchProcessingResult {
    pub total_items: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<ItemOutcome>,
    pub processing_time: Duration,
}

/// What `mark_failed` did with the item
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    RetryScheduled {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    DeadLettered(DeadLetterReason),
    /// Item was already gone
    Missing,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Item owner {owner} does not match payload owner {payload}")]
    OwnerMismatch { owner: String, payload: String },
}

/// Async handler for one operation type
#[async_trait]
pub trait ProcessingCallback: Send + Sync {
    async fn process(&self, item: &QueueItem) -> ProcessingResult;
}

/// Adapter for plain async closures
struct FnCallback<F>(F);

#[async_trait]
impl<F, Fut> ProcessingCallback for FnCallback<F>
where
    F: Fn(QueueItem) -> Fut + Send + Sync,
    Fut: Future<Output = ProcessingResult> + Send + 'static,
{
    async fn process(&self, item: &QueueItem) -> ProcessingResult {
        (self.0)(item.clone()).await
    }
}

// ============================================================================
// Queue Manager
// ============================================================================

struct ManagerInner {
    storage: OfflineStorage,
    network: NetworkDetector,
    config: QueueManagerConfig,
    callbacks: StdRwLock<HashMap<OperationType, Arc<dyn ProcessingCallback>>>,
    stats: StdMutex<StatsTracker>,
    in_flight: StdMutex<InFlight>,
    in_flight_count: watch::Sender<usize>,
    processing: AtomicBool,
    stopped: AtomicBool,
    maintenance_task: StdMutex<Option<JoinHandle<()>>>,
    network_listener: StdMutex<Option<ListenerHandle>>,
}

#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<ManagerInner>,
}

/// Clears the reentrancy flag when a pass ends, including on early return
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Claimed items, plus claims still being taken
#[derive(Default)]
struct InFlight {
    /// Claimed item id → claim time
    items: HashMap<String, Instant>,
    /// `claim_batch` calls that have not registered their items yet
    claiming: usize,
}

impl InFlight {
    fn count(&self) -> usize {
        self.items.len() + self.claiming
    }
}

/// Keeps a `claim_batch` call visible to `wait_for_idle` until it returns
struct ClaimReservation<'a>(&'a QueueManager);

impl Drop for ClaimReservation<'_> {
    fn drop(&mut self) {
        self.0
            .update_in_flight(|in_flight| in_flight.claiming = in_flight.claiming.saturating_sub(1));
    }
}

impl QueueManager {
    pub fn new(storage: OfflineStorage, network: NetworkDetector, config: QueueManagerConfig) -> Self {
        let (in_flight_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(ManagerInner {
                storage,
                network,
                config,
                callbacks: StdRwLock::new(HashMap::new()),
                stats: StdMutex::new(StatsTracker::default()),
                in_flight: StdMutex::new(InFlight::default()),
                in_flight_count,
                processing: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                maintenance_task: StdMutex::new(None),
                network_listener: StdMutex::new(None),
            }),
        }
    }

    pub fn storage(&self) -> &OfflineStorage {
        &self.inner.storage
    }

    pub fn network(&self) -> &NetworkDetector {
        &self.inner.network
    }

    pub fn config(&self) -> &QueueManagerConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------------

    /// Register the handler for an operation type, replacing any previous one
    pub fn register_processing_callback(
        &self,
        operation_type: OperationType,
        callback: Arc<dyn ProcessingCallback>,
    ) {
        if let Ok(mut callbacks) = self.inner.callbacks.write() {
            if callbacks.insert(operation_type, callback).is_some() {
                log::warn!("Replaced processing callback for {}", operation_type.as_str());
            }
        }
    }

    pub fn register_fn<F, Fut>(&self, operation_type: OperationType, f: F)
    where
        F: Fn(QueueItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProcessingResult> + Send + 'static,
    {
        self.register_processing_callback(operation_type, Arc::new(FnCallback(f)));
    }

    fn callback_for(&self, operation_type: OperationType) -> Option<Arc<dyn ProcessingCallback>> {
        self.inner
            .callbacks
            .read()
            .ok()
            .and_then(|callbacks| callbacks.get(&operation_type).cloned())
    }

    // ------------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------------

    /// Persist a new item and schedule processing; returns the item id
    pub async fn enqueue(
        &self,
        user_id: &str,
        operation: QueueOperation,
        priority: Priority,
    ) -> Result<String, QueueError> {
        let item = self.build_item(user_id, operation, priority)?;
        self.inner.storage.store(&item).await?;
        log::debug!(
            "Enqueued {} {} for user {} ({:?})",
            item.operation_type().as_str(),
            item.id,
            user_id,
            priority
        );

        self.after_enqueue(1).await;
        Ok(item.id)
    }

    pub async fn enqueue_event(&self, event: CommunicationEvent, priority: Priority) -> Result<String, QueueError> {
        let user_id = event.user_id.clone();
        self.enqueue(&user_id, QueueOperation::CreateEvent(event), priority).await
    }

    pub async fn enqueue_event_update(
        &self,
        event: CommunicationEvent,
        original_event_id: impl Into<String>,
        priority: Priority,
    ) -> Result<String, QueueError> {
        let user_id = event.user_id.clone();
        let operation = QueueOperation::UpdateEvent {
            event,
            original_event_id: original_event_id.into(),
        };
        self.enqueue(&user_id, operation, priority).await
    }

    pub async fn enqueue_event_delete(
        &self,
        user_id: &str,
        event_id: impl Into<String>,
        priority: Priority,
    ) -> Result<String, QueueError> {
        let operation = QueueOperation::DeleteEvent {
            event_id: event_id.into(),
        };
        self.enqueue(user_id, operation, priority).await
    }

    /// Persist many events in one transaction
    pub async fn enqueue_batch(
        &self,
        events: Vec<CommunicationEvent>,
        priority: Priority,
    ) -> Result<Vec<String>, QueueError> {
        let items = events
            .into_iter()
            .map(|event| {
                let user_id = event.user_id.clone();
                self.build_item(&user_id, QueueOperation::CreateEvent(event), priority)
            })
            .collect::<Result<Vec<_>, _>>()?;

        if items.is_empty() {
            return Ok(Vec::new());
        }

        self.inner.storage.store_batch(&items).await?;
        log::info!("Enqueued batch of {} events", items.len());

        self.after_enqueue(items.len()).await;
        Ok(items.into_iter().map(|item| item.id).collect())
    }

    pub async fn enqueue_contact(&self, contact: Contact, priority: Priority) -> Result<String, QueueError> {
        let user_id = contact.user_id.clone();
        self.enqueue(&user_id, QueueOperation::CreateContact(contact), priority).await
    }

    pub async fn enqueue_contact_update(
        &self,
        contact: Contact,
        original_contact_id: impl Into<String>,
        priority: Priority,
    ) -> Result<String, QueueError> {
        let user_id = contact.user_id.clone();
        let operation = QueueOperation::UpdateContact {
            contact,
            original_contact_id: original_contact_id.into(),
        };
        self.enqueue(&user_id, operation, priority).await
    }

    pub async fn enqueue_sync_health(
        &self,
        record: SyncHealthRecord,
        priority: Priority,
    ) -> Result<String, QueueError> {
        let user_id = record.user_id.clone();
        self.enqueue(&user_id, QueueOperation::UpdateSyncHealth(record), priority).await
    }

    fn build_item(
        &self,
        user_id: &str,
        operation: QueueOperation,
        priority: Priority,
    ) -> Result<QueueItem, QueueError> {
        if let Some(payload_owner) = operation.payload_user_id() {
            if payload_owner != user_id {
                return Err(QueueError::OwnerMismatch {
                    owner: user_id.to_string(),
                    payload: payload_owner.to_string(),
                });
            }
        }

        Ok(QueueItem::new(user_id, operation, priority)
            .with_max_retries(self.inner.config.default_max_retries))
    }

    async fn after_enqueue(&self, added: usize) {
        match self.refresh_stats().await {
            Ok(stats) if stats.queue_depth > self.inner.config.max_queue_size => {
                // Never reject producer data; health reports the overflow
                log::warn!(
                    "Queue over capacity after adding {} items ({} > {})",
                    added,
                    stats.queue_depth,
                    self.inner.config.max_queue_size
                );
            }
            Ok(_) => {}
            Err(e) => log::warn!("Failed to refresh queue stats: {}", e),
        }

        if self.inner.config.auto_process_on_enqueue {
            self.schedule_processing();
        }
    }

    /// Run a processing pass in the background without waiting for it
    pub fn schedule_processing(&self) {
        if self.is_stopped() {
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            match manager.start_processing().await {
                Ok(result) if result.total_items > 0 => {
                    log::debug!(
                        "Background pass: {} ok, {} failed",
                        result.successful,
                        result.failed
                    );
                }
                Ok(_) => {}
                Err(e) => log::error!("Background processing pass failed: {}", e),
            }
        });
    }

    // ------------------------------------------------------------------------
    // Item lifecycle
    // ------------------------------------------------------------------------

    /// Claim up to `limit` ready items for the caller
    ///
    /// Returns nothing once processing is stopped, including when the stop
    /// lands while the claim is being taken.
    pub async fn claim_batch(&self, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        // Reserved before the stop check, so `stop_processing` waits for this claim
        let _reservation = self.reserve_claim();
        if self.is_stopped() {
            return Ok(Vec::new());
        }

        let items = self.inner.storage.claim_ready(QueueFilter::default(), limit).await?;
        if items.is_empty() {
            return Ok(items);
        }
        if self.is_stopped() {
            let ids: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
            let released = self.inner.storage.release_claims(&ids).await?;
            log::debug!("Processing stopped during claim, released {} items", released);
            return Ok(Vec::new());
        }

        let now = Instant::now();
        self.update_in_flight(|in_flight| {
            for item in &items {
                in_flight.items.insert(item.id.clone(), now);
            }
        });
        log::debug!("Claimed {} queue items", items.len());
        Ok(items)
    }

    fn reserve_claim(&self) -> ClaimReservation<'_> {
        self.update_in_flight(|in_flight| in_flight.claiming += 1);
        ClaimReservation(self)
    }

    /// Hand claimed but undispatched items back to the queue
    ///
    /// Retry metadata is left alone; the items are ready again immediately.
    pub async fn release_claims(&self, ids: &[String]) -> Result<usize, QueueError> {
        let result = self.inner.storage.release_claims(ids).await;
        self.update_in_flight(|in_flight| {
            for id in ids {
                in_flight.items.remove(id);
            }
        });
        Ok(result?)
    }

    /// Success: remove the item
    pub async fn mark_processed(&self, id: &str) -> Result<(), QueueError> {
        let result = self.inner.storage.delete(id).await;
        let elapsed = self.drop_claim(id);
        result?;

        self.with_stats(|stats| stats.record_success(elapsed));
        Ok(())
    }

    /// Duplicate of a record the remote already holds: remove without retry
    pub async fn mark_conflict(&self, id: &str, error: &str) -> Result<(), QueueError> {
        let result = self.inner.storage.delete(id).await;
        let elapsed = self.drop_claim(id);
        result?;

        log::info!("Queue item {} already present remotely: {}", id, error);
        self.with_stats(|stats| stats.record_conflict(elapsed));
        Ok(())
    }

    /// Failure: schedule a retry with backoff or retire the item
    pub async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        retry_recommended: bool,
    ) -> Result<FailureDisposition, QueueError> {
        let result = self.settle_failure(id, error, retry_recommended).await;
        let elapsed = self.drop_claim(id);
        let disposition = result?;

        self.with_stats(|stats| {
            stats.record_failure(elapsed);
            if matches!(disposition, FailureDisposition::DeadLettered(_)) {
                stats.record_dead_letter();
            }
        });
        Ok(disposition)
    }

    async fn settle_failure(
        &self,
        id: &str,
        error: &str,
        retry_recommended: bool,
    ) -> Result<FailureDisposition, QueueError> {
        let storage = &self.inner.storage;

        if !retry_recommended {
            let moved = storage
                .dead_letter(id, DeadLetterReason::NonRetryable, Some(error.to_string()))
                .await?;
            return Ok(if moved {
                FailureDisposition::DeadLettered(DeadLetterReason::NonRetryable)
            } else {
                FailureDisposition::Missing
            });
        }

        let item = match storage.retrieve(id).await? {
            Some(item) => item,
            None => return Ok(FailureDisposition::Missing),
        };

        let retry_count = item.metadata.retry_count.saturating_add(1);
        if retry_count >= item.metadata.max_retries {
            storage
                .update(
                    id,
                    ItemUpdate {
                        retry_count: Some(retry_count),
                        ..Default::default()
                    },
                )
                .await?;
            storage
                .dead_letter(id, DeadLetterReason::RetriesExhausted, Some(error.to_string()))
                .await?;
            log::warn!("Queue item {} gave up after {} attempts: {}", id, retry_count, error);
            return Ok(FailureDisposition::DeadLettered(DeadLetterReason::RetriesExhausted));
        }

        let config = &self.inner.config;
        let delay = retry_backoff(retry_count, config.retry_base_delay(), config.retry_max_delay());
        let next_retry_at = now_millis()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));

        let updated = storage
            .update(
                id,
                ItemUpdate {
                    status: Some(QueueStatus::Failed),
                    retry_count: Some(retry_count),
                    last_error: Some(Some(error.to_string())),
                    next_retry_at: Some(Some(next_retry_at)),
                    processing_started_at: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        if !updated {
            return Ok(FailureDisposition::Missing);
        }

        log::info!(
            "Queue item {} failed (attempt {}/{}), retry in {}s: {}",
            id,
            retry_count,
            item.metadata.max_retries,
            delay.as_secs(),
            error
        );
        Ok(FailureDisposition::RetryScheduled {
            retry_count,
            next_retry_at,
        })
    }

    fn update_in_flight(&self, f: impl FnOnce(&mut InFlight)) {
        if let Ok(mut in_flight) = self.inner.in_flight.lock() {
            f(&mut in_flight);
            self.inner.in_flight_count.send_replace(in_flight.count());
        }
    }

    /// Forget a settled claim; returns how long it was held
    fn drop_claim(&self, id: &str) -> Duration {
        let mut elapsed = Duration::ZERO;
        self.update_in_flight(|in_flight| {
            if let Some(claimed_at) = in_flight.items.remove(id) {
                elapsed = claimed_at.elapsed();
            }
        });
        elapsed
    }

    pub fn in_flight_count(&self) -> usize {
        *self.inner.in_flight_count.borrow()
    }

    fn with_stats(&self, f: impl FnOnce(&mut StatsTracker)) {
        if let Ok(mut stats) = self.inner.stats.lock() {
            f(&mut stats);
        }
    }

    // ------------------------------------------------------------------------
    // Processing
    // ------------------------------------------------------------------------

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// One bounded-concurrency processing pass
    ///
    /// Returns an empty result without side effects when another pass is
    /// running, when processing is stopped, or when the network strategy
    /// says not to sync.
    pub async fn start_processing(&self) -> Result<BatchProcessingResult, QueueError> {
        if self.is_stopped() {
            return Ok(BatchProcessingResult::default());
        }
        if self.inner.processing.swap(true, Ordering::AcqRel) {
            log::debug!("Processing pass already running");
            return Ok(BatchProcessingResult::default());
        }
        let _guard = PassGuard(&self.inner.processing);
        let started = Instant::now();

        let storage_stats = self.inner.storage.get_stats().await?;
        let queue_mb = storage_stats.total_size_bytes as f64 / (1024.0 * 1024.0);
        let offline_hours = storage_stats
            .oldest_item_age
            .map(|age| age.as_secs_f64() / 3600.0)
            .unwrap_or(0.0);

        let network = &self.inner.network;
        let strategy = network.determine_sync_strategy(queue_mb, offline_hours);
        let allowed = match strategy {
            SyncStrategy::Offline => false,
            SyncStrategy::WifiPreferred => network.get_current_state().is_wifi,
            SyncStrategy::CellularAllowed => true,
        };
        if !allowed {
            log::debug!("Skipping processing pass, strategy {:?}", strategy);
            return Ok(BatchProcessingResult::default());
        }

        let batch_size = self
            .inner
            .config
            .processing_batch_size
            .min(network.get_recommended_batch_size());
        let items = self.claim_batch(batch_size).await?;
        if items.is_empty() {
            return Ok(BatchProcessingResult::default());
        }

        let concurrency = self.inner.config.max_processing_concurrency.max(1);
        let results: Vec<ItemOutcome> = futures::stream::iter(items)
            .map(|item| self.process_item(item))
            .buffer_unordered(concurrency)
            .filter_map(futures::future::ready)
            .collect()
            .await;

        let successful = results.iter().filter(|r| r.result.success).count();
        let batch = BatchProcessingResult {
            total_items: results.len(),
            successful,
            failed: results.len() - successful,
            results,
            processing_time: started.elapsed(),
        };

        if let Err(e) = self.refresh_stats().await {
            log::warn!("Failed to refresh queue stats: {}", e);
        }

        log::info!(
            "Processed {} queue items ({} ok, {} failed) in {:?}",
            batch.total_items,
            batch.successful,
            batch.failed,
            batch.processing_time
        );
        Ok(batch)
    }

    /// `None` when the item was handed back undispatched
    async fn process_item(&self, item: QueueItem) -> Option<ItemOutcome> {
        if self.is_stopped() || !self.inner.network.get_current_state().is_connected {
            if let Err(e) = self.release_claims(std::slice::from_ref(&item.id)).await {
                log::error!("Failed to release queue item {}: {}", item.id, e);
            }
            return None;
        }

        let started = Instant::now();
        let operation_type = item.operation_type();

        let result = match self.callback_for(operation_type) {
            None => ProcessingResult::failure(
                format!("No processing callback registered for {}", operation_type.as_str()),
                true,
            ),
            Some(callback) => AssertUnwindSafe(callback.process(&item))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    log::error!("Processing callback panicked for item {}", item.id);
                    ProcessingResult::failure("processing callback panicked", true)
                }),
        };

        let settled = if result.success {
            self.mark_processed(&item.id).await.map(|_| ())
        } else if result.conflict {
            let error = result.error.as_deref().unwrap_or("duplicate record");
            self.mark_conflict(&item.id, error).await
        } else {
            let error = result.error.as_deref().unwrap_or("unknown error");
            self.mark_failed(&item.id, error, result.retry_recommended)
                .await
                .map(|_| ())
        };

        if let Err(e) = settled {
            // Claim stays in storage until maintenance releases it
            log::error!("Failed to settle queue item {}: {}", item.id, e);
        }

        Some(ItemOutcome {
            item_id: item.id,
            operation_type,
            result,
            duration_ms: started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
        })
    }

    /// Block new passes and wait for in-flight items and claims to settle
    ///
    /// Items a running pass claimed but has not dispatched yet go back to
    /// the queue untouched.
    pub async fn stop_processing(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.wait_for_idle().await;
        log::info!("Queue processing stopped");
    }

    /// Resolves once no claimed item or pending claim is outstanding
    pub async fn wait_for_idle(&self) {
        let mut count = self.inner.in_flight_count.subscribe();
        let _ = count.wait_for(|n| *n == 0).await;
    }

    pub fn resume_processing(&self) {
        if self.inner.stopped.swap(false, Ordering::AcqRel) {
            log::info!("Queue processing resumed");
        }
    }

    // ------------------------------------------------------------------------
    // Stats, health, maintenance
    // ------------------------------------------------------------------------

    async fn refresh_stats(&self) -> Result<ProcessingStats, QueueError> {
        let storage = self.inner.storage.get_stats().await?;
        let mut stats = self
            .inner
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stats.set_storage(
            storage.total_items,
            storage.total_size_bytes,
            storage.oldest_item_age,
            storage.dead_letter_items,
        );
        Ok(stats.snapshot())
    }

    pub async fn get_stats(&self) -> Result<ProcessingStats, QueueError> {
        self.refresh_stats().await
    }

    pub async fn get_health(&self) -> Result<QueueHealth, QueueError> {
        let stats = self.refresh_stats().await?;
        Ok(evaluate_health(&stats, &self.inner.config.health_thresholds()))
    }

    /// Periodic upkeep: storage maintenance, then a pass if conditions allow
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, QueueError> {
        let report = self.inner.storage.perform_maintenance().await?;
        let stats = self.refresh_stats().await?;

        if self.inner.config.performance_monitoring_enabled {
            log::debug!(
                "Queue stats: depth={} rate={:.1}/min avg={:.0}ms failed={}",
                stats.queue_depth,
                stats.processing_rate,
                stats.average_processing_time_ms,
                stats.total_failed
            );
        }

        let offline_hours = stats.oldest_item_age_secs.unwrap_or(0) as f64 / 3600.0;
        if stats.queue_depth > 0
            && !self.is_stopped()
            && self.inner.network.should_sync(stats.memory_usage_mb, offline_hours)
        {
            self.schedule_processing();
        }
        Ok(report)
    }

    /// Spawn the maintenance task and the reconnect trigger
    pub fn start(&self) {
        let interval = self.inner.config.maintenance_interval();
        let weak = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let manager = QueueManager { inner };
                if manager.is_stopped() {
                    continue;
                }
                if let Err(e) = manager.run_maintenance().await {
                    log::error!("Queue maintenance failed: {}", e);
                }
            }
        });

        if let Ok(mut task) = self.inner.maintenance_task.lock() {
            if let Some(previous) = task.replace(handle) {
                previous.abort();
            }
        }

        let listener = self.reconnect_listener();
        if let Ok(mut slot) = self.inner.network_listener.lock() {
            if let Some(previous) = slot.replace(listener) {
                previous.unsubscribe();
            }
        }

        log::info!("Queue manager started (maintenance every {:?})", interval);
    }

    fn reconnect_listener(&self) -> ListenerHandle {
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let runtime = tokio::runtime::Handle::current();
        let was_connected = AtomicBool::new(self.inner.network.get_current_state().is_connected);

        self.inner.network.add_listener(move |state| {
            let reconnected = state.is_connected && !was_connected.swap(state.is_connected, Ordering::AcqRel);
            if !state.is_connected {
                was_connected.store(false, Ordering::Release);
            }
            if !reconnected {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                log::info!("Network restored, draining queue");
                let manager = QueueManager { inner };
                runtime.spawn(async move {
                    if let Err(e) = manager.start_processing().await {
                        log::error!("Reconnect processing pass failed: {}", e);
                    }
                });
            }
        })
    }

    /// Stop the background task and the reconnect trigger
    pub fn shutdown(&self) {
        if let Ok(mut task) = self.inner.maintenance_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
        if let Ok(mut slot) = self.inner.network_listener.lock() {
            if let Some(listener) = slot.take() {
                listener.unsubscribe();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{CellularGeneration, ConnectivityReport};
    use crate::test_support::{memory_storage, sample_contact, sample_event};
    use std::sync::atomic::AtomicUsize;

    fn manager_with(config: QueueManagerConfig) -> QueueManager {
        let network = NetworkDetector::default();
        network.update(ConnectivityReport::wifi(Some(80)));
        QueueManager::new(memory_storage(), network, config)
    }

    fn manual_config() -> QueueManagerConfig {
        QueueManagerConfig {
            auto_process_on_enqueue: false,
            ..Default::default()
        }
    }

    fn succeed_all(manager: &QueueManager) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        for op in OperationType::ALL {
            let calls = calls.clone();
            manager.register_fn(op, move |_item| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ProcessingResult::success()
                }
            });
        }
        calls
    }

    #[tokio::test]
    async fn test_enqueue_persists_items() {
        let manager = manager_with(manual_config());

        let event_id = manager
            .enqueue_event(sample_event("user-1"), Priority::High)
            .await
            .unwrap();
        let contact_id = manager
            .enqueue_contact(sample_contact("user-1"), Priority::Normal)
            .await
            .unwrap();
        let ids = manager
            .enqueue_batch(vec![sample_event("user-1"), sample_event("user-2")], Priority::Low)
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let stored = manager.storage().retrieve(&event_id).await.unwrap().unwrap();
        assert_eq!(stored.priority, Priority::High);
        assert_eq!(stored.metadata.max_retries, 5);
        assert!(manager.storage().retrieve(&contact_id).await.unwrap().is_some());
        assert_eq!(manager.get_stats().await.unwrap().queue_depth, 4);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_owner_mismatch() {
        let manager = manager_with(manual_config());
        let result = manager
            .enqueue(
                "user-2",
                QueueOperation::CreateEvent(sample_event("user-1")),
                Priority::Normal,
            )
            .await;
        assert!(matches!(result, Err(QueueError::OwnerMismatch { .. })));
    }

    #[tokio::test]
    async fn test_processing_drains_queue() {
        let manager = manager_with(manual_config());
        let calls = succeed_all(&manager);

        for _ in 0..3 {
            manager.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();
        }
        manager.enqueue_contact(sample_contact("user-1"), Priority::Normal).await.unwrap();

        let result = manager.start_processing().await.unwrap();
        assert_eq!(result.total_items, 4);
        assert_eq!(result.successful, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let stats = manager.get_stats().await.unwrap();
        assert_eq!(stats.queue_depth, 0);
        assert_eq!(stats.total_processed, 4);
        assert_eq!(manager.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_callback_marks_failed() {
        let manager = manager_with(manual_config());
        let id = manager.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();

        let result = manager.start_processing().await.unwrap();
        assert_eq!(result.failed, 1);
        assert!(result.results[0].result.retry_recommended);

        let item = manager.storage().retrieve(&id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.metadata.retry_count, 1);
        assert!(item.metadata.next_retry_at.unwrap() > now_millis());
        assert!(item.metadata.last_error.unwrap().contains("create_event"));
    }

    #[tokio::test]
    async fn test_panicking_callback_is_contained() {
        let manager = manager_with(manual_config());
        manager.register_fn(OperationType::CreateEvent, |item: QueueItem| async move {
            assert!(item.id.is_empty(), "handler bug");
            ProcessingResult::success()
        });
        let id = manager.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();

        let result = manager.start_processing().await.unwrap();
        assert_eq!(result.failed, 1);
        assert_eq!(
            manager.storage().retrieve(&id).await.unwrap().unwrap().status,
            QueueStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_offline_pass_has_no_side_effects() {
        let manager = manager_with(manual_config());
        let calls = succeed_all(&manager);
        let id = manager.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();

        manager.network().update(ConnectivityReport::disconnected());
        let result = manager.start_processing().await.unwrap();
        assert_eq!(result, BatchProcessingResult::default());

        manager
            .network()
            .update(ConnectivityReport::cellular(Some(CellularGeneration::G4)));
        let result = manager.start_processing().await.unwrap();
        assert_eq!(result.total_items, 0);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let item = manager.storage().retrieve(&id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn test_concurrent_pass_returns_empty() {
        let manager = manager_with(manual_config());
        let (release_tx, release_rx) = watch::channel(false);
        manager.register_fn(OperationType::CreateEvent, move |_item| {
            let mut rx = release_rx.clone();
            async move {
                let _ = rx.wait_for(|go| *go).await;
                ProcessingResult::success()
            }
        });
        manager.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.start_processing().await.unwrap() }
        });

        while manager.in_flight_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(manager.is_processing());
        let second = manager.start_processing().await.unwrap();
        assert_eq!(second.total_items, 0);

        release_tx.send(true).unwrap();
        assert_eq!(first.await.unwrap().successful, 1);
        assert!(!manager.is_processing());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_dead_letters() {
        let manager = manager_with(manual_config());
        let id = manager.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();

        for attempt in 1..5 {
            let disposition = manager.mark_failed(&id, "timeout", true).await.unwrap();
            assert!(matches!(
                disposition,
                FailureDisposition::RetryScheduled { retry_count, .. } if retry_count == attempt
            ));
        }

        let item = manager.storage().retrieve(&id).await.unwrap().unwrap();
        assert_eq!(item.metadata.retry_count, 4);
        assert!(item.metadata.next_retry_at.unwrap() > now_millis());

        let disposition = manager.mark_failed(&id, "timeout", true).await.unwrap();
        assert_eq!(
            disposition,
            FailureDisposition::DeadLettered(DeadLetterReason::RetriesExhausted)
        );
        assert!(manager.storage().retrieve(&id).await.unwrap().is_none());

        let letters = manager.storage().dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].retry_count, 5);

        let health = manager.get_health().await.unwrap();
        assert_eq!(health.status, crate::queue::HealthStatus::Warning);
    }

    #[tokio::test]
    async fn test_non_retryable_and_conflict_outcomes() {
        let manager = manager_with(manual_config());
        let rejected = manager.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();
        let duplicate = manager.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();

        let disposition = manager.mark_failed(&rejected, "not found", false).await.unwrap();
        assert_eq!(disposition, FailureDisposition::DeadLettered(DeadLetterReason::NonRetryable));

        manager.mark_conflict(&duplicate, "duplicate key").await.unwrap();

        assert!(manager.storage().retrieve(&rejected).await.unwrap().is_none());
        assert!(manager.storage().retrieve(&duplicate).await.unwrap().is_none());
        assert_eq!(manager.storage().dead_letters(10).await.unwrap().len(), 1);

        let stats = manager.get_stats().await.unwrap();
        assert_eq!(stats.total_conflicts, 1);
        assert_eq!(stats.total_dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight() {
        let manager = manager_with(manual_config());
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (start_counter, counter) = (started.clone(), finished.clone());
        manager.register_fn(OperationType::CreateEvent, move |_item| {
            let (start_counter, counter) = (start_counter.clone(), counter.clone());
            async move {
                start_counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                ProcessingResult::success()
            }
        });
        manager.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();

        let pass = tokio::spawn({
            let manager = manager.clone();
            async move { manager.start_processing().await.unwrap() }
        });
        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        manager.stop_processing().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(manager.in_flight_count(), 0);
        pass.await.unwrap();

        manager.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();
        assert_eq!(manager.start_processing().await.unwrap().total_items, 0);

        manager.resume_processing();
        assert_eq!(manager.start_processing().await.unwrap().successful, 1);
    }

    #[tokio::test]
    async fn test_stop_waits_for_pending_claim() {
        let manager = manager_with(manual_config());
        let reservation = manager.reserve_claim();
        assert_eq!(manager.in_flight_count(), 1);

        let stop = tokio::spawn({
            let manager = manager.clone();
            async move { manager.stop_processing().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stop.is_finished());

        drop(reservation);
        tokio::time::timeout(Duration::from_secs(1), stop).await.unwrap().unwrap();
        assert_eq!(manager.in_flight_count(), 0);

        manager.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();
        assert!(manager.claim_batch(10).await.unwrap().is_empty());
        let pending = manager.storage().retrieve_many(QueueFilter::pending(), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_hands_back_undispatched_items() {
        let manager = manager_with(QueueManagerConfig {
            max_processing_concurrency: 1,
            ..manual_config()
        });
        let (release_tx, release_rx) = watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        manager.register_fn(OperationType::CreateEvent, move |_item| {
            let mut rx = release_rx.clone();
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = rx.wait_for(|go| *go).await;
                ProcessingResult::success()
            }
        });
        for _ in 0..3 {
            manager.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();
        }

        let pass = tokio::spawn({
            let manager = manager.clone();
            async move { manager.start_processing().await.unwrap() }
        });
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stop = tokio::spawn({
            let manager = manager.clone();
            async move { manager.stop_processing().await }
        });
        while !manager.is_stopped() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        release_tx.send(true).unwrap();

        let result = pass.await.unwrap();
        stop.await.unwrap();
        assert_eq!(result.total_items, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.in_flight_count(), 0);

        let pending = manager.storage().retrieve_many(QueueFilter::pending(), 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|item| item.metadata.retry_count == 0));
    }

    #[tokio::test]
    async fn test_reconnect_triggers_processing() {
        let manager = manager_with(manual_config());
        succeed_all(&manager);
        manager.network().update(ConnectivityReport::disconnected());
        manager.start();

        manager.enqueue_event(sample_event("user-1"), Priority::Normal).await.unwrap();
        manager.network().update(ConnectivityReport::wifi(Some(80)));

        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if manager.get_stats().await.unwrap().queue_depth == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(drained.is_ok());
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_health_defaults_to_healthy() {
        let manager = manager_with(manual_config());
        let health = manager.get_health().await.unwrap();
        assert_eq!(health.status, crate::queue::HealthStatus::Healthy);
        assert!(health.issues.is_empty());
    }
}
