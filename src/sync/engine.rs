//! Sync Engine - orchestrates end-to-end sync runs
//!
//! A run drains ready queue items to the remote store in concurrent batches,
//! resolves duplicate events for the users it touched, and reports progress.
//! Runs can be paused, resumed and stopped; a degraded network pauses the
//! run automatically and a restored one resumes it.

use super::dispatch::{classify, ErrorClass, RemoteDispatcher};
use super::progress::{ProgressTracker, SyncProgress};
use crate::conflict::{ConflictResolver, ConflictSummary, DetectOptions, TimeWindow};
use crate::network::{ConnectionQuality, NetworkDetector};
use crate::queue::{QueueError, QueueItem, QueueManager, QueueOperation, StorageStats};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncEngineConfig {
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    /// Items in flight within one batch
    pub max_concurrent_items: usize,
    pub conflict_resolution_enabled: bool,
    pub auto_resolve_threshold: f64,
    pub progress_callback_interval_ms: u64,
    /// Runs pause while link quality is below this
    pub network_quality_threshold: ConnectionQuality,
    pub retry_on_network_error: bool,
    pub max_network_retries: u32,
    pub network_retry_delay_ms: u64,
    pub inter_batch_delay_ms: u64,
    /// How long a pause waits for the in-flight batch
    pub pause_grace_ms: u64,
    pub conflict_timestamp_tolerance_ms: u64,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrent_batches: 3,
            max_concurrent_items: 5,
            conflict_resolution_enabled: true,
            auto_resolve_threshold: 0.85,
            progress_callback_interval_ms: 1000,
            network_quality_threshold: ConnectionQuality::Fair,
            retry_on_network_error: true,
            max_network_retries: 3,
            network_retry_delay_ms: 500,
            inter_batch_delay_ms: 100,
            pause_grace_ms: 2000,
            conflict_timestamp_tolerance_ms: 1000,
        }
    }
}

impl SyncEngineConfig {
    pub fn progress_callback_interval(&self) -> Duration {
        Duration::from_millis(self.progress_callback_interval_ms)
    }

    pub fn network_retry_delay(&self) -> Duration {
        Duration::from_millis(self.network_retry_delay_ms)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn pause_grace(&self) -> Duration {
        Duration::from_millis(self.pause_grace_ms)
    }

    pub fn conflict_timestamp_tolerance(&self) -> Duration {
        Duration::from_millis(self.conflict_timestamp_tolerance_ms)
    }
}

// ============================================================================
// Data Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Drained without interruption and without failures
    pub success: bool,
    pub total_processed: u64,
    pub total_failed: u64,
    /// Items the remote already held
    pub duplicates_skipped: u64,
    pub conflicts: u64,
    pub auto_resolved: u64,
    pub manual_review_required: u64,
    pub duration_ms: u64,
    pub bytes_transferred: u64,
    /// Ended by stop or by sync conditions before the queue was drained
    pub interrupted: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Started,
    Progress(SyncProgress),
    Paused { auto: bool },
    Resumed { auto: bool },
    Completed(SyncResult),
    Failed { error: String },
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("A sync run is already in progress")]
    AlreadySyncing,

    #[error("No sync run in progress")]
    NotSyncing,

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause { auto: bool },
    Stop,
}

/// User and event time an event write may have duplicated
type Touched = Option<(String, chrono::DateTime<chrono::Utc>)>;

/// Outcome of one item
enum ItemOutcome {
    Processed { bytes: usize, touched: Touched },
    Duplicate { touched: Touched },
    Failed,
    /// Handed back to the queue undispatched
    Deferred,
}

/// Event times written per user, merged across batches
#[derive(Default)]
struct TouchedWindows(BTreeMap<String, TimeWindow>);

impl TouchedWindows {
    fn record(&mut self, user_id: String, timestamp: chrono::DateTime<chrono::Utc>) {
        self.0
            .entry(user_id)
            .and_modify(|window| window.include(timestamp))
            .or_insert_with(|| TimeWindow::at(timestamp));
    }

    fn extend(&mut self, other: &TouchedWindows) {
        for (user_id, window) in &other.0 {
            self.0
                .entry(user_id.clone())
                .and_modify(|existing| existing.merge(*window))
                .or_insert(*window);
        }
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Default)]
struct BatchTotals {
    processed: u64,
    failed: u64,
    duplicates: u64,
    deferred: u64,
    bytes: u64,
    /// Users whose remote event set changed, with the times written
    touched: TouchedWindows,
}

impl BatchTotals {
    fn add(&mut self, outcome: ItemOutcome) {
        let touched = match outcome {
            ItemOutcome::Processed { bytes, touched } => {
                self.processed += 1;
                self.bytes += bytes as u64;
                touched
            }
            ItemOutcome::Duplicate { touched } => {
                self.duplicates += 1;
                touched
            }
            ItemOutcome::Failed => {
                self.failed += 1;
                None
            }
            ItemOutcome::Deferred => {
                self.deferred += 1;
                None
            }
        };
        if let Some((user_id, timestamp)) = touched {
            self.touched.record(user_id, timestamp);
        }
    }

    fn merge(&mut self, other: BatchTotals) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.duplicates += other.duplicates;
        self.deferred += other.deferred;
        self.bytes += other.bytes;
        self.touched.extend(&other.touched);
    }
}

#[derive(Default)]
struct RunTotals {
    items: BatchTotals,
    conflicts: ConflictSummary,
    /// Users whose conflict check is still due
    unresolved: TouchedWindows,
    interrupted: bool,
}

// ============================================================================
// Sync Engine
// ============================================================================

struct EngineInner {
    queue: QueueManager,
    resolver: Arc<ConflictResolver>,
    dispatcher: RemoteDispatcher,
    config: SyncEngineConfig,
    running: AtomicBool,
    state_tx: watch::Sender<SyncState>,
    control_tx: watch::Sender<Control>,
    events_tx: broadcast::Sender<SyncEvent>,
    progress: StdMutex<ProgressTracker>,
    last_result: StdMutex<Option<SyncResult>>,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

/// Clears the run flag when a run ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncEngine {
    pub fn new(
        queue: QueueManager,
        resolver: Arc<ConflictResolver>,
        dispatcher: RemoteDispatcher,
        config: SyncEngineConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SyncState::Idle);
        let (control_tx, _) = watch::channel(Control::Run);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let tracker = ProgressTracker::new(config.progress_callback_interval());

        Self {
            inner: Arc::new(EngineInner {
                queue,
                resolver,
                dispatcher,
                config,
                running: AtomicBool::new(false),
                state_tx,
                control_tx,
                events_tx,
                progress: StdMutex::new(tracker),
                last_result: StdMutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.inner.config
    }

    fn network(&self) -> &NetworkDetector {
        self.inner.queue.network()
    }

    pub fn state(&self) -> SyncState {
        *self.inner.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<SyncState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn get_progress(&self) -> SyncProgress {
        self.inner
            .progress
            .lock()
            .map(|tracker| tracker.progress().clone())
            .unwrap_or_default()
    }

    pub fn last_result(&self) -> Option<SyncResult> {
        self.inner.last_result.lock().ok().and_then(|result| result.clone())
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.inner.events_tx.send(event);
    }

    fn set_state(&self, state: SyncState) {
        self.inner.state_tx.send_replace(state);
    }

    fn control(&self) -> Control {
        *self.inner.control_tx.borrow()
    }

    // ------------------------------------------------------------------------
    // Run
    // ------------------------------------------------------------------------

    /// Run until the queue is drained, conditions stop the run, or it is stopped
    ///
    /// Fails with `AlreadySyncing` if a run is active; the active run is not
    /// touched. Orchestration failures end the run with `success: false` and
    /// the error in the result.
    pub async fn start_sync(&self) -> Result<SyncResult, SyncError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(SyncError::AlreadySyncing);
        }
        let _guard = RunGuard(&self.inner.running);
        let started = Instant::now();

        self.inner.control_tx.send_replace(Control::Run);
        // A previous stop leaves the queue closed
        self.inner.queue.resume_processing();

        let depth = match self.inner.queue.storage().get_stats().await {
            Ok(stats) => stats.total_items,
            Err(e) => {
                log::warn!("Could not read queue depth: {}", e);
                0
            }
        };
        if let Ok(mut tracker) = self.inner.progress.lock() {
            tracker.reset(depth, self.inner.config.batch_size);
        }

        self.set_state(SyncState::Syncing);
        self.emit(SyncEvent::Started);
        log::info!("Sync started ({} items queued)", depth);

        let watcher = self.spawn_network_watcher();
        let mut totals = RunTotals::default();
        let outcome = self.run_loop(&mut totals).await;
        watcher.abort();
        if !totals.unresolved.is_empty() {
            log::info!(
                "Conflict check skipped for {} users, next run covers them",
                totals.unresolved.len()
            );
        }
        if totals.items.deferred > 0 {
            log::info!("{} claimed items handed back undispatched", totals.items.deferred);
        }

        let stopped = self.control() == Control::Stop;
        let result = SyncResult {
            success: outcome.is_ok() && !totals.interrupted && !stopped && totals.items.failed == 0,
            total_processed: totals.items.processed,
            total_failed: totals.items.failed,
            duplicates_skipped: totals.items.duplicates,
            conflicts: totals.conflicts.total as u64,
            auto_resolved: totals.conflicts.auto_resolved as u64,
            manual_review_required: totals.conflicts.manual_review as u64,
            duration_ms: started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
            bytes_transferred: totals.items.bytes,
            interrupted: totals.interrupted || stopped,
            error: outcome.as_ref().err().map(|e| e.to_string()),
        };

        match &outcome {
            Ok(()) => {
                log::info!(
                    "Sync finished: {} processed, {} failed, {} duplicates, {} conflicts ({} auto-resolved) in {}ms",
                    result.total_processed,
                    result.total_failed,
                    result.duplicates_skipped,
                    result.conflicts,
                    result.auto_resolved,
                    result.duration_ms
                );
                self.set_state(SyncState::Completed);
                if stopped {
                    self.emit(SyncEvent::Stopped);
                }
                self.emit(SyncEvent::Completed(result.clone()));
            }
            Err(e) => {
                log::error!("Sync failed: {}", e);
                self.set_state(SyncState::Failed);
                self.emit(SyncEvent::Failed { error: e.to_string() });
            }
        }

        if let Ok(mut last) = self.inner.last_result.lock() {
            *last = Some(result.clone());
        }
        self.set_state(SyncState::Idle);
        Ok(result)
    }

    async fn run_loop(&self, totals: &mut RunTotals) -> Result<(), SyncError> {
        let config = &self.inner.config;
        let queue = &self.inner.queue;

        let mut rounds: u64 = 0;

        loop {
            // Before the first round a bad link ends the run below instead
            if rounds > 0 && self.network_degraded() && self.control() == Control::Run {
                self.auto_pause();
                // The link may have come back before the pause landed
                if !self.network_degraded() {
                    self.auto_resume().await;
                }
            }
            if self.wait_until_runnable().await == Control::Stop {
                log::info!("Sync stopped");
                return Ok(());
            }

            let stats = queue.storage().get_stats().await.map_err(QueueError::from)?;
            if !self.conditions_allow(&stats) {
                log::info!("Sync conditions no longer met, ending run early");
                totals.interrupted = stats.total_items > 0;
                return Ok(());
            }

            let batch_size = config
                .batch_size
                .min(self.network().get_recommended_batch_size())
                .max(1);
            let concurrent_batches = config.max_concurrent_batches.max(1);
            let items = queue.claim_batch(batch_size * concurrent_batches).await?;
            if items.is_empty() {
                log::debug!("Queue drained");
                return Ok(());
            }

            let batches: Vec<Vec<QueueItem>> = items
                .chunks(batch_size)
                .map(|chunk| chunk.to_vec())
                .collect();
            let results: Vec<BatchTotals> = futures::stream::iter(batches)
                .map(|batch| self.process_batch(batch))
                .buffer_unordered(concurrent_batches)
                .collect()
                .await;

            let remaining = match queue.storage().get_stats().await {
                Ok(stats) => stats.total_items,
                Err(_) => 0,
            };
            let mut round = BatchTotals::default();
            for batch in results {
                if let Ok(mut tracker) = self.inner.progress.lock() {
                    // Duplicates count as done
                    tracker.record_batch(batch.processed + batch.duplicates, batch.failed, batch.bytes, remaining);
                }
                round.merge(batch);
            }
            self.emit_progress();

            if config.conflict_resolution_enabled {
                totals.unresolved.extend(&round.touched);
                // Detection reads the remote store; wait for a usable link
                if !self.network_degraded() {
                    let windows = std::mem::take(&mut totals.unresolved);
                    totals.conflicts += self.resolve_conflicts(&windows).await;
                }
            }
            totals.items.merge(round);
            rounds += 1;

            if !config.inter_batch_delay().is_zero() {
                tokio::time::sleep(config.inter_batch_delay()).await;
            }
        }
    }

    fn emit_progress(&self) {
        let snapshot = self
            .inner
            .progress
            .lock()
            .ok()
            .and_then(|mut tracker| tracker.should_emit().then(|| tracker.progress().clone()));
        if let Some(progress) = snapshot {
            self.emit(SyncEvent::Progress(progress));
        }
    }

    async fn process_batch(&self, batch: Vec<QueueItem>) -> BatchTotals {
        let concurrency = self.inner.config.max_concurrent_items.max(1);
        let outcomes: Vec<ItemOutcome> = futures::stream::iter(batch)
            .map(|item| self.process_item(item))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut totals = BatchTotals::default();
        for outcome in outcomes {
            totals.add(outcome);
        }
        totals
    }

    async fn process_item(&self, item: QueueItem) -> ItemOutcome {
        let config = &self.inner.config;
        let queue = &self.inner.queue;
        // Only event writes can create duplicates
        let touched = match &item.operation {
            QueueOperation::CreateEvent(event) | QueueOperation::UpdateEvent { event, .. } => {
                Some((item.user_id.clone(), event.timestamp))
            }
            _ => None,
        };
        let mut attempt: u32 = 0;

        loop {
            if !self.may_dispatch() {
                return self.defer(&item).await;
            }
            let error = match self.inner.dispatcher.dispatch(&item.operation).await {
                Ok(bytes) => {
                    if let Err(e) = queue.mark_processed(&item.id).await {
                        log::error!("Failed to remove synced item {}: {}", item.id, e);
                    }
                    return ItemOutcome::Processed { bytes, touched };
                }
                Err(e) => e,
            };

            match classify(&error) {
                ErrorClass::Conflict => {
                    if let Err(e) = queue.mark_conflict(&item.id, &error.to_string()).await {
                        log::error!("Failed to settle duplicate item {}: {}", item.id, e);
                    }
                    return ItemOutcome::Duplicate { touched };
                }
                // Run halted while the request was out
                ErrorClass::Transient if !self.may_dispatch() => {
                    return self.defer(&item).await;
                }
                ErrorClass::Transient if config.retry_on_network_error && attempt < config.max_network_retries => {
                    attempt += 1;
                    let delay = config
                        .network_retry_delay()
                        .saturating_mul(2u32.saturating_pow(attempt - 1));
                    log::debug!(
                        "Retrying item {} in {:?} (attempt {}): {}",
                        item.id,
                        delay,
                        attempt,
                        error
                    );
                    tokio::time::sleep(delay).await;
                }
                class => {
                    let retry = class == ErrorClass::Transient;
                    if let Err(e) = queue.mark_failed(&item.id, &error.to_string(), retry).await {
                        log::error!("Failed to settle failed item {}: {}", item.id, e);
                    }
                    return ItemOutcome::Failed;
                }
            }
        }
    }

    /// Put an undispatched item back without spending a retry
    async fn defer(&self, item: &QueueItem) -> ItemOutcome {
        if let Err(e) = self.inner.queue.release_claims(std::slice::from_ref(&item.id)).await {
            log::error!("Failed to hand back item {}: {}", item.id, e);
        }
        ItemOutcome::Deferred
    }

    async fn resolve_conflicts(&self, windows: &TouchedWindows) -> ConflictSummary {
        let mut summary = ConflictSummary::default();
        for (user_id, window) in &windows.0 {
            let options = DetectOptions {
                batch_size: self.inner.config.batch_size,
                timestamp_tolerance: self.inner.config.conflict_timestamp_tolerance(),
                auto_resolve: true,
                window: Some(*window),
            };
            match self.inner.resolver.resolve_for_user(user_id, &options).await {
                Ok(user_summary) => summary += user_summary,
                // Detection runs again after the next batch for this user
                Err(e) => log::warn!("Conflict resolution failed for user {}: {}", user_id, e),
            }
        }
        summary
    }

    // ------------------------------------------------------------------------
    // Conditions
    // ------------------------------------------------------------------------

    fn network_degraded(&self) -> bool {
        self.network().get_current_state().connection_quality < self.inner.config.network_quality_threshold
    }

    /// Whether a claimed item may go out now
    fn may_dispatch(&self) -> bool {
        self.control() == Control::Run && !self.network_degraded()
    }

    fn conditions_allow(&self, stats: &StorageStats) -> bool {
        let queue_mb = stats.total_size_bytes as f64 / (1024.0 * 1024.0);
        let offline_hours = stats
            .oldest_item_age
            .map(|age| age.as_secs_f64() / 3600.0)
            .unwrap_or(0.0);
        !self.network_degraded() && self.network().should_sync(queue_mb, offline_hours)
    }

    /// Current sync conditions, as used between batches
    pub async fn should_sync(&self) -> bool {
        match self.inner.queue.storage().get_stats().await {
            Ok(stats) => self.conditions_allow(&stats),
            Err(e) => {
                log::warn!("Could not read queue stats: {}", e);
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Pause / resume / stop
    // ------------------------------------------------------------------------

    async fn wait_until_runnable(&self) -> Control {
        let mut control = self.inner.control_tx.subscribe();
        let current = match control.wait_for(|c| !matches!(c, Control::Pause { .. })).await {
            Ok(current) => *current,
            Err(_) => Control::Stop,
        };
        current
    }

    fn auto_pause(&self) {
        let paused = self.inner.control_tx.send_if_modified(|control| {
            if *control == Control::Run {
                *control = Control::Pause { auto: true };
                true
            } else {
                false
            }
        });
        if paused {
            log::info!("Network degraded, sync paused");
            self.set_state(SyncState::Paused);
            self.emit(SyncEvent::Paused { auto: true });
        }
    }

    async fn auto_resume(&self) {
        if self.control() != (Control::Pause { auto: true }) || !self.should_sync().await {
            return;
        }
        let resumed = self.inner.control_tx.send_if_modified(|control| {
            if *control == (Control::Pause { auto: true }) {
                *control = Control::Run;
                true
            } else {
                false
            }
        });
        if resumed {
            log::info!("Network restored, sync resumed");
            self.set_state(SyncState::Syncing);
            self.emit(SyncEvent::Resumed { auto: true });
        }
    }

    /// Follows network transitions for the duration of one run
    fn spawn_network_watcher(&self) -> JoinHandle<()> {
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let mut states = self.network().subscribe();

        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let Some(inner) = weak.upgrade() else { break };
                let engine = SyncEngine { inner };
                if engine.network_degraded() {
                    engine.auto_pause();
                } else {
                    engine.auto_resume().await;
                }
            }
        })
    }

    /// Pause after the in-flight batch; waits up to the grace period for it
    pub async fn pause_sync(&self) -> Result<(), SyncError> {
        if !self.is_syncing() {
            return Err(SyncError::NotSyncing);
        }
        let paused = self.inner.control_tx.send_if_modified(|control| match control {
            Control::Run => {
                *control = Control::Pause { auto: false };
                true
            }
            // A manual pause takes over an automatic one
            Control::Pause { auto: true } => {
                *control = Control::Pause { auto: false };
                false
            }
            _ => false,
        });
        if paused {
            log::info!("Sync paused");
            self.set_state(SyncState::Paused);
            self.emit(SyncEvent::Paused { auto: false });
        }

        if tokio::time::timeout(self.inner.config.pause_grace(), self.inner.queue.wait_for_idle())
            .await
            .is_err()
        {
            log::warn!("In-flight batch still running after pause grace period");
        }
        Ok(())
    }

    pub fn resume_sync(&self) -> Result<(), SyncError> {
        if !self.is_syncing() {
            return Err(SyncError::NotSyncing);
        }
        let resumed = self.inner.control_tx.send_if_modified(|control| {
            if matches!(control, Control::Pause { .. }) {
                *control = Control::Run;
                true
            } else {
                false
            }
        });
        if resumed {
            log::info!("Sync resumed");
            self.set_state(SyncState::Syncing);
            self.emit(SyncEvent::Resumed { auto: false });
        }
        Ok(())
    }

    /// Halt the run and wait for in-flight items to settle
    pub async fn stop_sync(&self) {
        self.inner.control_tx.send_replace(Control::Stop);
        self.inner.queue.stop_processing().await;
    }
}
