//! Network condition detector
//!
//! Single writer of `NetworkState`. The host pushes platform connectivity
//! callbacks in either through a `ConnectivityProvider` passed to
//! `initialize()` or by calling `update()` directly. Readers get snapshots,
//! registered listeners, or a `watch` receiver.
//!
//! Decisions derived from the state:
//! - quality classification (none < poor < fair < good < excellent)
//! - sync strategy (offline / wifi-preferred / cellular-allowed)
//! - recommended batch size, a step function of quality

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ============================================================================
// Data Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    None,
    Unknown,
}

/// Ordered link quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    None,
    Poor,
    Fair,
    Good,
    Excellent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellularGeneration {
    #[serde(rename = "2g")]
    G2,
    #[serde(rename = "3g")]
    G3,
    #[serde(rename = "4g")]
    G4,
    #[serde(rename = "5g")]
    G5,
}

/// Raw platform connectivity callback payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub is_connected: bool,
    /// `None` when the platform has not probed reachability yet
    pub is_internet_reachable: Option<bool>,
    pub connection_type: ConnectionType,
    /// Wi-Fi signal strength, 0-100
    pub wifi_strength: Option<u8>,
    pub cellular_generation: Option<CellularGeneration>,
}

impl ConnectivityReport {
    pub fn disconnected() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: Some(false),
            connection_type: ConnectionType::None,
            wifi_strength: None,
            cellular_generation: None,
        }
    }

    pub fn wifi(strength: Option<u8>) -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: Some(true),
            connection_type: ConnectionType::Wifi,
            wifi_strength: strength,
            cellular_generation: None,
        }
    }

    pub fn cellular(generation: Option<CellularGeneration>) -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: Some(true),
            connection_type: ConnectionType::Cellular,
            wifi_strength: None,
            cellular_generation: generation,
        }
    }

    /// Classify link quality
    pub fn quality(&self) -> ConnectionQuality {
        if !self.is_connected || self.is_internet_reachable == Some(false) {
            return ConnectionQuality::None;
        }

        match self.connection_type {
            ConnectionType::None => ConnectionQuality::None,
            ConnectionType::Wifi => match self.wifi_strength {
                Some(s) if s >= 75 => ConnectionQuality::Excellent,
                Some(s) if s >= 50 => ConnectionQuality::Good,
                Some(s) if s >= 25 => ConnectionQuality::Fair,
                Some(_) => ConnectionQuality::Poor,
                None => ConnectionQuality::Good,
            },
            ConnectionType::Cellular => match self.cellular_generation {
                Some(CellularGeneration::G5) => ConnectionQuality::Excellent,
                Some(CellularGeneration::G4) => ConnectionQuality::Good,
                Some(CellularGeneration::G3) | None => ConnectionQuality::Fair,
                Some(CellularGeneration::G2) => ConnectionQuality::Poor,
            },
            ConnectionType::Unknown => ConnectionQuality::Fair,
        }
    }
}

/// Current connectivity as seen by the rest of the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    pub is_connected: bool,
    pub is_internet_reachable: bool,
    pub connection_type: ConnectionType,
    pub connection_quality: ConnectionQuality,
    pub is_wifi: bool,
    /// Time since the last observed disconnect; zero while connected
    pub disconnected_duration_ms: u64,
}

impl NetworkState {
    fn unknown() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: false,
            connection_type: ConnectionType::Unknown,
            connection_quality: ConnectionQuality::None,
            is_wifi: false,
            disconnected_duration_ms: 0,
        }
    }

    fn from_report(report: &ConnectivityReport) -> Self {
        let quality = report.quality();
        let is_connected = report.is_connected && quality > ConnectionQuality::None;
        Self {
            is_connected,
            is_internet_reachable: is_connected && report.is_internet_reachable.unwrap_or(true),
            connection_type: report.connection_type,
            connection_quality: quality,
            is_wifi: is_connected && report.connection_type == ConnectionType::Wifi,
            disconnected_duration_ms: 0,
        }
    }

    /// Same connectivity, ignoring the elapsed-time field
    fn same_connectivity(&self, other: &NetworkState) -> bool {
        self.is_connected == other.is_connected
            && self.is_internet_reachable == other.is_internet_reachable
            && self.connection_type == other.connection_type
            && self.connection_quality == other.connection_quality
    }

    pub fn disconnected_duration(&self) -> Duration {
        Duration::from_millis(self.disconnected_duration_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    Offline,
    WifiPreferred,
    CellularAllowed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Queue size above which cellular data may be used
    pub cellular_queue_threshold_mb: f64,
    /// Offline period above which cellular data may be used
    pub cellular_offline_hours_threshold: f64,
    pub batch_size_poor: usize,
    pub batch_size_fair: usize,
    pub batch_size_good: usize,
    pub batch_size_excellent: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cellular_queue_threshold_mb: 50.0,
            cellular_offline_hours_threshold: 24.0,
            batch_size_poor: 5,
            batch_size_fair: 15,
            batch_size_good: 30,
            batch_size_excellent: 50,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Connectivity provider error: {0}")]
    Provider(String),

    #[error("Connectivity provider closed")]
    Closed,
}

/// Platform connectivity notifier
#[async_trait]
pub trait ConnectivityProvider: Send + Sync {
    /// Current connectivity
    async fn current(&self) -> Result<ConnectivityReport, NetworkError>;

    /// Stream of subsequent connectivity callbacks
    async fn changes(&self) -> Result<mpsc::Receiver<ConnectivityReport>, NetworkError>;
}

type Listener = Arc<dyn Fn(&NetworkState) + Send + Sync>;

/// Registration returned by `add_listener`; dropping it keeps the listener
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct ListenerHandle {
    id: u64,
    detector: Weak<DetectorInner>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.detector.upgrade() {
            if let Ok(mut listeners) = inner.listeners.lock() {
                listeners.remove(&self.id);
            }
        }
    }
}

// ============================================================================
// Network Detector
// ============================================================================

struct DetectorInner {
    config: NetworkConfig,
    state_tx: watch::Sender<NetworkState>,
    disconnected_since: StdMutex<Option<Instant>>,
    listeners: StdMutex<HashMap<u64, Listener>>,
    next_listener_id: AtomicU64,
    provider_task: StdMutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct NetworkDetector {
    inner: Arc<DetectorInner>,
}

impl NetworkDetector {
    /// Detector in the unknown/disconnected state until the first report
    pub fn new(config: NetworkConfig) -> Self {
        let (state_tx, _) = watch::channel(NetworkState::unknown());
        Self {
            inner: Arc::new(DetectorInner {
                config,
                state_tx,
                disconnected_since: StdMutex::new(None),
                listeners: StdMutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                provider_task: StdMutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    /// Establish the current state and follow provider callbacks
    ///
    /// Provider failures are logged and leave the detector in the
    /// unknown/disconnected state; it keeps accepting listeners and updates.
    pub async fn initialize(&self, provider: Arc<dyn ConnectivityProvider>) {
        match provider.current().await {
            Ok(report) => {
                self.update(report);
            }
            Err(e) => {
                log::warn!("Connectivity query failed, assuming offline: {}", e);
                self.update(ConnectivityReport {
                    connection_type: ConnectionType::Unknown,
                    ..ConnectivityReport::disconnected()
                });
            }
        }

        let mut changes = match provider.changes().await {
            Ok(rx) => rx,
            Err(e) => {
                log::warn!("Connectivity notifications unavailable: {}", e);
                return;
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(report) = changes.recv().await {
                match weak.upgrade() {
                    Some(inner) => {
                        NetworkDetector { inner }.update(report);
                    }
                    None => break,
                }
            }
            log::debug!("Connectivity notification stream ended");
        });

        if let Ok(mut task) = self.inner.provider_task.lock() {
            if let Some(previous) = task.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Stop following provider callbacks
    pub fn shutdown(&self) {
        if let Ok(mut task) = self.inner.provider_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }

    /// Apply a connectivity callback; returns true on a state transition
    pub fn update(&self, report: ConnectivityReport) -> bool {
        let next = NetworkState::from_report(&report);
        let previous = self.inner.state_tx.borrow().clone();

        if previous.same_connectivity(&next) {
            return false;
        }

        if let Ok(mut since) = self.inner.disconnected_since.lock() {
            if next.is_connected {
                *since = None;
            } else if since.is_none() {
                *since = Some(Instant::now());
            }
        }

        log::info!(
            "Network changed: {:?}/{:?} -> {:?}/{:?}",
            previous.connection_type,
            previous.connection_quality,
            next.connection_type,
            next.connection_quality
        );

        self.inner.state_tx.send_replace(next);
        self.notify_listeners();
        true
    }

    fn notify_listeners(&self) {
        let state = self.get_current_state();
        let listeners: Vec<Listener> = match self.inner.listeners.lock() {
            Ok(listeners) => listeners.values().cloned().collect(),
            Err(_) => return,
        };

        for listener in listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(&state)));
            if result.is_err() {
                log::error!("Network listener panicked");
            }
        }
    }

    pub fn get_current_state(&self) -> NetworkState {
        let mut state = self.inner.state_tx.borrow().clone();
        if let Ok(since) = self.inner.disconnected_since.lock() {
            state.disconnected_duration_ms = since
                .map(|at| at.elapsed().as_millis().min(u128::from(u64::MAX)) as u64)
                .unwrap_or(0);
        }
        state
    }

    /// Called on every state transition, never on a repeated report
    pub fn add_listener<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&NetworkState) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.insert(id, Arc::new(callback));
        }
        ListenerHandle {
            id,
            detector: Arc::downgrade(&self.inner),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Receiver for async consumers; wakes on every transition
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.inner.state_tx.subscribe()
    }

    pub fn determine_sync_strategy(&self, queue_size_mb: f64, offline_hours: f64) -> SyncStrategy {
        let state = self.get_current_state();
        if !state.is_connected {
            return SyncStrategy::Offline;
        }
        if state.is_wifi {
            return SyncStrategy::WifiPreferred;
        }

        // Cellular or an unknown, possibly metered, link
        let config = &self.inner.config;
        if queue_size_mb > config.cellular_queue_threshold_mb
            || offline_hours > config.cellular_offline_hours_threshold
        {
            SyncStrategy::CellularAllowed
        } else {
            SyncStrategy::WifiPreferred
        }
    }

    pub fn get_recommended_batch_size(&self) -> usize {
        let config = &self.inner.config;
        match self.get_current_state().connection_quality {
            ConnectionQuality::None => 0,
            ConnectionQuality::Poor => config.batch_size_poor,
            ConnectionQuality::Fair => config.batch_size_fair,
            ConnectionQuality::Good => config.batch_size_good,
            ConnectionQuality::Excellent => config.batch_size_excellent,
        }
    }

    pub fn should_sync(&self, queue_size_mb: f64, offline_hours: f64) -> bool {
        match self.determine_sync_strategy(queue_size_mb, offline_hours) {
            SyncStrategy::Offline => false,
            SyncStrategy::WifiPreferred => self.get_current_state().is_wifi,
            SyncStrategy::CellularAllowed => true,
        }
    }
}

impl Default for NetworkDetector {
    fn default() -> Self {
        Self::new(NetworkConfig::default())
    }
}
