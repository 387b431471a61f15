//! Sync settings
//!
//! All component configs in one serializable aggregate, stored as JSON in
//! the settings table.

use crate::conflict::ConflictResolverConfig;
use crate::db::{Database, DbError};
use crate::network::NetworkConfig;
use crate::queue::{QueueManagerConfig, StorageConfig};
use crate::sync::SyncEngineConfig;
use serde::{Deserialize, Serialize};

/// Settings table key
pub const SETTINGS_KEY: &str = "sync_settings";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub queue: QueueManagerConfig,
    pub engine: SyncEngineConfig,
    pub conflict: ConflictResolverConfig,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl SyncSettings {
    /// Stored settings, or defaults when none were saved
    pub fn load(db: &Database) -> Result<Self, ConfigError> {
        let settings: SyncSettings = db.get_setting(SETTINGS_KEY)?.unwrap_or_default();
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, db: &Database) -> Result<(), ConfigError> {
        self.validate()?;
        db.set_setting(SETTINGS_KEY, self)?;
        log::info!("Sync settings saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.processing_batch_size == 0 {
            return Err(invalid("queue.processing_batch_size", "must be at least 1"));
        }
        if self.queue.max_processing_concurrency == 0 {
            return Err(invalid("queue.max_processing_concurrency", "must be at least 1"));
        }
        if self.queue.retry_base_delay_ms > self.queue.retry_max_delay_ms {
            return Err(invalid(
                "queue.retry_base_delay_ms",
                "must not exceed retry_max_delay_ms",
            ));
        }
        if self.engine.batch_size == 0 {
            return Err(invalid("engine.batch_size", "must be at least 1"));
        }
        if self.engine.max_concurrent_batches == 0 || self.engine.max_concurrent_items == 0 {
            return Err(invalid("engine.max_concurrent_batches", "concurrency must be at least 1"));
        }

        let unit = 0.0..=1.0;
        if !unit.contains(&self.engine.auto_resolve_threshold) {
            return Err(invalid("engine.auto_resolve_threshold", "must be within 0..=1"));
        }
        let weights = [
            self.conflict.carrier_weight,
            self.conflict.device_weight,
            self.conflict.manual_weight,
        ];
        if weights.iter().any(|w| !unit.contains(w)) {
            return Err(invalid("conflict weights", "must be within 0..=1"));
        }
        Ok(())
    }

    /// Resolver config with the engine's auto-resolve threshold applied
    pub fn resolver_config(&self) -> ConflictResolverConfig {
        ConflictResolverConfig {
            auto_resolve_threshold: self.engine.auto_resolve_threshold,
            ..self.conflict.clone()
        }
    }
}
