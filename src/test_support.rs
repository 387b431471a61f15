//! Shared fixtures for unit and integration tests

use crate::crypto::{DeviceSecret, PayloadCodec};
use crate::db::Database;
use crate::models::{CommunicationEvent, Contact, DataSource, Direction, EventType, SyncHealthRecord};
use crate::queue::item::now_millis;
use crate::queue::storage::{OfflineStorage, StorageConfig};
use chrono::{DateTime, Utc};

/// Device event with a random counterparty, so samples never look like duplicates
pub fn sample_event(user_id: &str) -> CommunicationEvent {
    let mut event = event_at(user_id, DataSource::Device, now_millis());
    event.number = format!("+1555{:07}", uuid::Uuid::new_v4().as_u128() % 10_000_000);
    event
}

pub fn event_at(user_id: &str, source: DataSource, timestamp: DateTime<Utc>) -> CommunicationEvent {
    CommunicationEvent {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        line_id: "line-1".to_string(),
        timestamp,
        number: "+15550100".to_string(),
        direction: Direction::Inbound,
        event_type: EventType::Call,
        duration_secs: 30,
        source,
        contact_id: None,
        content: None,
    }
}

pub fn sample_contact(user_id: &str) -> Contact {
    Contact {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        phone_number: "+15550100".to_string(),
        name: "Test Contact".to_string(),
        company: None,
        notes: None,
        is_favorite: false,
        updated_at: now_millis(),
    }
}

pub fn sample_health(user_id: &str) -> SyncHealthRecord {
    SyncHealthRecord {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        device_id: "device-1".to_string(),
        status: "healthy".to_string(),
        pending_items: 0,
        failed_items: 0,
        last_sync_at: None,
        recorded_at: now_millis(),
    }
}

/// In-memory storage with encryption enabled and a small compression threshold
pub fn memory_storage() -> OfflineStorage {
    let db = Database::in_memory().expect("in-memory database");
    let codec = PayloadCodec::new(Some(DeviceSecret::from_bytes([3u8; 32])), 256);
    OfflineStorage::new(db, codec, StorageConfig::default())
}
