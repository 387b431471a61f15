//! Communication log data models
//!
//! Records that producers enqueue and that the remote store holds:
//! - CommunicationEvent: one call or SMS on a line
//! - Contact: address book entry keyed by phone number
//! - SyncHealthRecord: per-device sync diagnostics pushed to the server

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remote table names
pub const EVENTS_TABLE: &str = "events";
pub const CONTACTS_TABLE: &str = "contacts";
pub const SYNC_HEALTH_TABLE: &str = "sync_health";

/// Call/SMS direction relative to the line owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Call,
    Sms,
}

/// Where an event record came from
///
/// Carrier imports are authoritative, on-device collection is usually right
/// about timing but can miss calls, manual entries are least reliable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Carrier,
    Device,
    Manual,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Carrier => "carrier",
            DataSource::Device => "device",
            DataSource::Manual => "manual",
        }
    }
}

/// A single call or SMS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationEvent {
    pub id: String,
    pub user_id: String,
    /// Line (phone number / SIM) the event was recorded on
    pub line_id: String,
    pub timestamp: DateTime<Utc>,
    /// Counterparty number
    pub number: String,
    pub direction: Direction,
    pub event_type: EventType,
    /// Call length in seconds; 0 for SMS
    #[serde(default)]
    pub duration_secs: u32,
    pub source: DataSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl CommunicationEvent {
    /// Counterparty number with formatting stripped, used for duplicate matching
    pub fn normalized_number(&self) -> String {
        normalize_number(&self.number)
    }

    /// Number of optional fields populated, used to break quality ties
    pub fn completeness(&self) -> u8 {
        u8::from(self.contact_id.is_some()) + u8::from(self.content.is_some())
    }
}

/// Keep digits and a leading '+'
pub fn normalize_number(number: &str) -> String {
    let trimmed = number.trim();
    let mut out = String::with_capacity(trimmed.len());
    for (i, ch) in trimmed.chars().enumerate() {
        if ch.is_ascii_digit() || (i == 0 && ch == '+') {
            out.push(ch);
        }
    }
    out
}

/// Address book entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub user_id: String,
    pub phone_number: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub is_favorite: bool,
    pub updated_at: DateTime<Utc>,
}

/// Device sync diagnostics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHealthRecord {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub status: String,
    pub pending_items: u64,
    pub failed_items: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}
