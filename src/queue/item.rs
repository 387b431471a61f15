//! Queue item model - the durable unit of work
//!
//! An item wraps one pending mutation against the remote store together with
//! its priority, owner and retry bookkeeping. Successful items are deleted
//! rather than marked, so the status only ever moves between
//! pending, processing and failed.

use crate::models::{CommunicationEvent, Contact, SyncHealthRecord};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Current time truncated to what the queue table stores
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

// ============================================================================
// Priority / Status
// ============================================================================

/// Retrieval priority, higher drains first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            i64::MIN..=0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::Critical,
        }
    }
}

/// Queue item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Operation kind without payload, used to route items to handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    CreateEvent,
    UpdateEvent,
    DeleteEvent,
    CreateContact,
    UpdateContact,
    UpdateSyncHealth,
}

impl OperationType {
    pub const ALL: [OperationType; 6] = [
        OperationType::CreateEvent,
        OperationType::UpdateEvent,
        OperationType::DeleteEvent,
        OperationType::CreateContact,
        OperationType::UpdateContact,
        OperationType::UpdateSyncHealth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateEvent => "create_event",
            Self::UpdateEvent => "update_event",
            Self::DeleteEvent => "delete_event",
            Self::CreateContact => "create_contact",
            Self::UpdateContact => "update_contact",
            Self::UpdateSyncHealth => "update_sync_health",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.as_str() == s)
    }

    pub fn is_event(&self) -> bool {
        matches!(
            self,
            Self::CreateEvent | Self::UpdateEvent | Self::DeleteEvent
        )
    }

    pub fn is_contact(&self) -> bool {
        matches!(self, Self::CreateContact | Self::UpdateContact)
    }
}

/// A queued mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum QueueOperation {
    CreateEvent(CommunicationEvent),
    UpdateEvent {
        event: CommunicationEvent,
        original_event_id: String,
    },
    DeleteEvent {
        event_id: String,
    },
    CreateContact(Contact),
    UpdateContact {
        contact: Contact,
        original_contact_id: String,
    },
    UpdateSyncHealth(SyncHealthRecord),
}

impl QueueOperation {
    pub fn operation_type(&self) -> OperationType {
        match self {
            Self::CreateEvent(_) => OperationType::CreateEvent,
            Self::UpdateEvent { .. } => OperationType::UpdateEvent,
            Self::DeleteEvent { .. } => OperationType::DeleteEvent,
            Self::CreateContact(_) => OperationType::CreateContact,
            Self::UpdateContact { .. } => OperationType::UpdateContact,
            Self::UpdateSyncHealth(_) => OperationType::UpdateSyncHealth,
        }
    }

    /// Owner recorded in the payload, if the operation carries one
    pub fn payload_user_id(&self) -> Option<&str> {
        match self {
            Self::CreateEvent(event) | Self::UpdateEvent { event, .. } => Some(&event.user_id),
            Self::CreateContact(contact) | Self::UpdateContact { contact, .. } => {
                Some(&contact.user_id)
            }
            Self::UpdateSyncHealth(record) => Some(&record.user_id),
            Self::DeleteEvent { .. } => None,
        }
    }
}

// ============================================================================
// Item
// ============================================================================

/// Retry and lifecycle bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Serialized payload size in bytes
    pub estimated_size: u64,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub operation: QueueOperation,
    pub priority: Priority,
    pub user_id: String,
    pub metadata: ItemMetadata,
    pub status: QueueStatus,
}

impl QueueItem {
    /// Create new pending item, ready immediately
    pub fn new(user_id: impl Into<String>, operation: QueueOperation, priority: Priority) -> Self {
        let estimated_size = serde_json::to_vec(&operation)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0);

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            priority,
            user_id: user_id.into(),
            metadata: ItemMetadata {
                retry_count: 0,
                max_retries: DEFAULT_MAX_RETRIES,
                last_error: None,
                next_retry_at: None,
                estimated_size,
                created_at: now_millis(),
                processing_started_at: None,
            },
            status: QueueStatus::Pending,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.metadata.max_retries = max_retries;
        self
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation.operation_type()
    }

    /// Pending, or failed with its backoff elapsed
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            QueueStatus::Pending => true,
            QueueStatus::Processing => false,
            QueueStatus::Failed => self.metadata.next_retry_at.map_or(true, |at| at <= now),
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.metadata.retry_count >= self.metadata.max_retries
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.metadata.created_at).to_std().unwrap_or_default()
    }
}

/// Exponential backoff for the `retry_count`-th failure, capped at `max`
pub fn retry_backoff(retry_count: u32, base: Duration, max: Duration) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(20);
    base.saturating_mul(2u32.pow(exponent)).min(max)
}
