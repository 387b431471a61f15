//! Routes queue operations to remote store calls

use crate::models::{CONTACTS_TABLE, EVENTS_TABLE, SYNC_HEALTH_TABLE};
use crate::queue::{ProcessingCallback, ProcessingResult, QueueItem, QueueOperation};
use crate::remote::{Record, RemoteError, RemoteStore};
use async_trait::async_trait;
use regex_lite::Regex;
use serde::Serialize;
use std::sync::Arc;

lazy_static::lazy_static! {
    /// Signatures of transient network failures
    static ref TRANSIENT_ERROR: Option<Regex> = Regex::new(
        r"(?i)(timeout|timed out|connection reset|connection aborted|connection refused|econnreset|econnaborted|etimedout|network is unreachable|broken pipe)"
    )
    .ok();
}

/// True when an error message looks like a transient network failure
pub fn should_retry_on_error(message: &str) -> bool {
    TRANSIENT_ERROR
        .as_ref()
        .map(|re| re.is_match(message))
        .unwrap_or(false)
}

/// How a failed remote call should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Remote already holds the record
    Conflict,
    Transient,
    Permanent,
}

pub fn classify(error: &RemoteError) -> ErrorClass {
    match error {
        RemoteError::ConstraintViolation(_) => ErrorClass::Conflict,
        e if e.is_transient() || should_retry_on_error(&e.to_string()) => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Map a remote outcome onto the queue's processing result
pub fn to_processing_result(outcome: Result<usize, RemoteError>) -> ProcessingResult {
    match outcome {
        Ok(_) => ProcessingResult::success(),
        Err(e) => match classify(&e) {
            ErrorClass::Conflict => ProcessingResult::conflict(e.to_string()),
            ErrorClass::Transient => ProcessingResult::failure(e.to_string(), true),
            ErrorClass::Permanent => ProcessingResult::failure(e.to_string(), false),
        },
    }
}

fn to_record<T: Serialize>(value: &T) -> Result<Record, RemoteError> {
    serde_json::to_value(value).map_err(|e| RemoteError::InvalidRecord(e.to_string()))
}

/// Record without its key, for partial updates
fn to_fields<T: Serialize>(value: &T) -> Result<Record, RemoteError> {
    let mut record = to_record(value)?;
    if let Record::Object(fields) = &mut record {
        fields.remove("id");
    }
    Ok(record)
}

fn payload_len(record: &Record) -> usize {
    serde_json::to_vec(record).map(|bytes| bytes.len()).unwrap_or(0)
}

#[derive(Clone)]
pub struct RemoteDispatcher {
    remote: Arc<dyn RemoteStore>,
}

impl RemoteDispatcher {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self { remote }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Apply one operation remotely; returns the bytes sent
    pub async fn dispatch(&self, operation: &QueueOperation) -> Result<usize, RemoteError> {
        match operation {
            QueueOperation::CreateEvent(event) => {
                let record = to_record(event)?;
                self.remote.insert(EVENTS_TABLE, &record).await?;
                Ok(payload_len(&record))
            }
            QueueOperation::UpdateEvent {
                event,
                original_event_id,
            } => {
                let fields = to_fields(event)?;
                self.remote.update(EVENTS_TABLE, original_event_id, &fields).await?;
                Ok(payload_len(&fields))
            }
            QueueOperation::DeleteEvent { event_id } => {
                self.remote.delete(EVENTS_TABLE, event_id).await?;
                Ok(event_id.len())
            }
            QueueOperation::CreateContact(contact) => {
                let record = to_record(contact)?;
                self.remote.upsert(CONTACTS_TABLE, &record).await?;
                Ok(payload_len(&record))
            }
            QueueOperation::UpdateContact {
                contact,
                original_contact_id,
            } => {
                let fields = to_fields(contact)?;
                self.remote.update(CONTACTS_TABLE, original_contact_id, &fields).await?;
                Ok(payload_len(&fields))
            }
            QueueOperation::UpdateSyncHealth(record) => {
                let record = to_record(record)?;
                self.remote.upsert(SYNC_HEALTH_TABLE, &record).await?;
                Ok(payload_len(&record))
            }
        }
    }
}

/// Lets the queue manager drain items straight to the remote store
#[async_trait]
impl ProcessingCallback for RemoteDispatcher {
    async fn process(&self, item: &QueueItem) -> ProcessingResult {
        let outcome = self.dispatch(&item.operation).await;
        if let Err(e) = &outcome {
            log::debug!("Remote {} failed for item {}: {}", item.operation_type().as_str(), item.id, e);
        }
        to_processing_result(outcome)
    }
}
