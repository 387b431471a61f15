//! Remote store abstraction
//!
//! The server-side event/contact store, seen as tables of JSON records keyed
//! by `id`. Implementations must report uniqueness-constraint violations as
//! `RemoteError::ConstraintViolation` so duplicates are never retried.

pub mod http;
pub mod memory;

pub use http::{HttpRemoteConfig, HttpRemoteStore};
pub use memory::{MemoryRemoteStore, RemoteCall, RemoteOp};

use async_trait::async_trait;

/// A remote row
pub type Record = serde_json::Value;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RemoteError {
    #[error("Unique constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Request rejected {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

impl RemoteError {
    /// Worth retrying later with the same payload
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Timeout(_)
                | RemoteError::Network(_)
                | RemoteError::RateLimited
                | RemoteError::Server { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gte,
    Lte,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Gte => "gte",
            FilterOp::Lte => "lte",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

/// Filtered, ordered, paged read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub filters: Vec<Filter>,
    /// Column and ascending flag
    pub order_by: Option<(String, bool)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl SelectQuery {
    pub fn new() -> Self {
        Self::default()
    }

    fn filter(mut self, column: impl Into<String>, op: FilterOp, value: impl Into<String>) -> Self {
        self.filters.push(Filter {
            column: column.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter(column, FilterOp::Eq, value)
    }

    /// Rows whose `column` is at or after `value`
    pub fn gte(self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter(column, FilterOp::Gte, value)
    }

    /// Rows whose `column` is at or before `value`
    pub fn lte(self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter(column, FilterOp::Lte, value)
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order_by = Some((column.into(), ascending));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn insert(&self, table: &str, record: &Record) -> Result<Record, RemoteError>;

    /// Merge `fields` into the row with `id`; `NotFound` if there is none
    async fn update(&self, table: &str, id: &str, fields: &Record) -> Result<Record, RemoteError>;

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError>;

    async fn upsert(&self, table: &str, record: &Record) -> Result<Record, RemoteError>;

    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Record>, RemoteError>;
}

/// `id` field of a record
pub(crate) fn record_id(record: &Record) -> Result<&str, RemoteError> {
    record
        .get("id")
        .and_then(|id| id.as_str())
        .ok_or_else(|| RemoteError::InvalidRecord("record has no string id".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Timeout("30s".into()).is_transient());
        assert!(RemoteError::Server {
            status: 503,
            message: "busy".into()
        }
        .is_transient());
        assert!(RemoteError::RateLimited.is_transient());
        assert!(!RemoteError::ConstraintViolation("dup".into()).is_transient());
        assert!(!RemoteError::NotFound("e1".into()).is_transient());
        assert!(!RemoteError::Unauthorized.is_transient());
    }

    #[test]
    fn test_record_id() {
        assert_eq!(record_id(&serde_json::json!({"id": "e1"})).unwrap(), "e1");
        assert!(record_id(&serde_json::json!({"id": 7})).is_err());
    }
}
