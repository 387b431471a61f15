//! In-process remote store
//!
//! Keeps tables in memory, enforces id uniqueness on insert, records every
//! call, and can inject latency, outages and scripted errors. Used by tests
//! and by hosts running without a backend.

use super::{record_id, Filter, FilterOp, Record, RemoteError, RemoteStore, SelectQuery};
use async_trait::async_trait;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Insert,
    Update,
    Delete,
    Upsert,
    Select,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub op: RemoteOp,
    pub table: String,
    pub id: Option<String>,
}

#[derive(Default)]
pub struct MemoryRemoteStore {
    tables: StdMutex<HashMap<String, BTreeMap<String, Record>>>,
    calls: StdMutex<Vec<RemoteCall>>,
    failures: StdMutex<VecDeque<(RemoteOp, RemoteError)>>,
    offline: AtomicBool,
    latency: StdMutex<Duration>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a row in place without recording a call
    pub fn seed(&self, table: &str, record: Record) -> Result<(), RemoteError> {
        let id = record_id(&record)?.to_string();
        let mut tables = self.lock_tables();
        tables.entry(table.to_string()).or_default().insert(id, record);
        Ok(())
    }

    pub fn get(&self, table: &str, id: &str) -> Option<Record> {
        self.lock_tables().get(table).and_then(|rows| rows.get(id).cloned())
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.lock_tables()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// Number of recorded calls, optionally of one kind
    pub fn call_count(&self, op: Option<RemoteOp>) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.iter().filter(|c| op.map_or(true, |op| c.op == op)).count())
            .unwrap_or(0)
    }

    /// Fail the next call of kind `op` with `error`
    pub fn fail_next(&self, op: RemoteOp, error: RemoteError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back((op, error));
        }
    }

    /// While offline every call fails with a network error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut current) = self.latency.lock() {
            *current = latency;
        }
    }

    fn lock_tables(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, Record>>> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn begin(&self, op: RemoteOp, table: &str, id: Option<&str>) -> Result<(), RemoteError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RemoteCall {
                op,
                table: table.to_string(),
                id: id.map(str::to_string),
            });
        }

        let latency = self.latency.lock().map(|l| *l).unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("connection reset by peer".to_string()));
        }

        let scripted = self.failures.lock().ok().and_then(|mut failures| {
            let position = failures.iter().position(|(failing_op, _)| *failing_op == op)?;
            failures.remove(position).map(|(_, error)| error)
        });
        match scripted {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn field_text(value: &Record) -> String {
    match value {
        Record::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Timestamps compare as instants whatever their offset or precision
fn compare_text(a: &str, b: &str) -> CmpOrdering {
    match (
        chrono::DateTime::parse_from_rfc3339(a),
        chrono::DateTime::parse_from_rfc3339(b),
    ) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

fn compare_fields(a: Option<&Record>, b: Option<&Record>) -> CmpOrdering {
    match (a, b) {
        (Some(Record::Number(x)), Some(Record::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal)
        }
        (Some(x), Some(y)) => compare_text(&field_text(x), &field_text(y)),
        (None, Some(_)) => CmpOrdering::Less,
        (Some(_), None) => CmpOrdering::Greater,
        (None, None) => CmpOrdering::Equal,
    }
}

fn matches_filter(row: &Record, filter: &Filter) -> bool {
    let Some(field) = row.get(&filter.column) else {
        return false;
    };
    if filter.op == FilterOp::Eq {
        return field_text(field) == filter.value;
    }

    let ordering = match (field, filter.value.parse::<f64>()) {
        (Record::Number(n), Ok(value)) => match n.as_f64().and_then(|n| n.partial_cmp(&value)) {
            Some(ordering) => ordering,
            None => return false,
        },
        _ => compare_text(&field_text(field), &filter.value),
    };
    match filter.op {
        FilterOp::Gte => ordering != CmpOrdering::Less,
        FilterOp::Lte => ordering != CmpOrdering::Greater,
        FilterOp::Eq => ordering == CmpOrdering::Equal,
    }
}

fn merge(target: &mut Record, fields: &Record) {
    if let (Record::Object(target), Record::Object(fields)) = (target, fields) {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn insert(&self, table: &str, record: &Record) -> Result<Record, RemoteError> {
        let id = record_id(record)?.to_string();
        self.begin(RemoteOp::Insert, table, Some(&id)).await?;

        let mut tables = self.lock_tables();
        let rows = tables.entry(table.to_string()).or_default();
        if rows.contains_key(&id) {
            return Err(RemoteError::ConstraintViolation(format!(
                "duplicate key value violates unique constraint \"{}_pkey\"",
                table
            )));
        }
        rows.insert(id, record.clone());
        Ok(record.clone())
    }

    async fn update(&self, table: &str, id: &str, fields: &Record) -> Result<Record, RemoteError> {
        self.begin(RemoteOp::Update, table, Some(id)).await?;

        let mut tables = self.lock_tables();
        let row = tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(id))
            .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", table, id)))?;
        merge(row, fields);
        Ok(row.clone())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        self.begin(RemoteOp::Delete, table, Some(id)).await?;

        if let Some(rows) = self.lock_tables().get_mut(table) {
            rows.remove(id);
        }
        Ok(())
    }

    async fn upsert(&self, table: &str, record: &Record) -> Result<Record, RemoteError> {
        let id = record_id(record)?.to_string();
        self.begin(RemoteOp::Upsert, table, Some(&id)).await?;

        let mut tables = self.lock_tables();
        let rows = tables.entry(table.to_string()).or_default();
        let row = rows.entry(id).or_insert_with(|| Record::Object(Default::default()));
        merge(row, record);
        Ok(row.clone())
    }

    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Record>, RemoteError> {
        self.begin(RemoteOp::Select, table, None).await?;

        let mut rows: Vec<Record> = self
            .lock_tables()
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| query.filters.iter().all(|filter| matches_filter(row, filter)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some((column, ascending)) = &query.order_by {
            rows.sort_by(|a, b| {
                let ordering = compare_fields(a.get(column), b.get(column));
                if *ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }

        Ok(rows
            .into_iter()
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .collect())
    }
}
