//! Conflict Resolver - duplicate event detection across data sources
//!
//! The same call can reach the remote store several times: once from the
//! carrier import, once from on-device collection, once typed in by hand.
//! Candidates share a composite key `(line, number, direction, duration)`
//! with timestamps inside a tolerance. Each candidate pair gets a similarity
//! score and a source-quality weight; confident pairs are resolved by
//! deleting the weaker record, the rest wait for manual review.

use crate::models::{CommunicationEvent, DataSource, EVENTS_TABLE};
use crate::remote::{RemoteError, RemoteStore, SelectQuery};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const TIME_WEIGHT: f64 = 0.5;
const DURATION_WEIGHT: f64 = 0.3;
const FIELD_WEIGHT: f64 = 0.2;

/// Upper bound on conflicts parked for review
const REVIEW_CAPACITY: u64 = 10_000;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictResolverConfig {
    /// Combined confidence needed to resolve without review
    pub auto_resolve_threshold: f64,
    pub carrier_weight: f64,
    pub device_weight: f64,
    pub manual_weight: f64,
    /// Call durations within this many seconds count as equal
    pub duration_tolerance_secs: u32,
    /// How long a conflict stays parked for review
    pub review_ttl_secs: u64,
    /// Rows fetched per remote page
    pub page_size: usize,
}

impl Default for ConflictResolverConfig {
    fn default() -> Self {
        Self {
            auto_resolve_threshold: 0.85,
            carrier_weight: 0.9,
            device_weight: 0.7,
            manual_weight: 0.5,
            duration_tolerance_secs: 1,
            review_ttl_secs: 86_400,
            page_size: 500,
        }
    }
}

impl ConflictResolverConfig {
    pub fn source_weight(&self, source: DataSource) -> f64 {
        match source {
            DataSource::Carrier => self.carrier_weight,
            DataSource::Device => self.device_weight,
            DataSource::Manual => self.manual_weight,
        }
    }
}

// ============================================================================
// Data Types
// ============================================================================

/// Inclusive span of event timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            start: timestamp,
            end: timestamp,
        }
    }

    pub fn include(&mut self, timestamp: DateTime<Utc>) {
        self.start = self.start.min(timestamp);
        self.end = self.end.max(timestamp);
    }

    pub fn merge(&mut self, other: TimeWindow) {
        self.include(other.start);
        self.include(other.end);
    }

    fn widened(&self, by: Duration) -> Self {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            start: self.start - by,
            end: self.end + by,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectOptions {
    /// Page size for remote reads; 0 uses the configured page size
    pub batch_size: usize,
    pub timestamp_tolerance: Duration,
    pub auto_resolve: bool,
    /// Only events whose duplicates could fall in this span are read;
    /// `None` scans the user's whole history
    pub window: Option<TimeWindow>,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            batch_size: 0,
            timestamp_tolerance: Duration::from_secs(1),
            auto_resolve: true,
            window: None,
        }
    }
}

/// Two records that look like the same call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Stable for the pair regardless of order
    pub id: String,
    pub user_id: String,
    /// Record that would be kept
    pub preferred: CommunicationEvent,
    /// Record that would be removed
    pub duplicate: CommunicationEvent,
    pub similarity: f64,
    /// Source-quality weight of the preferred record
    pub quality_weight: f64,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub conflict_id: String,
    pub kept_event_id: String,
    pub removed_event_id: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionReport {
    pub resolved: Vec<ConflictResolution>,
    pub manual_review: Vec<Conflict>,
    /// Confident conflicts whose removal failed transiently; found again next time
    pub deferred: Vec<Conflict>,
}

/// Per-user counters folded into a sync result
///
/// `total` is always `auto_resolved + manual_review + deferred`. Pairs made
/// moot by another resolution in the same round are not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSummary {
    pub total: usize,
    pub auto_resolved: usize,
    pub manual_review: usize,
    pub deferred: usize,
}

impl ConflictSummary {
    fn from_report(report: &ResolutionReport) -> Self {
        let auto_resolved = report.resolved.len();
        let manual_review = report.manual_review.len();
        let deferred = report.deferred.len();
        Self {
            total: auto_resolved + manual_review + deferred,
            auto_resolved,
            manual_review,
            deferred,
        }
    }
}

impl std::ops::AddAssign for ConflictSummary {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.auto_resolved += other.auto_resolved;
        self.manual_review += other.manual_review;
        self.deferred += other.deferred;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConflictError {
    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),
}

// ============================================================================
// Scoring
// ============================================================================

fn conflict_id(a: &CommunicationEvent, b: &CommunicationEvent) -> String {
    if a.id <= b.id {
        format!("{}:{}", a.id, b.id)
    } else {
        format!("{}:{}", b.id, a.id)
    }
}

fn time_delta(a: &CommunicationEvent, b: &CommunicationEvent) -> Duration {
    (a.timestamp - b.timestamp).abs().to_std().unwrap_or_default()
}

fn time_score(delta: Duration, tolerance: Duration) -> f64 {
    if tolerance.is_zero() {
        return if delta.is_zero() { 1.0 } else { 0.0 };
    }
    let ratio = (delta.as_secs_f64() / tolerance.as_secs_f64()).min(1.0);
    1.0 - 0.5 * ratio
}

fn duration_score(a: u32, b: u32) -> f64 {
    let longest = a.max(b);
    if longest == 0 {
        return 1.0;
    }
    1.0 - f64::from(a.abs_diff(b)) / f64::from(longest)
}

fn field_score(a: &CommunicationEvent, b: &CommunicationEvent) -> f64 {
    let type_score = if a.event_type == b.event_type { 0.5 } else { 0.0 };
    let contact_score = match (&a.contact_id, &b.contact_id) {
        (Some(x), Some(y)) if x == y => 0.5,
        (None, None) => 0.5,
        (Some(_), Some(_)) => 0.0,
        _ => 0.25,
    };
    type_score + contact_score
}

// ============================================================================
// Conflict Resolver
// ============================================================================

pub struct ConflictResolver {
    remote: Arc<dyn RemoteStore>,
    config: ConflictResolverConfig,
    /// Conflicts awaiting manual review, keyed by conflict id
    review: Cache<String, Conflict>,
}

impl ConflictResolver {
    pub fn new(remote: Arc<dyn RemoteStore>, config: ConflictResolverConfig) -> Self {
        let review = Cache::builder()
            .max_capacity(REVIEW_CAPACITY)
            .time_to_live(Duration::from_secs(config.review_ttl_secs.max(1)))
            .build();

        Self {
            remote,
            config,
            review,
        }
    }

    pub fn config(&self) -> &ConflictResolverConfig {
        &self.config
    }

    /// Composite-key match: same line, number, direction and duration
    fn is_candidate(&self, a: &CommunicationEvent, b: &CommunicationEvent, tolerance: Duration) -> bool {
        a.id != b.id
            && a.line_id == b.line_id
            && a.direction == b.direction
            && a.normalized_number() == b.normalized_number()
            && a.duration_secs.abs_diff(b.duration_secs) <= self.config.duration_tolerance_secs
            && time_delta(a, b) <= tolerance
    }

    /// Keep the better-sourced record; ties go to the more complete, then earlier one
    fn rank<'a>(
        &self,
        a: &'a CommunicationEvent,
        b: &'a CommunicationEvent,
    ) -> (&'a CommunicationEvent, &'a CommunicationEvent) {
        let weight_a = self.config.source_weight(a.source);
        let weight_b = self.config.source_weight(b.source);

        let a_wins = if (weight_a - weight_b).abs() > f64::EPSILON {
            weight_a > weight_b
        } else if a.completeness() != b.completeness() {
            a.completeness() > b.completeness()
        } else if a.timestamp != b.timestamp {
            a.timestamp < b.timestamp
        } else {
            a.id < b.id
        };

        if a_wins {
            (a, b)
        } else {
            (b, a)
        }
    }

    fn score(&self, a: &CommunicationEvent, b: &CommunicationEvent, tolerance: Duration) -> Conflict {
        let similarity = TIME_WEIGHT * time_score(time_delta(a, b), tolerance)
            + DURATION_WEIGHT * duration_score(a.duration_secs, b.duration_secs)
            + FIELD_WEIGHT * field_score(a, b);

        let (preferred, duplicate) = self.rank(a, b);
        let quality_weight = self.config.source_weight(preferred.source);

        Conflict {
            id: conflict_id(a, b),
            user_id: preferred.user_id.clone(),
            preferred: preferred.clone(),
            duplicate: duplicate.clone(),
            similarity,
            quality_weight,
            confidence: (similarity + quality_weight) / 2.0,
            detected_at: Utc::now(),
        }
    }

    async fn load_events(
        &self,
        user_id: &str,
        window: Option<TimeWindow>,
        page_size: usize,
    ) -> Result<Vec<CommunicationEvent>, ConflictError> {
        let mut events = Vec::new();
        let mut offset = 0;

        loop {
            let mut query = SelectQuery::new().eq("user_id", user_id);
            if let Some(window) = window {
                query = query
                    .gte("timestamp", window.start.to_rfc3339())
                    .lte("timestamp", window.end.to_rfc3339());
            }
            let query = query.order("timestamp", true).limit(page_size).offset(offset);
            let rows = self.remote.select(EVENTS_TABLE, &query).await?;
            let fetched = rows.len();

            for row in rows {
                match serde_json::from_value::<CommunicationEvent>(row) {
                    Ok(event) => events.push(event),
                    Err(e) => log::warn!("Skipping undecodable remote event: {}", e),
                }
            }

            if fetched < page_size {
                break;
            }
            offset += fetched;
        }

        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    /// Candidate duplicate pairs among a user's remote events
    ///
    /// With a window, only events within the window widened by the timestamp
    /// tolerance are read. Each unordered pair is reported at most once.
    /// Pairs already parked for manual review are not reported again.
    pub async fn detect_conflicts_batch(
        &self,
        user_id: &str,
        options: &DetectOptions,
    ) -> Result<Vec<Conflict>, ConflictError> {
        let page_size = if options.batch_size == 0 {
            self.config.page_size.max(1)
        } else {
            options.batch_size
        };
        let tolerance = options.timestamp_tolerance;
        let window = options.window.map(|window| window.widened(tolerance));
        let events = self.load_events(user_id, window, page_size).await?;

        let mut conflicts = Vec::new();
        for (i, a) in events.iter().enumerate() {
            for b in &events[i + 1..] {
                // Sorted by time: nothing further along can be in tolerance
                if time_delta(a, b) > tolerance {
                    break;
                }
                if !self.is_candidate(a, b, tolerance) {
                    continue;
                }
                let id = conflict_id(a, b);
                if self.review.contains_key(&id) {
                    continue;
                }
                conflicts.push(self.score(a, b, tolerance));
            }
        }

        if !conflicts.is_empty() {
            log::info!("Detected {} duplicate candidates for user {}", conflicts.len(), user_id);
        }
        Ok(conflicts)
    }

    /// Resolve confident conflicts; park the rest for manual review
    pub async fn resolve_conflicts_automatically(
        &self,
        conflicts: Vec<Conflict>,
    ) -> Result<ResolutionReport, ConflictError> {
        let mut report = ResolutionReport::default();
        let mut removed: HashSet<String> = HashSet::new();

        for conflict in conflicts {
            if removed.contains(&conflict.preferred.id) || removed.contains(&conflict.duplicate.id) {
                // Already settled through another pair
                continue;
            }

            if conflict.confidence < self.config.auto_resolve_threshold {
                self.park(conflict.clone()).await;
                report.manual_review.push(conflict);
                continue;
            }

            match self.remote.delete(EVENTS_TABLE, &conflict.duplicate.id).await {
                Ok(()) => {
                    log::info!(
                        "Resolved duplicate {}: kept {} ({}), removed {} ({}), confidence {:.3}",
                        conflict.id,
                        conflict.preferred.id,
                        conflict.preferred.source.as_str(),
                        conflict.duplicate.id,
                        conflict.duplicate.source.as_str(),
                        conflict.confidence
                    );
                    removed.insert(conflict.duplicate.id.clone());
                    report.resolved.push(ConflictResolution {
                        conflict_id: conflict.id,
                        kept_event_id: conflict.preferred.id,
                        removed_event_id: conflict.duplicate.id,
                        confidence: conflict.confidence,
                    });
                }
                Err(e) if e.is_transient() => {
                    // Detected again on the next run
                    log::warn!("Could not remove duplicate {}: {}", conflict.duplicate.id, e);
                    report.deferred.push(conflict);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(report)
    }

    /// Detect and, if allowed, resolve conflicts for one user
    pub async fn resolve_for_user(
        &self,
        user_id: &str,
        options: &DetectOptions,
    ) -> Result<ConflictSummary, ConflictError> {
        let conflicts = self.detect_conflicts_batch(user_id, options).await?;

        if !options.auto_resolve {
            let mut report = ResolutionReport::default();
            for conflict in conflicts {
                self.park(conflict.clone()).await;
                report.manual_review.push(conflict);
            }
            return Ok(ConflictSummary::from_report(&report));
        }

        let report = self.resolve_conflicts_automatically(conflicts).await?;
        Ok(ConflictSummary::from_report(&report))
    }

    async fn park(&self, conflict: Conflict) {
        log::info!(
            "Conflict {} needs manual review (confidence {:.3})",
            conflict.id,
            conflict.confidence
        );
        self.review.insert(conflict.id.clone(), conflict).await;
    }

    /// Conflicts waiting for a human decision
    pub fn pending_manual_review(&self) -> Vec<Conflict> {
        let mut pending: Vec<Conflict> = self.review.iter().map(|(_, conflict)| conflict).collect();
        pending.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        pending
    }

    /// Drop a conflict from the review list once the host has settled it
    pub async fn dismiss_review(&self, conflict_id: &str) {
        self.review.invalidate(conflict_id).await;
    }
}
