//! Processing statistics and queue health classification

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Completions older than this no longer count toward the processing rate
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Soft thresholds are this fraction of the hard limit
const WARNING_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_processed: u64,
    pub total_failed: u64,
    /// Items removed because the remote already held them
    pub total_conflicts: u64,
    pub total_dead_lettered: u64,
    /// Items per minute over the last minute
    pub processing_rate: f64,
    pub average_processing_time_ms: f64,
    pub memory_usage_mb: f64,
    pub queue_depth: u64,
    pub oldest_item_age_secs: Option<u64>,
    pub dead_letter_items: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueHealth {
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub stats: ProcessingStats,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub max_queue_size: u64,
    pub max_memory_usage_mb: f64,
    pub stale_item_age: Duration,
}

/// Classify queue health from a stats snapshot
pub fn evaluate_health(stats: &ProcessingStats, thresholds: &HealthThresholds) -> QueueHealth {
    let mut status = HealthStatus::Healthy;
    let mut issues = Vec::new();
    let mut recommendations = Vec::new();

    let mut raise = |level: HealthStatus, issue: String, recommendation: &str| {
        status = status.max(level);
        issues.push(issue);
        recommendations.push(recommendation.to_string());
    };

    let max_depth = thresholds.max_queue_size as f64;
    let depth = stats.queue_depth as f64;
    if max_depth > 0.0 && depth >= max_depth {
        raise(
            HealthStatus::Critical,
            format!("Queue is full ({} of {} items)", stats.queue_depth, thresholds.max_queue_size),
            "Sync as soon as a connection is available",
        );
    } else if max_depth > 0.0 && depth >= max_depth * WARNING_RATIO {
        raise(
            HealthStatus::Warning,
            format!("Queue is nearly full ({} of {} items)", stats.queue_depth, thresholds.max_queue_size),
            "Connect to Wi-Fi to drain the queue",
        );
    }

    let max_memory = thresholds.max_memory_usage_mb;
    if max_memory > 0.0 && stats.memory_usage_mb >= max_memory {
        raise(
            HealthStatus::Critical,
            format!("Queue storage at {:.1} MB exceeds {:.1} MB", stats.memory_usage_mb, max_memory),
            "Run maintenance and sync to free storage",
        );
    } else if max_memory > 0.0 && stats.memory_usage_mb >= max_memory * WARNING_RATIO {
        raise(
            HealthStatus::Warning,
            format!("Queue storage at {:.1} MB is close to {:.1} MB", stats.memory_usage_mb, max_memory),
            "Sync soon to keep storage bounded",
        );
    }

    let max_age = thresholds.stale_item_age.as_secs();
    if let Some(age) = stats.oldest_item_age_secs {
        if max_age > 0 && age > max_age {
            raise(
                HealthStatus::Critical,
                format!("Oldest queued item is {} hours old", age / 3600),
                "Check connectivity and remote store availability",
            );
        } else if max_age > 0 && age as f64 >= max_age as f64 * WARNING_RATIO {
            raise(
                HealthStatus::Warning,
                format!("Oldest queued item is {} hours old", age / 3600),
                "Sync soon, queued items are going stale",
            );
        }
    }

    if stats.dead_letter_items > 0 {
        raise(
            HealthStatus::Warning,
            format!("{} items were dropped into the dead-letter store", stats.dead_letter_items),
            "Review dead-lettered items and requeue or purge them",
        );
    }

    QueueHealth {
        status,
        issues,
        recommendations,
        stats: stats.clone(),
    }
}

/// Running counters behind `ProcessingStats`
#[derive(Debug, Default)]
pub(crate) struct StatsTracker {
    stats: ProcessingStats,
    completions: VecDeque<Instant>,
    timed_samples: u64,
    total_time_ms: f64,
}

impl StatsTracker {
    pub fn record_success(&mut self, elapsed: Duration) {
        self.stats.total_processed += 1;
        self.stats.last_processed_at = Some(Utc::now());
        self.record_timing(elapsed);
    }

    pub fn record_failure(&mut self, elapsed: Duration) {
        self.stats.total_failed += 1;
        self.record_timing(elapsed);
    }

    pub fn record_conflict(&mut self, elapsed: Duration) {
        self.stats.total_conflicts += 1;
        self.record_timing(elapsed);
    }

    pub fn record_dead_letter(&mut self) {
        self.stats.total_dead_lettered += 1;
    }

    fn record_timing(&mut self, elapsed: Duration) {
        self.timed_samples += 1;
        self.total_time_ms += elapsed.as_secs_f64() * 1000.0;
        self.completions.push_back(Instant::now());
    }

    /// Refresh storage-derived fields
    pub fn set_storage(&mut self, depth: u64, size_bytes: u64, oldest: Option<Duration>, dead_letters: u64) {
        self.stats.queue_depth = depth;
        self.stats.memory_usage_mb = size_bytes as f64 / (1024.0 * 1024.0);
        self.stats.oldest_item_age_secs = oldest.map(|age| age.as_secs());
        self.stats.dead_letter_items = dead_letters;
    }

    pub fn snapshot(&mut self) -> ProcessingStats {
        let now = Instant::now();
        while let Some(front) = self.completions.front() {
            if now.duration_since(*front) > RATE_WINDOW {
                self.completions.pop_front();
            } else {
                break;
            }
        }

        self.stats.processing_rate = self.completions.len() as f64 * 60.0 / RATE_WINDOW.as_secs_f64();
        self.stats.average_processing_time_ms = if self.timed_samples == 0 {
            0.0
        } else {
            self.total_time_ms / self.timed_samples as f64
        };
        self.stats.clone()
    }
}
