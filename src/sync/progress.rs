//! Sync progress, throughput and ETA

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Samples kept for the speed estimate
const SPEED_WINDOW: usize = 10;

/// Per-run counters, reset at the start of every run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub total_items: u64,
    pub processed_items: u64,
    pub failed_items: u64,
    pub current_batch: u32,
    pub total_batches: u32,
    pub bytes_transferred: u64,
    /// Items per second over the recent window
    pub sync_speed: f64,
    pub estimated_time_remaining_ms: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
}

impl SyncProgress {
    pub fn remaining_items(&self) -> u64 {
        self.total_items
            .saturating_sub(self.processed_items + self.failed_items)
    }

    pub fn estimated_time_remaining(&self) -> Option<Duration> {
        self.estimated_time_remaining_ms.map(Duration::from_millis)
    }

    /// Completed share in `0.0..=1.0`
    pub fn fraction_complete(&self) -> f64 {
        if self.total_items == 0 {
            return 1.0;
        }
        ((self.processed_items + self.failed_items) as f64 / self.total_items as f64).min(1.0)
    }
}

pub(crate) struct ProgressTracker {
    progress: SyncProgress,
    batch_size: u64,
    /// (time, items completed so far)
    samples: VecDeque<(Instant, u64)>,
    emit_interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(emit_interval: Duration) -> Self {
        Self {
            progress: SyncProgress::default(),
            batch_size: 1,
            samples: VecDeque::with_capacity(SPEED_WINDOW),
            emit_interval,
            last_emit: None,
        }
    }

    pub fn reset(&mut self, total_items: u64, batch_size: usize) {
        self.reset_at(Instant::now(), total_items, batch_size);
    }

    fn reset_at(&mut self, now: Instant, total_items: u64, batch_size: usize) {
        self.batch_size = (batch_size as u64).max(1);
        self.progress = SyncProgress {
            total_items,
            total_batches: self.batches_for(total_items),
            started_at: Some(Utc::now()),
            ..SyncProgress::default()
        };
        self.samples.clear();
        self.samples.push_back((now, 0));
        self.last_emit = None;
    }

    fn batches_for(&self, items: u64) -> u32 {
        items.div_ceil(self.batch_size).min(u64::from(u32::MAX)) as u32
    }

    pub fn progress(&self) -> &SyncProgress {
        &self.progress
    }

    /// Fold in a finished batch; `queue_depth` is what is still queued
    pub fn record_batch(&mut self, processed: u64, failed: u64, bytes: u64, queue_depth: u64) {
        self.record_batch_at(Instant::now(), processed, failed, bytes, queue_depth);
    }

    fn record_batch_at(&mut self, now: Instant, processed: u64, failed: u64, bytes: u64, queue_depth: u64) {
        let progress = &mut self.progress;
        progress.processed_items += processed;
        progress.failed_items += failed;
        progress.bytes_transferred += bytes;
        progress.current_batch += 1;

        // Producers may enqueue while a run is in progress
        let completed = progress.processed_items + progress.failed_items;
        progress.total_items = progress.total_items.max(completed + queue_depth);
        let total_batches = self.batches_for(self.progress.total_items);
        self.progress.total_batches = total_batches.max(self.progress.current_batch);

        if self.samples.len() == SPEED_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back((now, completed));

        self.progress.sync_speed = self.speed();
        let remaining = self.progress.remaining_items();
        self.progress.estimated_time_remaining_ms = if remaining == 0 {
            Some(0)
        } else if self.progress.sync_speed > 0.0 {
            Some((remaining as f64 / self.progress.sync_speed * 1000.0) as u64)
        } else {
            None
        };
    }

    fn speed(&self) -> f64 {
        match (self.samples.front(), self.samples.back()) {
            (Some((first_at, first)), Some((last_at, last))) => {
                let elapsed = last_at.saturating_duration_since(*first_at).as_secs_f64();
                if elapsed <= 0.0 {
                    0.0
                } else {
                    last.saturating_sub(*first) as f64 / elapsed
                }
            }
            _ => 0.0,
        }
    }

    /// Throttle for progress events
    pub fn should_emit(&mut self) -> bool {
        self.should_emit_at(Instant::now())
    }

    fn should_emit_at(&mut self, now: Instant) -> bool {
        let due = self
            .last_emit
            .map_or(true, |at| now.saturating_duration_since(at) >= self.emit_interval);
        if due {
            self.last_emit = Some(now);
        }
        due
    }
}
