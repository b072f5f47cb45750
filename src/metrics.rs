//! Counters, gauges, and a duration histogram for the publishing
//! pipeline.
//!
//! The registry is constructor-injected wherever it is needed so tests
//! stay hermetic; nothing here is a process-global.

use crate::breaker::BreakerState;
use crate::error::ErrorClass;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds of the publish-duration buckets, in milliseconds. The
/// final implicit bucket is unbounded.
const DURATION_BUCKETS_MS: [u64; 9] = [10, 50, 100, 250, 500, 1000, 2500, 5000, 10_000];

#[derive(Debug, Default)]
struct Histogram {
    buckets: [AtomicU64; 10],
    sum_millis: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn observe(&self, duration: Duration) {
        let millis = duration.as_millis() as u64;
        let idx = DURATION_BUCKETS_MS
            .iter()
            .position(|&bound| millis <= bound)
            .unwrap_or(DURATION_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_millis.fetch_add(millis, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bucket_bounds_ms: DURATION_BUCKETS_MS.to_vec(),
            bucket_counts: self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
            sum_ms: self.sum_millis.load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub bucket_bounds_ms: Vec<u64>,
    pub bucket_counts: Vec<u64>,
    pub sum_ms: u64,
    pub count: u64,
}

/// Process-wide publishing metrics, shared by every component.
#[derive(Debug, Default)]
pub struct Metrics {
    // Dispatch
    submitted: AtomicU64,
    rejected_queue_full: AtomicU64,
    rejected_shutting_down: AtomicU64,
    breaker_skips: AtomicU64,
    // Outcomes
    published: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    errors_transient: AtomicU64,
    errors_permanent: AtomicU64,
    errors_unknown: AtomicU64,
    format_errors: AtomicU64,
    // Breaker
    breaker_opened: AtomicU64,
    breaker_half_opened: AtomicU64,
    breaker_closed: AtomicU64,
    // Registry / mode
    refreshes: AtomicU64,
    targets_rejected: AtomicU64,
    mode_transitions: AtomicU64,
    // DLQ
    dlq_written: AtomicU64,
    dlq_replayed: AtomicU64,
    // Fan-out
    fanout_runs: AtomicU64,
    fanout_partial: AtomicU64,
    // Gauges
    queue_depth_high: AtomicU64,
    queue_depth_medium: AtomicU64,
    queue_depth_low: AtomicU64,
    publish_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_queue_full(&self) {
        self.rejected_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_shutting_down(&self) {
        self.rejected_shutting_down.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_skip(&self) {
        self.breaker_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self, duration: Duration) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.publish_duration.observe(duration);
    }

    pub fn record_failure(&self, class: ErrorClass) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let counter = match class {
            ErrorClass::Transient => &self.errors_transient,
            ErrorClass::Permanent => &self.errors_permanent,
            ErrorClass::Unknown => &self.errors_unknown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_format_error(&self) {
        self.format_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_transition(&self, to: BreakerState) {
        let counter = match to {
            BreakerState::Open => &self.breaker_opened,
            BreakerState::HalfOpen => &self.breaker_half_opened,
            BreakerState::Closed => &self.breaker_closed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh(&self, rejected: usize) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        self.targets_rejected.fetch_add(rejected as u64, Ordering::Relaxed);
    }

    pub fn record_mode_transition(&self) {
        self.mode_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dlq_write(&self) {
        self.dlq_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dlq_replay(&self) {
        self.dlq_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fanout(&self, partial: bool) {
        self.fanout_runs.fetch_add(1, Ordering::Relaxed);
        if partial {
            self.fanout_partial.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_queue_depths(&self, high: usize, medium: usize, low: usize) {
        self.queue_depth_high.store(high as u64, Ordering::Relaxed);
        self.queue_depth_medium.store(medium as u64, Ordering::Relaxed);
        self.queue_depth_low.store(low as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        MetricsSnapshot {
            submitted: get(&self.submitted),
            rejected_queue_full: get(&self.rejected_queue_full),
            rejected_shutting_down: get(&self.rejected_shutting_down),
            breaker_skips: get(&self.breaker_skips),
            published: get(&self.published),
            failed: get(&self.failed),
            retries: get(&self.retries),
            errors_transient: get(&self.errors_transient),
            errors_permanent: get(&self.errors_permanent),
            errors_unknown: get(&self.errors_unknown),
            format_errors: get(&self.format_errors),
            breaker_opened: get(&self.breaker_opened),
            breaker_half_opened: get(&self.breaker_half_opened),
            breaker_closed: get(&self.breaker_closed),
            refreshes: get(&self.refreshes),
            targets_rejected: get(&self.targets_rejected),
            mode_transitions: get(&self.mode_transitions),
            dlq_written: get(&self.dlq_written),
            dlq_replayed: get(&self.dlq_replayed),
            fanout_runs: get(&self.fanout_runs),
            fanout_partial: get(&self.fanout_partial),
            queue_depth_high: get(&self.queue_depth_high),
            queue_depth_medium: get(&self.queue_depth_medium),
            queue_depth_low: get(&self.queue_depth_low),
            publish_duration: self.publish_duration.snapshot(),
        }
    }
}

/// Point-in-time view of every counter, serializable for the admin
/// surface.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub rejected_queue_full: u64,
    pub rejected_shutting_down: u64,
    pub breaker_skips: u64,
    pub published: u64,
    pub failed: u64,
    pub retries: u64,
    pub errors_transient: u64,
    pub errors_permanent: u64,
    pub errors_unknown: u64,
    pub format_errors: u64,
    pub breaker_opened: u64,
    pub breaker_half_opened: u64,
    pub breaker_closed: u64,
    pub refreshes: u64,
    pub targets_rejected: u64,
    pub mode_transitions: u64,
    pub dlq_written: u64,
    pub dlq_replayed: u64,
    pub fanout_runs: u64,
    pub fanout_partial: u64,
    pub queue_depth_high: u64,
    pub queue_depth_medium: u64,
    pub queue_depth_low: u64,
    pub publish_duration: HistogramSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_published(Duration::from_millis(42));
        metrics.record_failure(ErrorClass::Unknown);

        let snap = metrics.snapshot();
        assert_eq!(snap.submitted, 2);
        assert_eq!(snap.published, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.errors_unknown, 1);
        assert_eq!(snap.errors_transient, 0);
    }

    #[test]
    fn histogram_buckets_by_duration() {
        let metrics = Metrics::new();
        metrics.record_published(Duration::from_millis(5));
        metrics.record_published(Duration::from_millis(700));
        metrics.record_published(Duration::from_secs(60));

        let hist = metrics.snapshot().publish_duration;
        assert_eq!(hist.count, 3);
        assert_eq!(hist.bucket_counts[0], 1, "5ms lands in the first bucket");
        assert_eq!(hist.bucket_counts[5], 1, "700ms lands in the 1000ms bucket");
        assert_eq!(*hist.bucket_counts.last().unwrap(), 1, "60s lands in the overflow bucket");
    }

    #[test]
    fn breaker_transitions_count_by_state() {
        let metrics = Metrics::new();
        metrics.record_breaker_transition(BreakerState::Open);
        metrics.record_breaker_transition(BreakerState::HalfOpen);
        metrics.record_breaker_transition(BreakerState::Closed);
        metrics.record_breaker_transition(BreakerState::Open);

        let snap = metrics.snapshot();
        assert_eq!(snap.breaker_opened, 2);
        assert_eq!(snap.breaker_half_opened, 1);
        assert_eq!(snap.breaker_closed, 1);
    }

    #[test]
    fn gauges_overwrite() {
        let metrics = Metrics::new();
        metrics.set_queue_depths(5, 10, 2);
        metrics.set_queue_depths(1, 0, 0);
        let snap = metrics.snapshot();
        assert_eq!(snap.queue_depth_high, 1);
        assert_eq!(snap.queue_depth_medium, 0);
    }

    #[test]
    fn snapshot_serializes() {
        let metrics = Metrics::new();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert!(json.get("published").is_some());
        assert!(json["publish_duration"].get("count").is_some());
    }
}
