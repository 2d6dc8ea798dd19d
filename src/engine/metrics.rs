//! Engine counters and metrics snapshots.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Point-in-time view of an engine's counters.
///
/// Recomputed on each sampler tick and on every
/// [`metrics()`](crate::engine::TaskEngine::metrics) call; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Tasks ever submitted to this engine
    pub total_tasks: u64,
    /// Tasks with a successful terminal outcome
    pub completed_tasks: u64,
    /// Tasks with a failed terminal outcome
    pub failed_tasks: u64,
    /// Running average of per-task processing time in milliseconds
    pub average_processing_ms: f64,
    /// Tasks executing right now; never exceeds `max_concurrency`
    pub current_concurrency: usize,
    /// Tasks queued but not yet dispatched
    pub queue_length: usize,
    /// Rate-limiter admissions in the trailing 60 seconds
    pub requests_per_minute: usize,
    /// Resident memory of this process in megabytes
    pub memory_usage_mb: u64,
}

/// Shared atomic counters mutated by the engine's execution paths.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    running: AtomicUsize,
    processing_ms: AtomicU64,
}

impl Counters {
    pub fn record_submitted(&self, count: usize) {
        self.total.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn task_started(&self) {
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_finished(&self, success: bool, duration: Duration) {
        self.running.fetch_sub(1, Ordering::Relaxed);
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.processing_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn current_concurrency(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    /// Fold the counters into a snapshot; queue, limiter, and memory numbers
    /// come from the engine since they live outside the counter set.
    pub fn snapshot(
        &self,
        queue_length: usize,
        requests_per_minute: usize,
        memory_usage_mb: u64,
    ) -> MetricsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let finished = completed + failed;
        let average_processing_ms = if finished == 0 {
            0.0
        } else {
            self.processing_ms.load(Ordering::Relaxed) as f64 / finished as f64
        };

        MetricsSnapshot {
            total_tasks: self.total.load(Ordering::Relaxed),
            completed_tasks: completed,
            failed_tasks: failed,
            average_processing_ms,
            current_concurrency: self.running.load(Ordering::Relaxed),
            queue_length,
            requests_per_minute,
            memory_usage_mb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_roundtrip() {
        let counters = Counters::default();
        counters.record_submitted(3);

        counters.task_started();
        counters.task_started();
        assert_eq!(counters.current_concurrency(), 2);

        counters.task_finished(true, Duration::from_millis(100));
        counters.task_finished(false, Duration::from_millis(300));
        assert_eq!(counters.current_concurrency(), 0);

        let snapshot = counters.snapshot(1, 7, 42);
        assert_eq!(snapshot.total_tasks, 3);
        assert_eq!(snapshot.completed_tasks, 1);
        assert_eq!(snapshot.failed_tasks, 1);
        assert_eq!(snapshot.average_processing_ms, 200.0);
        assert_eq!(snapshot.queue_length, 1);
        assert_eq!(snapshot.requests_per_minute, 7);
        assert_eq!(snapshot.memory_usage_mb, 42);
    }

    #[test]
    fn test_average_with_no_finished_tasks() {
        let counters = Counters::default();
        let snapshot = counters.snapshot(0, 0, 0);
        assert_eq!(snapshot.average_processing_ms, 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let counters = Counters::default();
        let snapshot = counters.snapshot(0, 0, 0);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("current_concurrency").is_some());
    }
}
