//! Metrics for the queue manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::jobs::JobStatus;

/// Counters describing queue behaviour since startup
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// Jobs admitted by `enqueue`
    pub jobs_received: AtomicU64,

    /// Jobs currently waiting
    pub jobs_queued: AtomicU64,

    /// Jobs currently holding the execution slot (0 or 1)
    pub jobs_processing: AtomicU64,

    /// Jobs that left the queue for execution
    pub jobs_started: AtomicU64,

    /// Jobs finished as completed
    pub jobs_completed: AtomicU64,

    /// Jobs finished as error (backend failure, timeout, persistence failure)
    pub jobs_failed: AtomicU64,

    /// Jobs cancelled while waiting or running
    pub jobs_cancelled: AtomicU64,

    /// Enqueue calls refused because the queue was full
    pub jobs_rejected: AtomicU64,

    /// Model loads triggered by a job
    pub model_switches: AtomicU64,

    /// Total queue wait time in milliseconds (for averaging)
    pub total_queue_wait_ms: AtomicU64,

    /// Total processing time in milliseconds (for averaging)
    pub total_processing_ms: AtomicU64,

    /// Maximum queue depth observed
    pub max_queue_depth: AtomicU64,
}

impl QueueMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.jobs_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job entering the waiting list
    pub fn record_queued(&self) {
        let queued = self.jobs_queued.fetch_add(1, Ordering::Relaxed) + 1;
        let mut current_max = self.max_queue_depth.load(Ordering::Relaxed);
        while queued > current_max {
            match self.max_queue_depth.compare_exchange_weak(
                current_max,
                queued,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_max = x,
            }
        }
    }

    /// Record a job leaving the waiting list for execution
    pub fn record_started(&self, wait_time: Duration) {
        self.jobs_queued.fetch_sub(1, Ordering::Relaxed);
        self.jobs_processing.fetch_add(1, Ordering::Relaxed);
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
        self.total_queue_wait_ms.fetch_add(wait_time.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record a waiting job removed without running
    pub fn record_withdrawn(&self) {
        self.jobs_queued.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record the final status of a job. `processing_time` is `None` for
    /// jobs that never ran.
    pub fn record_finished(&self, status: JobStatus, processing_time: Option<Duration>) {
        if let Some(elapsed) = processing_time {
            self.jobs_processing.fetch_sub(1, Ordering::Relaxed);
            self.total_processing_ms.fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        }
        let counter = match status {
            JobStatus::Completed => &self.jobs_completed,
            JobStatus::Cancelled => &self.jobs_cancelled,
            _ => &self.jobs_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_model_switch(&self) {
        self.model_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current queue depth
    pub fn queue_depth(&self) -> u64 {
        self.jobs_queued.load(Ordering::Relaxed)
    }

    /// Calculate average queue wait time in milliseconds
    pub fn avg_queue_wait_ms(&self) -> f64 {
        let started = self.jobs_started.load(Ordering::Relaxed);
        if started == 0 {
            return 0.0;
        }
        self.total_queue_wait_ms.load(Ordering::Relaxed) as f64 / started as f64
    }

    /// Calculate average processing time in milliseconds
    pub fn avg_processing_ms(&self) -> f64 {
        let finished = self
            .jobs_started
            .load(Ordering::Relaxed)
            .saturating_sub(self.jobs_processing.load(Ordering::Relaxed));
        if finished == 0 {
            return 0.0;
        }
        self.total_processing_ms.load(Ordering::Relaxed) as f64 / finished as f64
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_received: self.jobs_received.load(Ordering::Relaxed),
            jobs_queued: self.jobs_queued.load(Ordering::Relaxed),
            jobs_processing: self.jobs_processing.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            model_switches: self.model_switches.load(Ordering::Relaxed),
            max_queue_depth: self.max_queue_depth.load(Ordering::Relaxed),
            avg_queue_wait_ms: self.avg_queue_wait_ms(),
            avg_processing_ms: self.avg_processing_ms(),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub jobs_received: u64,
    pub jobs_queued: u64,
    pub jobs_processing: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub jobs_rejected: u64,
    pub model_switches: u64,
    pub max_queue_depth: u64,
    pub avg_queue_wait_ms: f64,
    pub avg_processing_ms: f64,
}
