//! Metrics collection for courier.
//!
//! Counters for the job queue and the inbound message pipeline. All counters
//! are monotonic and updated with relaxed atomics.

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global metrics instance.
static METRICS: std::sync::OnceLock<Arc<Metrics>> = std::sync::OnceLock::new();

/// Get the global metrics instance.
pub fn get_metrics() -> &'static Arc<Metrics> {
    METRICS.get_or_init(|| Arc::new(Metrics::new()))
}

/// Application metrics collector.
#[derive(Debug, Default)]
pub struct Metrics {
    // === Job Queue Metrics ===
    /// Jobs accepted by `submit`
    pub jobs_submitted: AtomicU64,
    /// Jobs re-enqueued from storage at startup
    pub jobs_resumed: AtomicU64,
    /// Jobs that executed successfully
    pub jobs_succeeded: AtomicU64,
    /// Failures scheduled for another attempt
    pub jobs_retried: AtomicU64,
    /// Jobs removed after exhausting their retries or failing for good
    pub jobs_failed_permanently: AtomicU64,
    /// Failures ignored because the job had been canceled
    pub jobs_canceled: AtomicU64,

    // === Receive Metrics ===
    /// Inbound payloads handed to the batch processor
    pub messages_received: AtomicU64,
    /// Payloads dropped as duplicates, self-sends, hidden or non-retryable
    pub messages_dropped: AtomicU64,
    /// Payloads carried into a replacement job
    pub messages_failed: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_resumed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed_permanently: u64,
    pub jobs_canceled: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub messages_failed: u64,
}

impl Metrics {
    /// Create a new metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            jobs_submitted: AtomicU64::new(0),
            jobs_resumed: AtomicU64::new(0),
            jobs_succeeded: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_failed_permanently: AtomicU64::new(0),
            jobs_canceled: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
        }
    }

    /// Record the outcome of one inbound batch.
    pub fn record_batch(&self, received: usize, dropped: usize, failed: usize) {
        self.messages_received
            .fetch_add(received as u64, Ordering::Relaxed);
        self.messages_dropped
            .fetch_add(dropped as u64, Ordering::Relaxed);
        self.messages_failed
            .fetch_add(failed as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_resumed: self.jobs_resumed.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            jobs_failed_permanently: self.jobs_failed_permanently.load(Ordering::Relaxed),
            jobs_canceled: self.jobs_canceled.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let counters = [
            ("jobs_submitted", "Jobs submitted", snapshot.jobs_submitted),
            ("jobs_resumed", "Jobs resumed from storage", snapshot.jobs_resumed),
            ("jobs_succeeded", "Jobs succeeded", snapshot.jobs_succeeded),
            ("jobs_retried", "Job retries scheduled", snapshot.jobs_retried),
            (
                "jobs_failed_permanently",
                "Jobs failed permanently",
                snapshot.jobs_failed_permanently,
            ),
            ("jobs_canceled", "Job failures ignored after cancel", snapshot.jobs_canceled),
            ("messages_received", "Inbound payloads processed", snapshot.messages_received),
            ("messages_dropped", "Inbound payloads dropped", snapshot.messages_dropped),
            ("messages_failed", "Inbound payloads queued for retry", snapshot.messages_failed),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP courier_{name} {help}");
            let _ = writeln!(output, "# TYPE courier_{name} counter");
            let _ = writeln!(output, "courier_{name} {value}");
        }
        output
    }
}
