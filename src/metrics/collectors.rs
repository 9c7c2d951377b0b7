//! High-level recording interface over the raw Prometheus metrics.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_HANDLERS, EVENTS_PUBLISHED, JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH,
};
use crate::scheduler::QueueStats;

/// Outcome label for `bead_jobs_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying,
    DeadLettered,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Retrying => "retrying",
            JobOutcome::DeadLettered => "dead_lettered",
        }
    }
}

/// Metrics collector for pipeline operations.
///
/// Cheap to clone. Metrics must be initialized with `init_metrics()` for any
/// of the recording methods to have an effect.
///
/// # Example
///
/// ```ignore
/// use bead_pipeline::metrics::{init_metrics, JobOutcome, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_job("scrape-project", JobOutcome::Completed, Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one finished handler invocation.
    pub fn record_job(&self, queue: &str, outcome: JobOutcome, duration: Duration) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total
                .with_label_values(&[queue, outcome.as_str()])
                .inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[queue])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            queue = queue,
            outcome = outcome.as_str(),
            duration_ms = duration.as_millis() as u64,
            "Recorded job metric"
        );
    }

    pub fn set_active_handlers(&self, queue: &str, count: usize) {
        if let Some(active) = ACTIVE_HANDLERS.get() {
            active.with_label_values(&[queue]).set(count as f64);
        }
    }

    /// Update the per-state depth gauges for one queue.
    pub fn record_queue_stats(&self, stats: &QueueStats) {
        let Some(depth) = QUEUE_DEPTH.get() else {
            return;
        };
        let queue = stats.queue.as_str();
        for (state, count) in [
            ("pending", stats.pending),
            ("delayed", stats.delayed),
            ("leased", stats.leased),
            ("completed", stats.completed),
            ("failed", stats.failed),
        ] {
            depth.with_label_values(&[queue, state]).set(count as f64);
        }
    }

    pub fn record_event(&self, topic: &str) {
        if let Some(events) = EVENTS_PUBLISHED.get() {
            events.with_label_values(&[topic]).inc();
        }
    }
}
