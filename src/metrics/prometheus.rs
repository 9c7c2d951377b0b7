//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the pipeline and provides
//! functions for initializing, registering, and exporting them.

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all pipeline metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Handler invocations, labeled by queue and outcome
/// (`completed`, `retrying`, `dead_lettered`).
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Handler duration in seconds, labeled by queue.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Handlers executing right now, labeled by queue.
pub static ACTIVE_HANDLERS: OnceLock<GaugeVec> = OnceLock::new();

/// Jobs per queue state, labeled by queue and state.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Events published on the bus, labeled by topic.
pub static EVENTS_PUBLISHED: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at start-up. Until then every recording method on
/// [`MetricsCollector`](super::MetricsCollector) is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("bead_jobs_total", "Total handler invocations by outcome"),
        &["queue", "outcome"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "bead_job_duration_seconds",
            "Stage handler duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["queue"],
    )?;

    let active_handlers = GaugeVec::new(
        Opts::new("bead_active_handlers", "Stage handlers currently executing"),
        &["queue"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("bead_queue_depth", "Number of jobs per queue state"),
        &["queue", "state"],
    )?;

    let events_published = CounterVec::new(
        Opts::new("bead_events_published_total", "Events published on the bus"),
        &["topic"],
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(active_handlers.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(events_published.clone()))?;

    // A second call leaves the first registration in place.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = ACTIVE_HANDLERS.set(active_handlers);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = EVENTS_PUBLISHED.set(events_published);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        // Another test may have initialized the registry first.
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(jobs) = JOBS_TOTAL.get() {
            jobs.with_label_values(&["scrape-project", "completed"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("bead_jobs_total"));
    }
}
