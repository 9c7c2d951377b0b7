//! Prometheus metrics for queues, handlers and events.
//!
//! # Example
//!
//! ```ignore
//! use bead_pipeline::metrics::{export_metrics, init_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... run the pipeline ...
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{JobOutcome, MetricsCollector};
pub use prometheus::{
    export_metrics, init_metrics, ACTIVE_HANDLERS, EVENTS_PUBLISHED, JOBS_TOTAL, JOB_DURATION,
    QUEUE_DEPTH, REGISTRY,
};
