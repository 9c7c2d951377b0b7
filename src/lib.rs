//! bead-pipeline: durable job pipeline that scrapes projects and generates posts.
//!
//! This library provides a queue broker abstraction (Redis or in-memory),
//! worker pools with retry and backoff, an event bus, and the stage
//! orchestration that chains `scrape-project` into `generate-posts`.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;

// Re-export commonly used error types
pub use config::ConfigError;
pub use error::{HandlerError, HandlerErrorKind};
pub use events::EventError;
pub use pipeline::{GraphError, SupervisorError};
pub use scheduler::{BrokerError, PoolError};
