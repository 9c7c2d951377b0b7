//! Pipeline orchestration: stages chained through durable queues.
//!
//! This module wires the scheduler and the event bus into the two-stage
//! project pipeline.
//!
//! # Architecture
//!
//! - **Graph**: static DAG of stages, keyed by the queue each one consumes
//! - **Stage**: the [`StageHandler`] trait and the [`StageRunner`] that turns a
//!   handler result into downstream jobs and events
//! - **Stages**: the scrape and post generation handlers plus their HTTP
//!   collaborators
//! - **Supervisor**: one worker pool per stage, ordered start-up and shutdown
//! - **Triggers**: event handlers that enqueue the first job
//!
//! # Pipeline Flow
//!
//! 1. `scrape.requested` is published (or a job is enqueued directly)
//! 2. [`ScrapeRequestTrigger`] enqueues a `scrape-project` job
//! 3. The scrape stage collects insights, enqueues one `generate-posts` job and
//!    publishes `insight.new`
//! 4. The post generation stage writes posts and publishes `post.generated`
//!
//! A failed stage attempt releases nothing downstream; the job is retried by
//! the broker with backoff and dead-lettered once its attempts run out.
//!
//! # Example
//!
//! ```rust,ignore
//! use bead_pipeline::pipeline::{HttpCollaborator, PipelineSupervisor};
//!
//! let http = Arc::new(HttpCollaborator::new(&config.scraper_url, &config.postgen_url)?);
//! let mut supervisor = PipelineSupervisor::standard(&config, broker, bus, http.clone(), http)?;
//! supervisor.start().await?;
//! // ...
//! supervisor.shutdown().await?;
//! ```

pub mod graph;
pub mod stage;
pub mod stages;
pub mod supervisor;
pub mod triggers;

// Re-export main types for convenience
pub use graph::{GraphError, StageGraph};
pub use stage::{StageContext, StageHandler, StageResult, StageRunner};
pub use stages::{
    CollectedInsights, HttpCollaborator, InsightCollector, PostWriter, PostgenStage, ScrapeStage,
};
pub use supervisor::{PipelineSupervisor, SupervisorError, SupervisorStats};
pub use triggers::ScrapeRequestTrigger;
