//! Durable job queues and the worker pools that consume them.
//!
//! - **Broker**: storage and delivery state machine for jobs (Redis or in-memory)
//! - **WorkerPool**: fixed-size pool of workers leasing from one queue
//! - **Job**: typed payloads, delivery attempts and status
//! - **Retry**: backoff policies and the retry / dead-letter decision
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │ (CLI/stage)  │
//!                      └──────┬───────┘
//!                             │ enqueue
//!                      ┌──────▼───────┐
//!                      │    Broker    │  pending / delayed / leased
//!                      │ (per queue)  │  completed / failed
//!                      └──────┬───────┘
//!                             │ lease
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│  ack / nack
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use bead_pipeline::scheduler::{
//!     Broker, EnqueueOptions, InMemoryBroker, QueueName, ScrapeProjectJob, Source,
//!     WorkerPool, WorkerPoolConfig,
//! };
//! use std::sync::Arc;
//!
//! let broker = Arc::new(InMemoryBroker::default());
//! let job = ScrapeProjectJob::new("p1", vec![Source::Twitter]);
//! broker
//!     .enqueue(QueueName::ScrapeProject, job.into(), EnqueueOptions::default())
//!     .await?;
//!
//! let config = WorkerPoolConfig::new(QueueName::ScrapeProject, 2);
//! let mut pool = WorkerPool::new(config, broker, processor);
//! pool.start().await?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic transitions**: lease, ack and nack are single broker operations
//! - **Crash recovery**: expired leases are reclaimed at start-up and periodically
//! - **Dead letters**: jobs that exhaust their attempts are retained for operators
//! - **Graceful shutdown**: workers finish current jobs before stopping

pub mod broker;
pub mod job;
pub mod memory;
pub mod redis;
pub mod retry;
pub mod worker_pool;

pub use broker::{
    Broker, BrokerError, BrokerSettings, NackOutcome, QueueSettings, QueueStats, RetentionPolicy,
    SharedBroker,
};
pub use job::{
    EnqueueOptions, GeneratePostsJob, Job, JobId, JobPayload, JobStatus, QueueName,
    ScrapeProjectJob, Source,
};
pub use memory::InMemoryBroker;
pub use redis::RedisBroker;
pub use retry::{BackoffPolicy, FailureCause, RetryDecision, RetryPolicy};
pub use worker_pool::{JobProcessor, PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
