//! Broker abstraction: the durable side of the pipeline.
//!
//! A broker stores jobs per queue and implements the delivery state machine:
//!
//! ```text
//!   enqueue ──► pending ──lease──► leased ──ack──► completed
//!                  ▲                  │
//!                  │   backoff        │ nack / lease expiry
//!                  └──── retrying ◄───┤
//!                                     └──(attempts exhausted)──► failed
//! ```
//!
//! Every transition is atomic at the broker: two concurrent `lease` calls
//! never return the same job, and `ack` / `nack` on a job that is no longer
//! leased are no-ops. Both carry the attempt number the worker leased, so a
//! worker whose lease expired cannot settle the redelivery that replaced it.
//! Delivery is at-least-once.
//!
//! One broker client is opened per process and shared (`Arc<dyn Broker>`) by
//! every worker pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::job::{EnqueueOptions, Job, JobId, JobPayload, QueueName};
use super::retry::{FailureCause, RetryPolicy};

/// Errors that can occur during broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker connection cannot be established, was lost, or was closed.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize job data.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A payload was offered to, or read back from, the wrong queue.
    #[error("Payload for queue {actual} does not belong on queue {expected}")]
    PayloadMismatch {
        expected: QueueName,
        actual: QueueName,
    },

    /// A stored job record could not be decoded.
    #[error("Corrupt job record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },
}

impl BrokerError {
    /// Whether the error means the connection itself is gone.
    pub fn is_unavailable(&self) -> bool {
        match self {
            BrokerError::Unavailable(_) => true,
            BrokerError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal()
            }
            _ => false,
        }
    }
}

/// Checks that `payload` is tagged for `queue`.
pub fn ensure_payload_queue(queue: QueueName, payload: &JobPayload) -> Result<(), BrokerError> {
    if payload.queue() == queue {
        Ok(())
    } else {
        Err(BrokerError::PayloadMismatch {
            expected: queue,
            actual: payload.queue(),
        })
    }
}

/// How many terminal jobs are kept for inspection. Oldest are evicted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed: usize,
    pub failed: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: 100,
            failed: 500,
        }
    }
}

/// Per-queue configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSettings {
    pub retry: RetryPolicy,
    pub retention: RetentionPolicy,
}

/// Queue settings with optional per-queue overrides.
#[derive(Debug, Clone, Default)]
pub struct BrokerSettings {
    pub defaults: QueueSettings,
    pub overrides: BTreeMap<QueueName, QueueSettings>,
}

impl BrokerSettings {
    pub fn new(defaults: QueueSettings) -> Self {
        Self {
            defaults,
            overrides: BTreeMap::new(),
        }
    }

    /// Uses `settings` for `queue` instead of the defaults.
    pub fn with_override(mut self, queue: QueueName, settings: QueueSettings) -> Self {
        self.overrides.insert(queue, settings);
        self
    }

    pub fn for_queue(&self, queue: QueueName) -> QueueSettings {
        self.overrides.get(&queue).copied().unwrap_or(self.defaults)
    }
}

/// Result of a `nack` (explicit or via lease expiry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Parked; becomes pending again after `delay` as attempt `attempt`.
    Retrying { attempt: u32, delay: Duration },
    /// Terminal failure after `attempts` deliveries.
    DeadLettered { attempts: u32 },
    /// The job was not leased (already acked, expired, or unknown).
    Ignored,
}

/// Point-in-time counts for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue: String,
    /// Eligible for lease now.
    pub pending: usize,
    /// Waiting for a backoff or initial delay to elapse.
    pub delayed: usize,
    /// Currently owned by a worker.
    pub leased: usize,
    /// Retained completed jobs.
    pub completed: usize,
    /// Retained dead-lettered jobs.
    pub failed: usize,
}

impl QueueStats {
    /// Jobs that still need processing.
    pub fn outstanding(&self) -> usize {
        self.pending + self.delayed + self.leased
    }

    /// Returns the total number of jobs tracked for the queue.
    pub fn total_jobs(&self) -> usize {
        self.outstanding() + self.completed + self.failed
    }
}

/// Durable job queue broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends a job with `attempt = 1`, `status = pending`.
    ///
    /// Never waits for processing. Fails with [`BrokerError::Unavailable`]
    /// when the connection is down; the caller decides whether to retry.
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobId, BrokerError>;

    /// Leases the oldest eligible job, waiting up to `wait` for one.
    ///
    /// The returned job is `leased` until `now + lease_timeout`. Returns
    /// `Ok(None)` when nothing became available in time.
    async fn lease(
        &self,
        queue: QueueName,
        lease_timeout: Duration,
        wait: Duration,
    ) -> Result<Option<Job>, BrokerError>;

    /// Marks a job completed if it is still leased at `attempt`. Anything
    /// else (unknown id, not leased, a later attempt) is a no-op.
    async fn ack(&self, job_id: JobId, attempt: u32) -> Result<(), BrokerError>;

    /// Records failed attempt `attempt` and either schedules a retry or
    /// dead-letters. Returns `Ignored` unless the job is leased at `attempt`.
    async fn nack(
        &self,
        job_id: JobId,
        attempt: u32,
        cause: FailureCause,
    ) -> Result<NackOutcome, BrokerError>;

    /// Applies an implicit `nack(LeaseExpired)` to every expired lease on the
    /// queue. Returns how many leases were reclaimed.
    async fn requeue_expired(&self, queue: QueueName) -> Result<usize, BrokerError>;

    /// Looks up a job that is outstanding or still retained.
    async fn job(&self, job_id: JobId) -> Result<Option<Job>, BrokerError>;

    async fn stats(&self, queue: QueueName) -> Result<QueueStats, BrokerError>;

    /// Most recent dead-lettered jobs, newest first.
    async fn dead_letters(&self, queue: QueueName, limit: usize)
        -> Result<Vec<Job>, BrokerError>;

    /// Operator action: puts a failed job back as a fresh pending job with
    /// `attempt = 1`. Returns `false` if the job is not dead-lettered.
    async fn requeue_failed(&self, job_id: JobId) -> Result<bool, BrokerError>;

    /// Verifies the connection.
    async fn ping(&self) -> Result<(), BrokerError>;

    /// Releases the connection. Later calls fail with `Unavailable`.
    async fn close(&self);
}

/// Broker handle shared by every pool in a process.
pub type SharedBroker = Arc<dyn Broker>;
