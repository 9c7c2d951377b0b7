//! Worker pool for processing jobs from one queue.
//!
//! A pool spawns a fixed number of workers against a shared broker. Each
//! worker runs as an independent async task: lease a job, hand it to the
//! pool's [`JobProcessor`], then ack on success or nack on error. The number
//! of workers is the stage's concurrency limit, so more than `num_workers`
//! handlers can never run at once.
//!
//! # Features
//!
//! - Graceful shutdown with broadcast channel and a bounded grace period
//! - Lease reaper that reclaims jobs from crashed or hung workers
//! - Handler panics contained as ordinary failures
//! - Pool statistics tracking

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::HandlerError;
use crate::metrics::{JobOutcome, MetricsCollector};

use super::broker::{BrokerError, NackOutcome, SharedBroker};
use super::job::{Job, QueueName};
use super::retry::FailureCause;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Broker call made by the pool itself failed.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Worker initialization failed.
    #[error("Worker initialization failed: {0}")]
    WorkerInitFailed(String),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out; unfinished jobs are left to lease expiry.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Executes the business logic for one leased job.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Runs the handler. `Ok` leads to ack, `Err` to nack.
    async fn process(&self, job: &Job) -> Result<(), HandlerError>;
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn (the stage's concurrency limit).
    pub num_workers: usize,
    /// Queue consumed by this pool.
    pub queue: QueueName,
    /// Lease duration granted for each job.
    pub lease_timeout: Duration,
    /// How long a single lease call waits for a job before looping.
    pub poll_interval: Duration,
    /// How often expired leases are swept back into the queue.
    pub reap_interval: Duration,
    /// Optional upper bound on a single handler invocation.
    pub job_timeout: Option<Duration>,
    /// Grace period for in-flight jobs on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            queue: QueueName::ScrapeProject,
            lease_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            reap_interval: Duration::from_secs(5),
            job_timeout: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration for `queue` with the given concurrency.
    pub fn new(queue: QueueName, num_workers: usize) -> Self {
        Self {
            queue,
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Sets the job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Queue consumed by the pool.
    pub queue: String,
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Handlers executing right now.
    pub active_workers: usize,
    /// Highest number of handlers seen executing at once.
    pub peak_active_workers: usize,
    /// Jobs acked after a successful handler run.
    pub jobs_completed: u64,
    /// Jobs dead-lettered after their final attempt.
    pub jobs_failed: u64,
    /// Failed attempts that were scheduled for another delivery.
    pub jobs_retried: u64,
    /// Average handler duration across all invocations.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of handler invocations.
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed + self.jobs_retried
    }

    /// Returns the share of invocations that succeeded, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
    peak_active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
            peak_active_workers: AtomicU64::new(0),
        }
    }

    fn add_duration(&self, duration: Duration) {
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.add_duration(duration);
    }

    fn record_retry(&self, duration: Duration) {
        self.jobs_retried.fetch_add(1, Ordering::SeqCst);
        self.add_duration(duration);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.add_duration(duration);
    }

    /// Returns the new number of active handlers.
    fn increment_active(&self) -> u64 {
        let active = self.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active_workers.fetch_max(active, Ordering::SeqCst);
        active
    }

    fn decrement_active(&self) -> u64 {
        self.active_workers.fetch_sub(1, Ordering::SeqCst) - 1
    }

    fn to_pool_stats(&self, queue: QueueName, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let retried = self.jobs_retried.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total_jobs = completed + failed + retried;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            queue: queue.to_string(),
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            peak_active_workers: self.peak_active_workers.load(Ordering::SeqCst) as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            jobs_retried: retried,
            average_job_duration: average_duration,
        }
    }
}

/// Worker pool that manages multiple workers consuming one queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    broker: SharedBroker,
    processor: Arc<dyn JobProcessor>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    reaper_handle: Option<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool over an already connected broker.
    pub fn new(
        config: WorkerPoolConfig,
        broker: SharedBroker,
        processor: Arc<dyn JobProcessor>,
    ) -> Self {
        // Only one shutdown signal is ever sent.
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            broker,
            processor,
            shutdown_tx,
            worker_handles: Vec::new(),
            reaper_handle: None,
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers and the lease reaper.
    ///
    /// Expired leases left by a previous process are reclaimed first.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running and
    /// `PoolError::WorkerInitFailed` if it is configured with zero workers.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        if self.config.num_workers == 0 {
            return Err(PoolError::WorkerInitFailed(format!(
                "queue {} configured with zero workers",
                self.config.queue
            )));
        }

        let queue = self.config.queue;
        match self.broker.requeue_expired(queue).await {
            Ok(recovered) if recovered > 0 => {
                info!(queue = %queue, recovered = recovered, "Recovered expired leases");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(queue = %queue, error = %e, "Failed to recover expired leases");
            }
        }

        for i in 0..self.config.num_workers {
            let worker = Worker::new(
                format!("{}-{}", queue, i),
                &self.config,
                Arc::clone(&self.broker),
                Arc::clone(&self.processor),
                self.shutdown_tx.subscribe(),
                Arc::clone(&self.stats),
            );

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        let reaper = Reaper {
            queue,
            interval: self.config.reap_interval,
            broker: Arc::clone(&self.broker),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        self.reaper_handle = Some(tokio::spawn(reaper.run()));

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            queue = %queue,
            num_workers = self.config.num_workers,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers stop leasing immediately and finish the job they hold. Workers
    /// still busy after the shutdown timeout are aborted; their jobs stay
    /// leased and come back through lease expiry.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!(queue = %self.config.queue, "Initiating worker pool shutdown");

        // Workers that already exited dropped their receivers.
        let _ = self.shutdown_tx.send(());

        if let Some(reaper) = self.reaper_handle.take() {
            if let Err(e) = reaper.await {
                error!(error = %e, "Lease reaper panicked during shutdown");
            }
        }

        let mut handles = std::mem::take(&mut self.worker_handles);
        let drain = async {
            for handle in handles.iter_mut() {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };
        let drained = tokio::time::timeout(self.config.shutdown_timeout, drain).await;
        self.is_running.store(false, Ordering::SeqCst);

        match drained {
            Ok(()) => {
                info!(queue = %self.config.queue, "Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                let stuck = handles.iter().filter(|h| !h.is_finished()).count();
                for handle in &handles {
                    handle.abort();
                }
                warn!(
                    queue = %self.config.queue,
                    abandoned = stuck,
                    "Grace period elapsed, abandoning in-flight jobs to lease expiry"
                );
                Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats
            .to_pool_stats(self.config.queue, self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn queue(&self) -> QueueName {
        self.config.queue
    }
}

/// Periodically turns expired leases back into pending or failed jobs.
struct Reaper {
    queue: QueueName,
    interval: Duration,
    broker: SharedBroker,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Reaper {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.broker.requeue_expired(self.queue).await {
                Ok(0) => {}
                Ok(reclaimed) => {
                    warn!(queue = %self.queue, reclaimed = reclaimed, "Reclaimed expired leases");
                }
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "Lease sweep failed");
                }
            }
        }
        debug!(queue = %self.queue, "Lease reaper stopped");
    }
}

/// A single worker that processes jobs from the queue.
struct Worker {
    /// Unique identifier for this worker.
    id: String,
    queue: QueueName,
    broker: SharedBroker,
    processor: Arc<dyn JobProcessor>,
    /// Receiver for shutdown signal.
    shutdown_rx: broadcast::Receiver<()>,
    lease_timeout: Duration,
    /// How long one lease call waits when the queue is empty.
    poll_interval: Duration,
    /// Maximum time for processing a single job.
    job_timeout: Option<Duration>,
    /// Shared statistics.
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    fn new(
        id: String,
        config: &WorkerPoolConfig,
        broker: SharedBroker,
        processor: Arc<dyn JobProcessor>,
        shutdown_rx: broadcast::Receiver<()>,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        Self {
            id,
            queue: config.queue,
            broker,
            processor,
            shutdown_rx,
            lease_timeout: config.lease_timeout,
            poll_interval: config.poll_interval,
            job_timeout: config.job_timeout,
            stats,
            metrics: MetricsCollector::new(),
        }
    }

    /// Main worker loop.
    ///
    /// Leases and processes jobs until a shutdown signal is received. The
    /// signal interrupts a pending lease wait, never a running handler.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            let leased = tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                leased = self.broker.lease(self.queue, self.lease_timeout, self.poll_interval) => leased,
            };

            match leased {
                Ok(Some(job)) => self.process_job(job).await,
                Ok(None) => {
                    debug!(worker_id = %self.id, "No jobs available");
                }
                Err(e) if e.is_unavailable() => {
                    warn!(worker_id = %self.id, error = %e, "Broker unavailable, retrying lease");
                    tokio::select! {
                        _ = self.shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to lease job");
                    // Back off, but stay responsive to shutdown.
                    tokio::select! {
                        _ = self.shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Runs the handler for one leased job and settles it with the broker.
    async fn process_job(&self, job: Job) {
        let job_id = job.id;
        let start_time = Instant::now();

        info!(
            worker_id = %self.id,
            job_id = %job_id,
            queue = %self.queue,
            attempt = job.attempt,
            "Processing job"
        );

        let active = self.stats.increment_active();
        self.metrics.set_active_handlers(self.queue.as_str(), active as usize);

        let result = self.execute_with_timeout(&job).await;
        let duration = start_time.elapsed();

        let active = self.stats.decrement_active();
        self.metrics.set_active_handlers(self.queue.as_str(), active as usize);

        match result {
            Ok(()) => {
                if let Err(e) = self.broker.ack(job_id, job.attempt).await {
                    error!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        error = %e,
                        "Failed to ack job, it will be redelivered after lease expiry"
                    );
                    return;
                }
                self.stats.record_completion(duration);
                self.metrics
                    .record_job(self.queue.as_str(), JobOutcome::Completed, duration);
                info!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed successfully"
                );
            }
            Err(handler_err) => self.settle_failure(&job, handler_err, duration).await,
        }
    }

    async fn settle_failure(&self, job: &Job, handler_err: HandlerError, duration: Duration) {
        let job_id = job.id;
        let cause = FailureCause::from(&handler_err);
        match self.broker.nack(job_id, job.attempt, cause).await {
            Ok(NackOutcome::Retrying { attempt, delay }) => {
                self.stats.record_retry(duration);
                self.metrics
                    .record_job(self.queue.as_str(), JobOutcome::Retrying, duration);
                warn!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    error = %handler_err,
                    next_attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Job failed, scheduled for retry"
                );
            }
            Ok(NackOutcome::DeadLettered { attempts }) => {
                self.stats.record_failure(duration);
                self.metrics
                    .record_job(self.queue.as_str(), JobOutcome::DeadLettered, duration);
                error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    queue = %self.queue,
                    attempts = attempts,
                    error = %handler_err,
                    "Job failed permanently, moved to dead letters"
                );
            }
            Ok(NackOutcome::Ignored) => {
                warn!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    error = %handler_err,
                    "Job failed after its lease was reclaimed, nack ignored"
                );
            }
            Err(e) => {
                error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    error = %e,
                    "Failed to nack job, it will be retried after lease expiry"
                );
            }
        }
    }

    /// Runs the processor, turning panics and timeouts into handler errors.
    async fn execute_with_timeout(&self, job: &Job) -> Result<(), HandlerError> {
        let guarded = AssertUnwindSafe(self.processor.process(job)).catch_unwind();

        let outcome = match self.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(HandlerError::timeout(limit)),
            },
            None => guarded.await,
        };

        outcome.unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(HandlerError::new(format!("handler panicked: {}", message)))
        })
    }
}
