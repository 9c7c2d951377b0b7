//! In-process broker.
//!
//! Implements the full delivery state machine (leases, backoff parking,
//! lease expiry, dead-lettering, retention) behind a single mutex, so it is a
//! faithful stand-in for the Redis broker in tests and in single-process runs.
//!
//! Deadlines use `tokio::time::Instant`, which makes every timing rule
//! testable with a paused runtime clock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::broker::{
    ensure_payload_queue, Broker, BrokerError, BrokerSettings, NackOutcome, QueueStats,
};
use super::job::{EnqueueOptions, Job, JobId, JobPayload, JobStatus, QueueName};
use super::retry::{FailureCause, RetryDecision};

/// Used when a backoff delay is too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

#[derive(Default)]
struct QueueState {
    /// FIFO of jobs eligible for lease.
    pending: VecDeque<JobId>,
    /// Parked jobs keyed by the instant they become eligible (and a sequence
    /// number to keep equal deadlines in arrival order).
    delayed: BTreeMap<(Instant, u64), JobId>,
    /// Leased jobs and their lease deadline.
    leased: HashMap<JobId, Instant>,
    /// Retained terminal history, oldest first.
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    queues: HashMap<QueueName, QueueState>,
    seq: u64,
    closed: bool,
}

fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay).unwrap_or(now + FAR_FUTURE)
}

fn retain_recent(list: &mut VecDeque<JobId>, limit: usize, jobs: &mut HashMap<JobId, Job>) {
    while list.len() > limit {
        if let Some(evicted) = list.pop_front() {
            jobs.remove(&evicted);
        }
    }
}

impl State {
    fn park(&mut self, queue: QueueName, job_id: JobId, due: Instant) {
        self.seq += 1;
        let seq = self.seq;
        self.queues
            .entry(queue)
            .or_default()
            .delayed
            .insert((due, seq), job_id);
    }

    /// Moves parked jobs whose delay has elapsed to the back of the FIFO.
    fn promote_due(&mut self, queue: QueueName, now: Instant) {
        let State { jobs, queues, .. } = self;
        let q = queues.entry(queue).or_default();

        while let Some((&(due, _), _)) = q.delayed.first_key_value() {
            if due > now {
                break;
            }
            if let Some((_, job_id)) = q.delayed.pop_first() {
                if let Some(job) = jobs.get_mut(&job_id) {
                    job.status = JobStatus::Pending;
                }
                q.pending.push_back(job_id);
            }
        }
    }

    fn expire_leases(&mut self, queue: QueueName, now: Instant, settings: &BrokerSettings) -> usize {
        let expired: Vec<JobId> = self
            .queues
            .get(&queue)
            .map(|q| {
                q.leased
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();

        let count = expired.len();
        for job_id in expired {
            self.fail_attempt(job_id, None, &FailureCause::LeaseExpired, now, settings);
        }
        count
    }

    /// Records a failed delivery of a leased job. With `attempt`, only applies
    /// while the job is still leased at that attempt.
    fn fail_attempt(
        &mut self,
        job_id: JobId,
        attempt: Option<u32>,
        cause: &FailureCause,
        now: Instant,
        settings: &BrokerSettings,
    ) -> NackOutcome {
        let Some(queue) = self
            .jobs
            .get(&job_id)
            .filter(|job| attempt.map_or(true, |a| a == job.attempt))
            .map(|job| job.queue)
        else {
            return NackOutcome::Ignored;
        };
        let retention = settings.for_queue(queue).retention;

        let State {
            jobs, queues, seq, ..
        } = self;
        let q = queues.entry(queue).or_default();
        if q.leased.remove(&job_id).is_none() {
            return NackOutcome::Ignored;
        }
        let Some(job) = jobs.get_mut(&job_id) else {
            return NackOutcome::Ignored;
        };

        job.lease_expires_at = None;
        job.last_error = Some(cause.message());

        match job.retry_decision() {
            RetryDecision::Retry {
                next_attempt,
                delay,
            } => {
                job.attempt = next_attempt;
                job.status = JobStatus::Retrying;
                *seq += 1;
                q.delayed.insert((deadline_after(now, delay), *seq), job_id);
                NackOutcome::Retrying {
                    attempt: next_attempt,
                    delay,
                }
            }
            RetryDecision::DeadLetter { attempts } => {
                job.status = JobStatus::Failed;
                q.failed.push_back(job_id);
                retain_recent(&mut q.failed, retention.failed, jobs);
                NackOutcome::DeadLettered { attempts }
            }
        }
    }

    fn take_next(
        &mut self,
        queue: QueueName,
        now: Instant,
        lease_timeout: Duration,
        settings: &BrokerSettings,
    ) -> Option<Job> {
        self.expire_leases(queue, now, settings);
        self.promote_due(queue, now);

        let State { jobs, queues, .. } = self;
        let q = queues.entry(queue).or_default();

        while let Some(job_id) = q.pending.pop_front() {
            let Some(job) = jobs.get_mut(&job_id) else {
                continue;
            };
            job.status = JobStatus::Leased;
            job.lease_expires_at = chrono::Duration::from_std(lease_timeout)
                .ok()
                .map(|timeout| Utc::now() + timeout);
            q.leased.insert(job_id, deadline_after(now, lease_timeout));
            return Some(job.clone());
        }
        None
    }

    /// Earliest instant at which something on the queue changes by itself.
    fn next_due(&self, queue: QueueName) -> Option<Instant> {
        let q = self.queues.get(&queue)?;
        let delayed = q.delayed.keys().next().map(|(due, _)| *due);
        let lease = q.leased.values().min().copied();
        match (delayed, lease) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Broker keeping all state in process memory.
pub struct InMemoryBroker {
    settings: BrokerSettings,
    state: Mutex<State>,
    notify: Notify,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

impl InMemoryBroker {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        let state = self
            .state
            .lock()
            .map_err(|_| BrokerError::Unavailable("broker state poisoned".to_string()))?;
        if state.closed {
            return Err(BrokerError::Unavailable("broker closed".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobId, BrokerError> {
        ensure_payload_queue(queue, &payload)?;

        let job_id = {
            let mut state = self.lock()?;
            if let Some(existing) = options.job_id.filter(|id| state.jobs.contains_key(id)) {
                return Ok(existing);
            }

            let job = Job::from_options(payload, &options, &self.settings.for_queue(queue).retry);
            let job_id = job.id;
            state.jobs.insert(job_id, job);

            match options.delay.filter(|d| !d.is_zero()) {
                Some(delay) => {
                    let due = deadline_after(Instant::now(), delay);
                    state.park(queue, job_id, due);
                }
                None => state.queues.entry(queue).or_default().pending.push_back(job_id),
            }
            job_id
        };

        self.notify.notify_waiters();
        Ok(job_id)
    }

    async fn lease(
        &self,
        queue: QueueName,
        lease_timeout: Duration,
        wait: Duration,
    ) -> Result<Option<Job>, BrokerError> {
        let deadline = deadline_after(Instant::now(), wait);

        loop {
            // Registered before checking state so a concurrent enqueue cannot
            // slip between the check and the wait.
            let notified = self.notify.notified();

            let next_due = {
                let mut state = self.lock()?;
                let now = Instant::now();
                if let Some(job) = state.take_next(queue, now, lease_timeout, &self.settings) {
                    return Ok(Some(job));
                }
                state.next_due(queue)
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, job_id: JobId, attempt: u32) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let Some(queue) = state
            .jobs
            .get(&job_id)
            .filter(|job| job.attempt == attempt)
            .map(|job| job.queue)
        else {
            return Ok(());
        };
        let retention = self.settings.for_queue(queue).retention;

        let State { jobs, queues, .. } = &mut *state;
        let q = queues.entry(queue).or_default();
        if q.leased.remove(&job_id).is_none() {
            return Ok(());
        }
        if let Some(job) = jobs.get_mut(&job_id) {
            job.status = JobStatus::Completed;
            job.lease_expires_at = None;
        }
        q.completed.push_back(job_id);
        retain_recent(&mut q.completed, retention.completed, jobs);
        Ok(())
    }

    async fn nack(
        &self,
        job_id: JobId,
        attempt: u32,
        cause: FailureCause,
    ) -> Result<NackOutcome, BrokerError> {
        let outcome = {
            let mut state = self.lock()?;
            state.fail_attempt(job_id, Some(attempt), &cause, Instant::now(), &self.settings)
        };

        if matches!(outcome, NackOutcome::Retrying { .. }) {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    async fn requeue_expired(&self, queue: QueueName) -> Result<usize, BrokerError> {
        let expired = {
            let mut state = self.lock()?;
            state.expire_leases(queue, Instant::now(), &self.settings)
        };

        if expired > 0 {
            self.notify.notify_waiters();
        }
        Ok(expired)
    }

    async fn job(&self, job_id: JobId) -> Result<Option<Job>, BrokerError> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    async fn stats(&self, queue: QueueName) -> Result<QueueStats, BrokerError> {
        let state = self.lock()?;
        let mut stats = QueueStats {
            queue: queue.to_string(),
            ..Default::default()
        };
        if let Some(q) = state.queues.get(&queue) {
            stats.pending = q.pending.len();
            stats.delayed = q.delayed.len();
            stats.leased = q.leased.len();
            stats.completed = q.completed.len();
            stats.failed = q.failed.len();
        }
        Ok(stats)
    }

    async fn dead_letters(
        &self,
        queue: QueueName,
        limit: usize,
    ) -> Result<Vec<Job>, BrokerError> {
        let state = self.lock()?;
        let Some(q) = state.queues.get(&queue) else {
            return Ok(Vec::new());
        };
        Ok(q
            .failed
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect())
    }

    async fn requeue_failed(&self, job_id: JobId) -> Result<bool, BrokerError> {
        {
            let mut state = self.lock()?;
            let Some(queue) = state.jobs.get(&job_id).map(|job| job.queue) else {
                return Ok(false);
            };

            let State { jobs, queues, .. } = &mut *state;
            let q = queues.entry(queue).or_default();
            let Some(position) = q.failed.iter().position(|id| *id == job_id) else {
                return Ok(false);
            };
            q.failed.remove(position);
            if let Some(job) = jobs.get_mut(&job_id) {
                job.attempt = 1;
                job.status = JobStatus::Pending;
            }
            q.pending.push_back(job_id);
        }

        self.notify.notify_waiters();
        Ok(true)
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.lock().map(|_| ())
    }

    async fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.notify.notify_waiters();
    }
}
