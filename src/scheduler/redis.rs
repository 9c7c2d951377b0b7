//! Redis-backed durable broker.
//!
//! Each queue uses four Redis structures plus one hash per job:
//!
//! - `{prefix}:{queue}:pending`: list of job ids eligible for lease (LPUSH / RPOP, FIFO)
//! - `{prefix}:{queue}:delayed`: sorted set of parked job ids, scored by eligibility time (ms)
//! - `{prefix}:{queue}:leased`: sorted set of leased job ids, scored by lease expiry (ms)
//! - `{prefix}:{queue}:completed` / `:failed`: capped lists of retained terminal ids
//! - `{prefix}:{queue}:corrupt`: capped list of leased ids whose record could not be decoded
//! - `{prefix}:job:{id}`: hash holding the job record
//!
//! # Reliability
//!
//! Every state transition runs as a single Lua script, so two workers can
//! never lease the same job and ack/nack of a job that is no longer leased
//! does nothing. Ack and nack carry the attempt number the worker leased, so
//! a worker whose lease was reclaimed cannot settle the redelivery, and retry
//! accounting stays idempotent when an explicit nack races a lease-expiry
//! sweep. A leased record that cannot be decoded is moved aside to the
//! `corrupt` list instead of blocking the queue. The retry decision itself is computed in Rust from the job's
//! `RetryPolicy` so both brokers share one implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, warn};
use uuid::Uuid;

use super::broker::{
    ensure_payload_queue, Broker, BrokerError, BrokerSettings, NackOutcome, QueueStats,
};
use super::job::{EnqueueOptions, Job, JobId, JobPayload, JobStatus, QueueName};
use super::retry::{FailureCause, RetryDecision};

/// Default key prefix for all pipeline keys.
pub const DEFAULT_KEY_PREFIX: &str = "bead";

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1],
  'queue', ARGV[2], 'payload', ARGV[3], 'attempt', 1, 'max_attempts', ARGV[4],
  'backoff', ARGV[5], 'status', 'pending', 'enqueued_at', ARGV[6],
  'lease_expires_at', '', 'last_error', '')
if tonumber(ARGV[7]) > tonumber(ARGV[6]) then
  redis.call('ZADD', KEYS[3], ARGV[7], ARGV[1])
else
  redis.call('LPUSH', KEYS[2], ARGV[1])
end
return 1
"#;

const LEASE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('LPUSH', KEYS[1], id)
  redis.call('HSET', ARGV[3] .. id, 'status', 'pending')
end
local id = redis.call('RPOP', KEYS[1])
if not id then
  return false
end
local expires = tonumber(ARGV[1]) + tonumber(ARGV[2])
redis.call('ZADD', KEYS[3], expires, id)
redis.call('HSET', ARGV[3] .. id, 'status', 'leased', 'lease_expires_at', expires)
return id
"#;

const ACK_SCRIPT: &str = r#"
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  return 0
end
if redis.call('HGET', KEYS[3], 'attempt') ~= ARGV[4] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[3], 'status', 'completed', 'lease_expires_at', '')
redis.call('LPUSH', KEYS[2], ARGV[1])
while redis.call('LLEN', KEYS[2]) > tonumber(ARGV[2]) do
  local evicted = redis.call('RPOP', KEYS[2])
  redis.call('DEL', ARGV[3] .. evicted)
end
return 1
"#;

const NACK_SCRIPT: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score then
  return 0
end
if ARGV[8] ~= '' and tonumber(score) > tonumber(ARGV[8]) then
  return 0
end
if redis.call('HGET', KEYS[4], 'attempt') ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
if ARGV[3] == 'retry' then
  redis.call('HINCRBY', KEYS[4], 'attempt', 1)
  redis.call('HSET', KEYS[4], 'status', 'retrying', 'lease_expires_at', '', 'last_error', ARGV[5])
  redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
else
  redis.call('HSET', KEYS[4], 'status', 'failed', 'lease_expires_at', '', 'last_error', ARGV[5])
  redis.call('LPUSH', KEYS[3], ARGV[1])
  while redis.call('LLEN', KEYS[3]) > tonumber(ARGV[6]) do
    local evicted = redis.call('RPOP', KEYS[3])
    redis.call('DEL', ARGV[7] .. evicted)
  end
end
return 1
"#;

const QUARANTINE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
if redis.call('EXISTS', KEYS[3]) == 1 then
  redis.call('HSET', KEYS[3], 'status', 'failed', 'lease_expires_at', '', 'last_error', ARGV[2])
end
redis.call('LPUSH', KEYS[2], ARGV[1])
while redis.call('LLEN', KEYS[2]) > tonumber(ARGV[3]) do
  local evicted = redis.call('RPOP', KEYS[2])
  redis.call('DEL', ARGV[4] .. evicted)
end
return 1
"#;

const REQUEUE_FAILED_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[3], 'attempt', 1, 'status', 'pending', 'lease_expires_at', '')
redis.call('LPUSH', KEYS[2], ARGV[1])
return 1
"#;

/// Redis key names for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKeys {
    pending: String,
    delayed: String,
    leased: String,
    completed: String,
    failed: String,
    corrupt: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue: QueueName) -> Self {
        let base = format!("{}:{}", prefix, queue.as_str());
        Self {
            pending: format!("{}:pending", base),
            delayed: format!("{}:delayed", base),
            leased: format!("{}:leased", base),
            completed: format!("{}:completed", base),
            failed: format!("{}:failed", base),
            corrupt: format!("{}:corrupt", base),
        }
    }
}

struct Scripts {
    enqueue: Script,
    lease: Script,
    ack: Script,
    nack: Script,
    quarantine: Script,
    requeue_failed: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE_SCRIPT),
            lease: Script::new(LEASE_SCRIPT),
            ack: Script::new(ACK_SCRIPT),
            nack: Script::new(NACK_SCRIPT),
            quarantine: Script::new(QUARANTINE_SCRIPT),
            requeue_failed: Script::new(REQUEUE_FAILED_SCRIPT),
        }
    }
}

fn millis(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}

fn parse_field<T: std::str::FromStr>(
    id: &str,
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<T, BrokerError> {
    let raw = fields.get(name).ok_or_else(|| BrokerError::CorruptRecord {
        id: id.to_string(),
        reason: format!("missing field '{}'", name),
    })?;
    raw.parse().map_err(|_| BrokerError::CorruptRecord {
        id: id.to_string(),
        reason: format!("invalid value '{}' for field '{}'", raw, name),
    })
}

fn parse_timestamp(id: &str, raw: &str) -> Result<Option<DateTime<Utc>>, BrokerError> {
    if raw.is_empty() {
        return Ok(None);
    }
    let ms: i64 = raw.parse().map_err(|_| BrokerError::CorruptRecord {
        id: id.to_string(),
        reason: format!("invalid timestamp '{}'", raw),
    })?;
    Ok(DateTime::from_timestamp_millis(ms))
}

fn corrupt(id: &str, reason: impl Into<String>) -> BrokerError {
    BrokerError::CorruptRecord {
        id: id.to_string(),
        reason: reason.into(),
    }
}

/// Rebuilds a job from its Redis hash. Any undecodable field is reported as
/// [`BrokerError::CorruptRecord`].
fn decode_job(id: &str, fields: &HashMap<String, String>) -> Result<Job, BrokerError> {
    let job_id: Uuid = id.parse().map_err(|_| corrupt(id, "job id is not a uuid"))?;
    let payload_raw = fields.get("payload").map(String::as_str).unwrap_or_default();
    let backoff_raw = fields.get("backoff").map(String::as_str).unwrap_or_default();
    let empty = String::new();

    Ok(Job {
        id: job_id,
        queue: parse_field(id, fields, "queue")?,
        payload: serde_json::from_str::<JobPayload>(payload_raw)
            .map_err(|e| corrupt(id, format!("invalid payload: {}", e)))?,
        attempt: parse_field(id, fields, "attempt")?,
        max_attempts: parse_field(id, fields, "max_attempts")?,
        backoff: serde_json::from_str(backoff_raw)
            .map_err(|e| corrupt(id, format!("invalid backoff: {}", e)))?,
        status: parse_field(id, fields, "status")?,
        enqueued_at: parse_timestamp(id, fields.get("enqueued_at").unwrap_or(&empty))?
            .unwrap_or_else(Utc::now),
        lease_expires_at: parse_timestamp(id, fields.get("lease_expires_at").unwrap_or(&empty))?,
        last_error: fields
            .get("last_error")
            .filter(|e| !e.is_empty())
            .cloned(),
    })
}

/// Durable broker on a single Redis connection manager.
pub struct RedisBroker {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    prefix: String,
    settings: BrokerSettings,
    /// Interval between lease attempts while a queue is empty.
    poll_interval: Duration,
    scripts: Scripts,
    closed: AtomicBool,
}

impl RedisBroker {
    /// Connects to Redis and verifies the connection.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Unavailable` if the connection fails.
    pub async fn connect(
        redis_url: &str,
        prefix: &str,
        settings: BrokerSettings,
        poll_interval: Duration,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let broker = Self::from_connection(redis, prefix, settings, poll_interval);
        broker.ping().await?;
        Ok(broker)
    }

    /// Creates a broker from an existing ConnectionManager.
    pub fn from_connection(
        redis: ConnectionManager,
        prefix: &str,
        settings: BrokerSettings,
        poll_interval: Duration,
    ) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            settings,
            poll_interval,
            scripts: Scripts::load(),
            closed: AtomicBool::new(false),
        }
    }

    fn conn(&self) -> Result<ConnectionManager, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("broker closed".to_string()));
        }
        Ok(self.redis.clone())
    }

    fn keys(&self, queue: QueueName) -> QueueKeys {
        QueueKeys::new(&self.prefix, queue)
    }

    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}{}", self.job_key_prefix(), id)
    }

    async fn load_job(
        &self,
        conn: &mut ConnectionManager,
        id: &str,
    ) -> Result<Option<Job>, BrokerError> {
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_job(id, &fields).map(Some)
    }

    /// Records a failed delivery. With `attempt`, only applies while the job
    /// is leased at that attempt. With `expired_before`, only applies if the
    /// lease deadline is at or before that instant (ms).
    async fn fail_leased(
        &self,
        job_id: JobId,
        attempt: Option<u32>,
        cause: &FailureCause,
        expired_before: Option<i64>,
    ) -> Result<NackOutcome, BrokerError> {
        let mut conn = self.conn()?;
        let id = job_id.to_string();

        let Some(job) = self.load_job(&mut conn, &id).await? else {
            if expired_before.is_some() {
                return Err(corrupt(&id, "leased id has no job record"));
            }
            return Ok(NackOutcome::Ignored);
        };
        if job.status != JobStatus::Leased || attempt.is_some_and(|a| a != job.attempt) {
            return Ok(NackOutcome::Ignored);
        }

        let keys = self.keys(job.queue);
        let retention = self.settings.for_queue(job.queue).retention;
        let now_ms = Utc::now().timestamp_millis();

        let (mode, available_ms, outcome) = match job.retry_decision() {
            RetryDecision::Retry {
                next_attempt,
                delay,
            } => (
                "retry",
                now_ms.saturating_add(millis(delay)),
                NackOutcome::Retrying {
                    attempt: next_attempt,
                    delay,
                },
            ),
            RetryDecision::DeadLetter { attempts } => {
                ("fail", 0, NackOutcome::DeadLettered { attempts })
            }
        };

        let mut invocation = self.scripts.nack.prepare_invoke();
        invocation
            .key(&keys.leased)
            .key(&keys.delayed)
            .key(&keys.failed)
            .key(self.job_key(&id))
            .arg(&id)
            .arg(job.attempt)
            .arg(mode)
            .arg(available_ms)
            .arg(cause.message())
            .arg(retention.failed)
            .arg(self.job_key_prefix())
            .arg(expired_before.map(|ms| ms.to_string()).unwrap_or_default());
        let applied: i32 = invocation.invoke_async(&mut conn).await?;

        if applied == 1 {
            Ok(outcome)
        } else {
            debug!(job_id = %job_id, "Nack ignored, job no longer leased at this attempt");
            Ok(NackOutcome::Ignored)
        }
    }

    /// Moves an undecodable leased id to the `corrupt` list so it stops
    /// blocking leases and sweeps. Returns whether the id was still leased.
    async fn quarantine(
        &self,
        conn: &mut ConnectionManager,
        queue: QueueName,
        id: &str,
        reason: &str,
    ) -> Result<bool, BrokerError> {
        let keys = self.keys(queue);
        let retention = self.settings.for_queue(queue).retention;

        let mut invocation = self.scripts.quarantine.prepare_invoke();
        invocation
            .key(&keys.leased)
            .key(&keys.corrupt)
            .key(self.job_key(id))
            .arg(id)
            .arg(reason)
            .arg(retention.failed)
            .arg(self.job_key_prefix());
        let moved: i32 = invocation.invoke_async(conn).await?;

        if moved == 1 {
            warn!(job_id = %id, queue = %queue, reason = %reason, "Quarantined corrupt job record");
        }
        Ok(moved == 1)
    }

    /// Returns the key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobId, BrokerError> {
        ensure_payload_queue(queue, &payload)?;
        let mut conn = self.conn()?;

        let job = Job::from_options(payload, &options, &self.settings.for_queue(queue).retry);
        let id = job.id.to_string();
        let keys = self.keys(queue);
        let enqueued_ms = job.enqueued_at.timestamp_millis();
        let available_ms = options
            .delay
            .filter(|d| !d.is_zero())
            .map(|d| enqueued_ms.saturating_add(millis(d)))
            .unwrap_or(0);

        let mut invocation = self.scripts.enqueue.prepare_invoke();
        invocation
            .key(self.job_key(&id))
            .key(&keys.pending)
            .key(&keys.delayed)
            .arg(&id)
            .arg(queue.as_str())
            .arg(serde_json::to_string(&job.payload)?)
            .arg(job.max_attempts)
            .arg(serde_json::to_string(&job.backoff)?)
            .arg(enqueued_ms)
            .arg(available_ms);
        let created: i32 = invocation.invoke_async(&mut conn).await?;

        if created == 0 {
            debug!(job_id = %job.id, queue = %queue, "Job id already present, enqueue skipped");
        }
        Ok(job.id)
    }

    async fn lease(
        &self,
        queue: QueueName,
        lease_timeout: Duration,
        wait: Duration,
    ) -> Result<Option<Job>, BrokerError> {
        let keys = self.keys(queue);
        let started = tokio::time::Instant::now();

        loop {
            let mut conn = self.conn()?;
            let now_ms = Utc::now().timestamp_millis();

            let mut invocation = self.scripts.lease.prepare_invoke();
            invocation
                .key(&keys.pending)
                .key(&keys.delayed)
                .key(&keys.leased)
                .arg(now_ms)
                .arg(millis(lease_timeout))
                .arg(self.job_key_prefix());
            let leased: Option<String> = invocation.invoke_async(&mut conn).await?;

            if let Some(id) = leased {
                let decoded = match self.load_job(&mut conn, &id).await {
                    Ok(Some(job)) => ensure_payload_queue(queue, &job.payload).map(|_| job),
                    Ok(None) => Err(corrupt(&id, "leased id has no job record")),
                    Err(e) => Err(e),
                };
                match decoded {
                    Ok(job) => return Ok(Some(job)),
                    Err(
                        e @ (BrokerError::CorruptRecord { .. }
                        | BrokerError::PayloadMismatch { .. }),
                    ) => {
                        self.quarantine(&mut conn, queue, &id, &e.to_string()).await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= wait {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(wait - elapsed)).await;
        }
    }

    async fn ack(&self, job_id: JobId, attempt: u32) -> Result<(), BrokerError> {
        let mut conn = self.conn()?;
        let id = job_id.to_string();

        let queue: Option<String> = conn.hget(self.job_key(&id), "queue").await?;
        let Some(queue) = queue.and_then(|q| q.parse::<QueueName>().ok()) else {
            return Ok(());
        };
        let keys = self.keys(queue);
        let retention = self.settings.for_queue(queue).retention;

        let mut invocation = self.scripts.ack.prepare_invoke();
        invocation
            .key(&keys.leased)
            .key(&keys.completed)
            .key(self.job_key(&id))
            .arg(&id)
            .arg(retention.completed)
            .arg(self.job_key_prefix())
            .arg(attempt);
        let applied: i32 = invocation.invoke_async(&mut conn).await?;
        if applied == 0 {
            debug!(job_id = %job_id, attempt = attempt, "Ack ignored, job no longer leased at this attempt");
        }
        Ok(())
    }

    async fn nack(
        &self,
        job_id: JobId,
        attempt: u32,
        cause: FailureCause,
    ) -> Result<NackOutcome, BrokerError> {
        self.fail_leased(job_id, Some(attempt), &cause, None).await
    }

    async fn requeue_expired(&self, queue: QueueName) -> Result<usize, BrokerError> {
        let mut conn = self.conn()?;
        let keys = self.keys(queue);
        let now_ms = Utc::now().timestamp_millis();

        let expired: Vec<String> = conn.zrangebyscore(&keys.leased, "-inf", now_ms).await?;
        let mut reclaimed = 0;
        for id in expired {
            let outcome = match id.parse::<Uuid>() {
                Ok(job_id) => {
                    self.fail_leased(job_id, None, &FailureCause::LeaseExpired, Some(now_ms))
                        .await
                }
                Err(_) => Err(corrupt(&id, "job id is not a uuid")),
            };
            match outcome {
                Ok(NackOutcome::Ignored) => {}
                Ok(_) => reclaimed += 1,
                Err(e @ BrokerError::CorruptRecord { .. }) => {
                    self.quarantine(&mut conn, queue, &id, &e.to_string()).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }

    async fn job(&self, job_id: JobId) -> Result<Option<Job>, BrokerError> {
        let mut conn = self.conn()?;
        self.load_job(&mut conn, &job_id.to_string()).await
    }

    async fn stats(&self, queue: QueueName) -> Result<QueueStats, BrokerError> {
        let mut conn = self.conn()?;
        let keys = self.keys(queue);

        let mut pipe = redis::pipe();
        pipe.llen(&keys.pending)
            .zcard(&keys.delayed)
            .zcard(&keys.leased)
            .llen(&keys.completed)
            .llen(&keys.failed);
        let (pending, delayed, leased, completed, failed): (usize, usize, usize, usize, usize) =
            pipe.query_async(&mut conn).await?;

        Ok(QueueStats {
            queue: queue.to_string(),
            pending,
            delayed,
            leased,
            completed,
            failed,
        })
    }

    async fn dead_letters(
        &self,
        queue: QueueName,
        limit: usize,
    ) -> Result<Vec<Job>, BrokerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let keys = self.keys(queue);

        let ids: Vec<String> = conn.lrange(&keys.failed, 0, limit as isize - 1).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load_job(&mut conn, &id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn requeue_failed(&self, job_id: JobId) -> Result<bool, BrokerError> {
        let mut conn = self.conn()?;
        let id = job_id.to_string();

        let queue: Option<String> = conn.hget(self.job_key(&id), "queue").await?;
        let Some(queue) = queue.and_then(|q| q.parse::<QueueName>().ok()) else {
            return Ok(false);
        };
        let keys = self.keys(queue);

        let mut invocation = self.scripts.requeue_failed.prepare_invoke();
        invocation
            .key(&keys.failed)
            .key(&keys.pending)
            .key(self.job_key(&id))
            .arg(&id);
        let requeued: i32 = invocation.invoke_async(&mut conn).await?;
        Ok(requeued == 1)
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn()?;
        let reply: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        debug!(reply = %reply, "Redis ping");
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{ScrapeProjectJob, Source};
    use crate::scheduler::retry::BackoffPolicy;

    fn record() -> HashMap<String, String> {
        let payload: JobPayload = ScrapeProjectJob::new("p1", vec![Source::Twitter]).into();
        HashMap::from([
            ("queue".to_string(), "scrape-project".to_string()),
            (
                "payload".to_string(),
                serde_json::to_string(&payload).expect("payload"),
            ),
            ("attempt".to_string(), "2".to_string()),
            ("max_attempts".to_string(), "3".to_string()),
            (
                "backoff".to_string(),
                serde_json::to_string(&BackoffPolicy::default()).expect("backoff"),
            ),
            ("status".to_string(), "leased".to_string()),
            ("enqueued_at".to_string(), "1700000000000".to_string()),
            ("lease_expires_at".to_string(), "1700000030000".to_string()),
            ("last_error".to_string(), "".to_string()),
        ])
    }

    #[test]
    fn test_queue_keys() {
        let keys = QueueKeys::new("bead", QueueName::GeneratePosts);
        assert_eq!(keys.pending, "bead:generate-posts:pending");
        assert_eq!(keys.delayed, "bead:generate-posts:delayed");
        assert_eq!(keys.leased, "bead:generate-posts:leased");
        assert_eq!(keys.completed, "bead:generate-posts:completed");
        assert_eq!(keys.failed, "bead:generate-posts:failed");
    }

    #[test]
    fn test_decode_job() {
        let id = Uuid::new_v4();
        let job = decode_job(&id.to_string(), &record()).expect("decode");

        assert_eq!(job.id, id);
        assert_eq!(job.queue, QueueName::ScrapeProject);
        assert_eq!(job.attempt, 2);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.status, JobStatus::Leased);
        assert_eq!(job.enqueued_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(
            job.lease_expires_at.map(|t| t.timestamp_millis()),
            Some(1_700_000_030_000)
        );
        assert!(job.last_error.is_none());
    }

    #[test]
    fn test_decode_job_rejects_bad_fields() {
        let id = Uuid::new_v4();
        let mut fields = record();
        fields.insert("attempt".to_string(), "two".to_string());
        assert!(matches!(
            decode_job(&id.to_string(), &fields),
            Err(BrokerError::CorruptRecord { .. })
        ));

        let fields = record();
        assert!(decode_job("not-a-uuid", &fields).is_err());
    }

    #[test]
    fn test_undecodable_payload_and_backoff_are_corrupt() {
        let id = Uuid::new_v4().to_string();

        let mut fields = record();
        fields.insert(
            "payload".to_string(),
            r#"{"queue":"send-email","data":{}}"#.to_string(),
        );
        assert!(matches!(
            decode_job(&id, &fields),
            Err(BrokerError::CorruptRecord { reason, .. }) if reason.contains("payload")
        ));

        let mut fields = record();
        fields.insert("backoff".to_string(), "{not json".to_string());
        assert!(matches!(
            decode_job(&id, &fields),
            Err(BrokerError::CorruptRecord { reason, .. }) if reason.contains("backoff")
        ));
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(2000)), 2000);
        assert_eq!(millis(Duration::MAX), i64::MAX);
    }

    async fn connect_test_broker() -> RedisBroker {
        let url = std::env::var("REDIS_URL")
            .expect("REDIS_URL environment variable must be set for Redis tests");
        let prefix = format!("bead-test-{}", Uuid::new_v4());
        RedisBroker::connect(
            &url,
            &prefix,
            BrokerSettings::default(),
            Duration::from_millis(50),
        )
        .await
        .expect("redis should be reachable")
    }

    #[tokio::test]
    #[ignore] // Run with: REDIS_URL=redis://localhost:6379 cargo test -- --ignored
    async fn test_redis_lease_ack_cycle() {
        let broker = connect_test_broker().await;
        let payload: JobPayload = ScrapeProjectJob::new("p1", vec![Source::Twitter]).into();
        let id = broker
            .enqueue(QueueName::ScrapeProject, payload, EnqueueOptions::default())
            .await
            .expect("enqueue");

        let job = broker
            .lease(QueueName::ScrapeProject, Duration::from_secs(30), Duration::from_secs(1))
            .await
            .expect("lease")
            .expect("job");
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Leased);

        broker.ack(id, 1).await.expect("ack");
        broker.ack(id, 1).await.expect("ack again");
        let stats = broker.stats(QueueName::ScrapeProject).await.expect("stats");
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.leased, 0);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_nack_until_dead_letter() {
        let broker = connect_test_broker().await;
        let payload: JobPayload = ScrapeProjectJob::new("p1", vec![Source::Twitter]).into();
        let options = EnqueueOptions::new()
            .with_max_attempts(2)
            .with_backoff(BackoffPolicy::fixed(Duration::from_millis(100)));
        let id = broker
            .enqueue(QueueName::ScrapeProject, payload, options)
            .await
            .expect("enqueue");

        let lease = Duration::from_secs(30);
        broker
            .lease(QueueName::ScrapeProject, lease, Duration::from_secs(1))
            .await
            .expect("lease")
            .expect("job");
        let outcome = broker
            .nack(id, 1, FailureCause::Handler("boom".into()))
            .await
            .expect("nack");
        assert!(matches!(outcome, NackOutcome::Retrying { attempt: 2, .. }));

        let job = broker
            .lease(QueueName::ScrapeProject, lease, Duration::from_secs(2))
            .await
            .expect("lease")
            .expect("redelivered");
        assert_eq!(job.attempt, 2);

        let outcome = broker
            .nack(id, 2, FailureCause::Handler("boom again".into()))
            .await
            .expect("nack");
        assert_eq!(outcome, NackOutcome::DeadLettered { attempts: 2 });

        let dead = broker
            .dead_letters(QueueName::ScrapeProject, 10)
            .await
            .expect("dead letters");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_sweep_quarantines_corrupt_lease() {
        let broker = connect_test_broker().await;
        let mut conn = broker.redis.clone();
        let keys = broker.keys(QueueName::ScrapeProject);
        let expired_ms = Utc::now().timestamp_millis() - 1_000;

        let bad_id = Uuid::new_v4().to_string();
        let mut fields = record();
        fields.insert(
            "payload".to_string(),
            r#"{"queue":"send-email","data":{}}"#.to_string(),
        );
        let fields: Vec<(String, String)> = fields.into_iter().collect();
        let _: () = conn
            .hset_multiple(broker.job_key(&bad_id), fields.as_slice())
            .await
            .expect("hset");
        let _: () = conn
            .zadd(&keys.leased, &bad_id, expired_ms - 1)
            .await
            .expect("zadd bad");

        let payload: JobPayload = ScrapeProjectJob::new("p1", vec![Source::Twitter]).into();
        let good_id = broker
            .enqueue(QueueName::ScrapeProject, payload, EnqueueOptions::default())
            .await
            .expect("enqueue");
        broker
            .lease(QueueName::ScrapeProject, Duration::from_secs(30), Duration::from_secs(1))
            .await
            .expect("lease")
            .expect("job");
        let _: () = conn
            .zadd(&keys.leased, good_id.to_string(), expired_ms)
            .await
            .expect("expire good lease");

        let reclaimed = broker
            .requeue_expired(QueueName::ScrapeProject)
            .await
            .expect("sweep survives a corrupt record");
        assert_eq!(reclaimed, 1);

        let job = broker.job(good_id).await.expect("lookup").expect("job");
        assert_eq!(job.attempt, 2);
        assert_eq!(job.status, JobStatus::Retrying);

        let corrupt: Vec<String> = conn.lrange(&keys.corrupt, 0, -1).await.expect("lrange");
        assert_eq!(corrupt, vec![bad_id]);
        let stats = broker.stats(QueueName::ScrapeProject).await.expect("stats");
        assert_eq!(stats.leased, 0);
    }
}
