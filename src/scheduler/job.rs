//! Job definitions for the scheduler.
//!
//! This module defines the core job types used by the brokers and workers:
//!
//! - `Job`: A unit of work submitted to a named queue
//! - `JobPayload`: Closed, queue-tagged payload variants
//! - `JobStatus`: Delivery state of a job
//! - `EnqueueOptions`: Per-job overrides supplied at enqueue time

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::retry::{BackoffPolicy, RetryDecision, RetryPolicy};

/// Unique identifier for a job, assigned at enqueue time.
pub type JobId = Uuid;

/// Fixed identifiers of the pipeline queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    /// `scrape-project`: collect insights for a project.
    ScrapeProject,
    /// `generate-posts`: turn fresh insights into posts.
    GeneratePosts,
}

impl QueueName {
    /// Every queue, in pipeline order.
    pub const ALL: [QueueName; 2] = [QueueName::ScrapeProject, QueueName::GeneratePosts];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::ScrapeProject => "scrape-project",
            QueueName::GeneratePosts => "generate-posts",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "scrape-project" | "scrape" => Ok(QueueName::ScrapeProject),
            "generate-posts" | "postgen" => Ok(QueueName::GeneratePosts),
            other => Err(format!(
                "unknown queue '{}': expected scrape-project or generate-posts",
                other
            )),
        }
    }
}

/// Social source a project is scraped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Twitter,
    Farcaster,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Twitter, Source::Farcaster];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Twitter => "twitter",
            Source::Farcaster => "farcaster",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "twitter" => Ok(Source::Twitter),
            "farcaster" => Ok(Source::Farcaster),
            other => Err(format!("unknown source '{}'", other)),
        }
    }
}

/// Payload of a `scrape-project` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeProjectJob {
    pub project_id: String,
    pub sources: Vec<Source>,
}

impl ScrapeProjectJob {
    pub fn new(project_id: impl Into<String>, sources: Vec<Source>) -> Self {
        Self {
            project_id: project_id.into(),
            sources,
        }
    }
}

/// Payload of a `generate-posts` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratePostsJob {
    pub project_id: String,
    pub insight_ids: Vec<String>,
}

impl GeneratePostsJob {
    pub fn new(project_id: impl Into<String>, insight_ids: Vec<String>) -> Self {
        Self {
            project_id: project_id.into(),
            insight_ids,
        }
    }
}

/// Job payload, tagged by the queue it belongs to.
///
/// Serialized as `{"queue": "<queue-name>", "data": {...}}` so a payload read
/// back from the broker can be checked against the queue it was leased from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "queue", content = "data", rename_all = "kebab-case")]
pub enum JobPayload {
    ScrapeProject(ScrapeProjectJob),
    GeneratePosts(GeneratePostsJob),
}

impl JobPayload {
    /// The only queue this payload may be enqueued on.
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::ScrapeProject(_) => QueueName::ScrapeProject,
            JobPayload::GeneratePosts(_) => QueueName::GeneratePosts,
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            JobPayload::ScrapeProject(job) => &job.project_id,
            JobPayload::GeneratePosts(job) => &job.project_id,
        }
    }
}

impl From<ScrapeProjectJob> for JobPayload {
    fn from(job: ScrapeProjectJob) -> Self {
        JobPayload::ScrapeProject(job)
    }
}

impl From<GeneratePostsJob> for JobPayload {
    fn from(job: GeneratePostsJob) -> Self {
        JobPayload::GeneratePosts(job)
    }
}

/// Delivery state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be leased.
    Pending,
    /// Owned by exactly one worker until ack, nack or lease expiry.
    Leased,
    /// Acked. Terminal.
    Completed,
    /// Nacked, parked until its backoff elapses.
    Retrying,
    /// Attempts exhausted, dead-lettered. Terminal.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Leased => "leased",
            JobStatus::Completed => "completed",
            JobStatus::Retrying => "retrying",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "leased" => Ok(JobStatus::Leased),
            "completed" => Ok(JobStatus::Completed),
            "retrying" => Ok(JobStatus::Retrying),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Per-job overrides applied at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Caller-chosen id. Enqueueing an id that already exists is a no-op
    /// returning that id.
    pub job_id: Option<JobId>,
    /// Overrides the queue's attempt ceiling.
    pub max_attempts: Option<u32>,
    /// Overrides the queue's backoff policy.
    pub backoff: Option<BackoffPolicy>,
    /// Keeps the job invisible to `lease` for this long.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_id(mut self, id: JobId) -> Self {
        self.job_id = Some(id);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A unit of work submitted to a named queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, used for deduplication and tracing.
    pub id: JobId,
    /// Queue the job was enqueued on.
    pub queue: QueueName,
    /// Typed payload; always matches `queue`.
    pub payload: JobPayload,
    /// Delivery attempt number, starting at 1.
    pub attempt: u32,
    /// Attempt ceiling before dead-lettering.
    pub max_attempts: u32,
    /// Delay function applied after a failed attempt.
    pub backoff: BackoffPolicy,
    /// Current delivery state.
    pub status: JobStatus,
    /// When the job was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// When the current lease runs out, while leased.
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Error from the most recent failed attempt.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Job {
    /// Creates a pending job on the payload's queue with the given defaults.
    pub fn new(payload: JobPayload, defaults: &RetryPolicy) -> Self {
        Self::from_options(payload, &EnqueueOptions::default(), defaults)
    }

    /// Creates a pending job, letting `options` override `defaults`.
    pub fn from_options(
        payload: JobPayload,
        options: &EnqueueOptions,
        defaults: &RetryPolicy,
    ) -> Self {
        Self {
            id: options.job_id.unwrap_or_else(Uuid::new_v4),
            queue: payload.queue(),
            payload,
            attempt: 1,
            max_attempts: options.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            backoff: options.backoff.unwrap_or(defaults.backoff),
            status: JobStatus::Pending,
            enqueued_at: Utc::now(),
            lease_expires_at: None,
            last_error: None,
        }
    }

    /// What a failure of the current attempt leads to.
    pub fn retry_decision(&self) -> RetryDecision {
        RetryDecision::for_attempt(self.attempt, self.max_attempts, &self.backoff)
    }

    /// Deliveries left after the current one.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }
}
