//! Stage handlers and the runner that chains them.
//!
//! A [`StageHandler`] does the stage's work and reports a [`StageResult`].
//! The [`StageRunner`] turns that into downstream jobs and events, but only
//! once the handler has succeeded: a failed attempt, even one that called
//! [`StageContext::enqueue`] before failing, produces no downstream work.
//!
//! Downstream enqueues are not atomic with the upstream ack. A crash between
//! the two redelivers the upstream job and its downstream job is enqueued a
//! second time.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::HandlerError;
use crate::events::{Event, EventBus, InsightNew, PostGenerated};
use crate::scheduler::{
    EnqueueOptions, GeneratePostsJob, Job, JobId, JobPayload, JobProcessor, QueueName,
    SharedBroker,
};

use super::graph::StageGraph;

/// What a stage handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    /// Insights were collected and stored for a project.
    Scraped {
        project_id: String,
        insight_ids: Vec<String>,
        /// Raw records as reported by the collector, forwarded on `insight.new`.
        data: serde_json::Value,
    },
    /// Posts were generated and persisted.
    PostsGenerated { project_id: String, count: u64 },
}

impl StageResult {
    /// Jobs implied by this result on downstream stages.
    ///
    /// A scrape always yields exactly one `GeneratePosts` job carrying the ids
    /// it reported, even when that list is empty.
    pub fn downstream_jobs(&self) -> Vec<JobPayload> {
        match self {
            StageResult::Scraped {
                project_id,
                insight_ids,
                ..
            } => vec![GeneratePostsJob::new(project_id.clone(), insight_ids.clone()).into()],
            StageResult::PostsGenerated { .. } => Vec::new(),
        }
    }

    /// Notifications implied by this result.
    pub fn events(&self) -> Vec<Event> {
        match self {
            StageResult::Scraped {
                project_id, data, ..
            } => vec![Event::InsightNew(InsightNew {
                project: project_id.clone(),
                data: data.clone(),
            })],
            StageResult::PostsGenerated { project_id, count } => {
                vec![Event::PostGenerated(PostGenerated {
                    project: project_id.clone(),
                    count: *count,
                })]
            }
        }
    }
}

/// Per-delivery scratch space handed to a handler.
///
/// Extra jobs and events recorded here are released only after the handler
/// returns `Ok`.
#[derive(Debug)]
pub struct StageContext {
    queue: QueueName,
    job_id: JobId,
    attempt: u32,
    jobs: Vec<(JobPayload, EnqueueOptions)>,
    events: Vec<Event>,
}

impl StageContext {
    pub fn new(job: &Job) -> Self {
        Self {
            queue: job.queue,
            job_id: job.id,
            attempt: job.attempt,
            jobs: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Delivery attempt being processed, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Queues an additional downstream job (fan-out).
    pub fn enqueue(&mut self, payload: impl Into<JobPayload>) {
        self.enqueue_with(payload, EnqueueOptions::default());
    }

    pub fn enqueue_with(&mut self, payload: impl Into<JobPayload>, options: EnqueueOptions) {
        self.jobs.push((payload.into(), options));
    }

    /// Queues an additional event.
    pub fn publish(&mut self, event: Event) {
        self.events.push(event);
    }

    fn into_parts(self) -> (Vec<(JobPayload, EnqueueOptions)>, Vec<Event>) {
        (self.jobs, self.events)
    }
}

/// Business logic of one pipeline stage.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Queue this stage consumes.
    fn queue(&self) -> QueueName;

    async fn handle(&self, job: &Job, ctx: &mut StageContext) -> Result<StageResult, HandlerError>;
}

/// Runs a stage handler for the worker pool and releases its output.
pub struct StageRunner {
    handler: Arc<dyn StageHandler>,
    broker: SharedBroker,
    bus: Arc<EventBus>,
    graph: Arc<StageGraph>,
}

impl StageRunner {
    pub fn new(
        handler: Arc<dyn StageHandler>,
        broker: SharedBroker,
        bus: Arc<EventBus>,
        graph: Arc<StageGraph>,
    ) -> Self {
        Self {
            handler,
            broker,
            bus,
            graph,
        }
    }

    pub fn queue(&self) -> QueueName {
        self.handler.queue()
    }

    /// Enqueues every downstream job, checking all edges before the first
    /// enqueue so a misrouted job never leaves a partial fan-out behind.
    async fn release_jobs(
        &self,
        upstream: &Job,
        jobs: Vec<(JobPayload, EnqueueOptions)>,
    ) -> Result<(), HandlerError> {
        for (payload, _) in &jobs {
            self.graph
                .check_edge(upstream.queue, payload.queue())
                .map_err(|e| HandlerError::new(e.to_string()))?;
        }

        for (payload, options) in jobs {
            let queue = payload.queue();
            let downstream_id = self
                .broker
                .enqueue(queue, payload, options)
                .await
                .map_err(|e| {
                    HandlerError::downstream(format!("enqueue on {} failed: {}", queue, e))
                })?;
            info!(
                job_id = %upstream.id,
                downstream_job_id = %downstream_id,
                queue = %queue,
                "Enqueued downstream job"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl JobProcessor for StageRunner {
    async fn process(&self, job: &Job) -> Result<(), HandlerError> {
        let stage = self.handler.queue();
        if job.queue != stage || job.payload.queue() != stage {
            return Err(HandlerError::invalid_payload(format!(
                "job for {} delivered to stage {}",
                job.payload.queue(),
                stage
            )));
        }

        let mut ctx = StageContext::new(job);
        let result = self.handler.handle(job, &mut ctx).await?;
        let (extra_jobs, extra_events) = ctx.into_parts();

        let mut jobs: Vec<(JobPayload, EnqueueOptions)> = result
            .downstream_jobs()
            .into_iter()
            .map(|payload| (payload, EnqueueOptions::default()))
            .collect();
        jobs.extend(extra_jobs);
        self.release_jobs(job, jobs).await?;

        for event in result.events().into_iter().chain(extra_events) {
            let report = self.bus.publish(event).await;
            debug!(
                job_id = %job.id,
                delivered = report.delivered,
                failed = report.failed,
                "Published stage event"
            );
        }

        Ok(())
    }
}
