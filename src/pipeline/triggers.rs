//! Event handlers that start pipeline work.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::events::{Event, EventBus, EventHandler, SubscriptionId, Topic};
use crate::scheduler::{EnqueueOptions, QueueName, ScrapeProjectJob, SharedBroker, Source};

/// Turns `scrape.requested` into a `scrape-project` job over every source.
///
/// The event itself is fire-and-forget; once the job is enqueued the scrape
/// is durable and retried like any other job. The job id is the request id,
/// so when several processes relay the same request the broker keeps a
/// single job.
pub struct ScrapeRequestTrigger {
    broker: SharedBroker,
}

impl ScrapeRequestTrigger {
    pub fn new(broker: SharedBroker) -> Self {
        Self { broker }
    }

    /// Subscribes the trigger to `scrape.requested`.
    pub fn register(self: Arc<Self>, bus: &EventBus) -> SubscriptionId {
        bus.subscribe(Topic::ScrapeRequested, "scrape-request-trigger", self)
    }
}

#[async_trait]
impl EventHandler for ScrapeRequestTrigger {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let Event::ScrapeRequested(request) = event else {
            debug!(topic = %event.topic(), "Ignoring event");
            return Ok(());
        };

        let job = ScrapeProjectJob::new(request.project.clone(), Source::ALL.to_vec());
        let job_id = self
            .broker
            .enqueue(
                QueueName::ScrapeProject,
                job.into(),
                EnqueueOptions::default().with_job_id(request.request_id),
            )
            .await
            .with_context(|| format!("enqueue scrape for project {}", request.project))?;

        info!(
            job_id = %job_id,
            request_id = %request.request_id,
            project_id = %request.project,
            fid = request.fid,
            "Scrape requested"
        );
        Ok(())
    }
}
