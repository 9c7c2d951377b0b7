//! End-to-end pipeline scenarios on the in-memory broker.
//!
//! Time-dependent scenarios run on a paused tokio clock, so backoff delays of
//! several seconds complete instantly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use bead_pipeline::config::PipelineConfig;
use bead_pipeline::events::{handler_fn, Event, EventBus, PostGenerated, ScrapeRequested, Topic};
use bead_pipeline::pipeline::{
    CollectedInsights, InsightCollector, PipelineSupervisor, PostWriter, ScrapeRequestTrigger,
    ScrapeStage, StageContext, StageGraph, StageHandler, StageResult, StageRunner,
};
use bead_pipeline::scheduler::{
    Broker, BrokerError, EnqueueOptions, FailureCause, GeneratePostsJob, InMemoryBroker, Job,
    JobId, JobPayload, JobProcessor, JobStatus, NackOutcome, QueueName, QueueStats,
    ScrapeProjectJob, Source, WorkerPool, WorkerPoolConfig,
};
use bead_pipeline::HandlerError;

// ============================================================================
// Test doubles
// ============================================================================

/// Wraps [`InMemoryBroker`] and records what the pipeline did with it.
#[derive(Default)]
struct RecordingBroker {
    inner: InMemoryBroker,
    acks: Mutex<HashMap<JobId, usize>>,
    enqueued: Mutex<Vec<(QueueName, Instant)>>,
    log: Mutex<Vec<String>>,
}

impl RecordingBroker {
    fn ack_count(&self, job_id: JobId) -> usize {
        self.acks.lock().expect("lock").get(&job_id).copied().unwrap_or(0)
    }

    fn enqueues_on(&self, queue: QueueName) -> Vec<Instant> {
        self.enqueued
            .lock()
            .expect("lock")
            .iter()
            .filter(|(q, _)| *q == queue)
            .map(|(_, at)| *at)
            .collect()
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobId, BrokerError> {
        let id = self.inner.enqueue(queue, payload, options).await?;
        self.enqueued.lock().expect("lock").push((queue, Instant::now()));
        Ok(id)
    }

    async fn lease(
        &self,
        queue: QueueName,
        lease_timeout: Duration,
        wait: Duration,
    ) -> Result<Option<Job>, BrokerError> {
        self.inner.lease(queue, lease_timeout, wait).await
    }

    async fn ack(&self, job_id: JobId, attempt: u32) -> Result<(), BrokerError> {
        self.inner.ack(job_id, attempt).await?;
        *self.acks.lock().expect("lock").entry(job_id).or_default() += 1;
        self.log.lock().expect("lock").push(format!("ack {}", job_id));
        Ok(())
    }

    async fn nack(
        &self,
        job_id: JobId,
        attempt: u32,
        cause: FailureCause,
    ) -> Result<NackOutcome, BrokerError> {
        self.inner.nack(job_id, attempt, cause).await
    }

    async fn requeue_expired(&self, queue: QueueName) -> Result<usize, BrokerError> {
        self.inner.requeue_expired(queue).await
    }

    async fn job(&self, job_id: JobId) -> Result<Option<Job>, BrokerError> {
        self.inner.job(job_id).await
    }

    async fn stats(&self, queue: QueueName) -> Result<QueueStats, BrokerError> {
        self.inner.stats(queue).await
    }

    async fn dead_letters(&self, queue: QueueName, limit: usize) -> Result<Vec<Job>, BrokerError> {
        self.inner.dead_letters(queue, limit).await
    }

    async fn requeue_failed(&self, job_id: JobId) -> Result<bool, BrokerError> {
        self.inner.requeue_failed(job_id).await
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.inner.ping().await
    }

    async fn close(&self) {
        self.log.lock().expect("lock").push("close".to_string());
        self.inner.close().await;
    }
}

/// Collector that fails its first `failures` calls.
struct FlakyCollector {
    failures: usize,
    insight_ids: Vec<String>,
    calls: Mutex<Vec<Instant>>,
}

impl FlakyCollector {
    fn new(failures: usize, insight_ids: &[&str]) -> Self {
        Self {
            failures,
            insight_ids: insight_ids.iter().map(|s| s.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<Instant> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl InsightCollector for FlakyCollector {
    async fn collect(
        &self,
        _project_id: &str,
        _sources: &[Source],
    ) -> anyhow::Result<CollectedInsights> {
        let call = {
            let mut calls = self.calls.lock().expect("lock");
            calls.push(Instant::now());
            calls.len()
        };
        if call <= self.failures {
            anyhow::bail!("twitter returned 503 on call {}", call);
        }
        Ok(CollectedInsights {
            insight_ids: self.insight_ids.clone(),
            data: serde_json::json!([]),
        })
    }
}

struct CountingWriter {
    calls: AtomicUsize,
}

#[async_trait]
impl PostWriter for CountingWriter {
    async fn generate(&self, _project_id: &str, insight_ids: &[String]) -> anyhow::Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(insight_ids.len() as u64)
    }
}

/// A scrape pool with no post generation pool behind it, so downstream jobs
/// stay pending where the test can inspect them.
fn scrape_pool(broker: Arc<RecordingBroker>, collector: Arc<FlakyCollector>) -> WorkerPool {
    let runner = StageRunner::new(
        Arc::new(ScrapeStage::new(collector)),
        broker.clone(),
        Arc::new(EventBus::new()),
        Arc::new(StageGraph::standard()),
    );
    WorkerPool::new(
        WorkerPoolConfig::new(QueueName::ScrapeProject, 1)
            .with_poll_interval(Duration::from_millis(50)),
        broker,
        Arc::new(runner),
    )
}

async fn enqueue_scrape(broker: &RecordingBroker, project: &str, sources: Vec<Source>) -> JobId {
    broker
        .enqueue(
            QueueName::ScrapeProject,
            ScrapeProjectJob::new(project, sources).into(),
            EnqueueOptions::default(),
        )
        .await
        .expect("enqueue")
}

/// Polls `done` every 50ms for up to `limit`.
async fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached within {:?}", limit);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_scrape_success_enqueues_one_postgen_job() {
    let broker = Arc::new(RecordingBroker::default());
    let collector = Arc::new(FlakyCollector::new(0, &["i1", "i2", "i3"]));
    let mut pool = scrape_pool(broker.clone(), collector);
    pool.start().await.expect("start");

    let job_id = enqueue_scrape(&broker, "p1", vec![Source::Twitter]).await;
    wait_until(Duration::from_secs(10), || pool.stats().jobs_completed == 1).await;
    pool.shutdown().await.expect("shutdown");

    assert_eq!(broker.enqueues_on(QueueName::GeneratePosts).len(), 1);
    let downstream = broker
        .lease(QueueName::GeneratePosts, Duration::from_secs(30), Duration::ZERO)
        .await
        .expect("lease")
        .expect("downstream job");
    assert_eq!(
        downstream.payload,
        JobPayload::from(GeneratePostsJob::new(
            "p1",
            vec!["i1".into(), "i2".into(), "i3".into()]
        ))
    );
    assert_eq!(downstream.attempt, 1);
    assert_eq!(broker.ack_count(job_id), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_success_enqueues_after_third_attempt() {
    let broker = Arc::new(RecordingBroker::default());
    let collector = Arc::new(FlakyCollector::new(2, &["i1"]));
    let mut pool = scrape_pool(broker.clone(), collector.clone());
    pool.start().await.expect("start");

    let job_id = enqueue_scrape(&broker, "p1", vec![Source::Twitter]).await;
    wait_until(Duration::from_secs(60), || pool.stats().jobs_completed == 1).await;
    pool.shutdown().await.expect("shutdown");

    let calls = collector.calls();
    assert_eq!(calls.len(), 3);
    // Exponential backoff from a 2s base: 2s after attempt 1, 4s after attempt 2.
    assert!(calls[1] - calls[0] >= Duration::from_millis(2000));
    assert!(calls[2] - calls[1] >= Duration::from_millis(4000));
    assert!(calls[2] - calls[0] >= Duration::from_millis(6000));

    let downstream = broker.enqueues_on(QueueName::GeneratePosts);
    assert_eq!(downstream.len(), 1);
    assert!(downstream[0] >= calls[2]);

    let stats = pool.stats();
    assert_eq!(stats.jobs_retried, 2);
    assert_eq!(stats.jobs_failed, 0);

    let job = broker.job(job_id).await.expect("job").expect("retained");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempt, 3);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_attempts_dead_letter() {
    let broker = Arc::new(RecordingBroker::default());
    let collector = Arc::new(FlakyCollector::new(usize::MAX, &[]));
    let mut pool = scrape_pool(broker.clone(), collector.clone());
    pool.start().await.expect("start");

    let job_id = enqueue_scrape(&broker, "p1", vec![Source::Twitter]).await;
    wait_until(Duration::from_secs(60), || pool.stats().jobs_failed == 1).await;

    // No further delivery once dead-lettered.
    tokio::time::sleep(Duration::from_secs(30)).await;
    pool.shutdown().await.expect("shutdown");
    assert_eq!(collector.calls().len(), 3);

    let job = broker.job(job_id).await.expect("job").expect("retained");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt, 3);
    assert!(job
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("twitter returned 503")));

    let dead = broker
        .dead_letters(QueueName::ScrapeProject, 10)
        .await
        .expect("dead letters");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, job_id);

    assert!(broker.enqueues_on(QueueName::GeneratePosts).is_empty());
    assert_eq!(broker.ack_count(job_id), 0);
}

struct SlowProcessor {
    active: AtomicUsize,
    peak: AtomicUsize,
    done: AtomicUsize,
}

#[async_trait]
impl JobProcessor for SlowProcessor {
    async fn process(&self, _job: &Job) -> Result<(), HandlerError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit_holds() {
    let broker = Arc::new(RecordingBroker::default());
    let processor = Arc::new(SlowProcessor {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        done: AtomicUsize::new(0),
    });
    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(QueueName::ScrapeProject, 2)
            .with_poll_interval(Duration::from_millis(20)),
        broker.clone(),
        processor.clone(),
    );

    for i in 0..5 {
        enqueue_scrape(&broker, &format!("p{}", i), vec![Source::Farcaster]).await;
    }
    pool.start().await.expect("start");

    wait_until(Duration::from_secs(10), || {
        assert!(processor.active.load(Ordering::SeqCst) <= 2);
        processor.done.load(Ordering::SeqCst) == 5
    })
    .await;
    pool.shutdown().await.expect("shutdown");

    assert_eq!(processor.peak.load(Ordering::SeqCst), 2);
    let stats = pool.stats();
    assert_eq!(stats.jobs_completed, 5);
    assert!(stats.peak_active_workers <= 2);
}

/// Post generation handler that blocks until the test opens the gate.
struct GatedPostgen {
    started: Arc<Notify>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

#[async_trait]
impl StageHandler for GatedPostgen {
    fn queue(&self) -> QueueName {
        QueueName::GeneratePosts
    }

    async fn handle(&self, job: &Job, _ctx: &mut StageContext) -> Result<StageResult, HandlerError> {
        let gate = self.gate.lock().expect("lock").take();
        self.started.notify_one();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(StageResult::PostsGenerated {
            project_id: job.payload.project_id().to_string(),
            count: 1,
        })
    }
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_handler() {
    let broker = Arc::new(RecordingBroker::default());
    let started = Arc::new(Notify::new());
    let (release, gate) = oneshot::channel();

    let mut graph = StageGraph::new();
    graph.add_stage(QueueName::GeneratePosts).expect("stage");
    let mut supervisor = PipelineSupervisor::new(broker.clone(), Arc::new(EventBus::new()), graph);
    supervisor
        .add_stage(
            Arc::new(GatedPostgen {
                started: started.clone(),
                gate: Mutex::new(Some(gate)),
            }),
            WorkerPoolConfig::new(QueueName::GeneratePosts, 1)
                .with_poll_interval(Duration::from_millis(20))
                .with_shutdown_timeout(Duration::from_secs(5)),
        )
        .expect("register");
    supervisor.start().await.expect("start");

    let job_id = broker
        .enqueue(
            QueueName::GeneratePosts,
            GeneratePostsJob::new("p1", vec!["i1".into()]).into(),
            EnqueueOptions::default(),
        )
        .await
        .expect("enqueue");
    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("handler started");

    let shutdown = tokio::spawn(async move {
        let result = supervisor.shutdown().await;
        (supervisor, result)
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!shutdown.is_finished(), "shutdown must wait for the handler");
    assert!(broker.log().is_empty(), "broker closed before the handler finished");

    release.send(()).expect("handler still waiting");
    let (supervisor, result) = shutdown.await.expect("shutdown task");
    result.expect("clean shutdown");

    assert_eq!(broker.log(), vec![format!("ack {}", job_id), "close".to_string()]);
    assert_eq!(broker.ack_count(job_id), 1);
    assert!(!supervisor.is_running());
    assert!(broker.ping().await.is_err());
}

#[tokio::test]
async fn test_publish_without_subscribers_is_a_no_op() {
    let broker = Arc::new(RecordingBroker::default());
    let bus = EventBus::new();
    Arc::new(ScrapeRequestTrigger::new(broker.clone())).register(&bus);

    let report = bus
        .publish(Event::PostGenerated(PostGenerated {
            project: "p1".to_string(),
            count: 2,
        }))
        .await;

    assert_eq!(report.attempted(), 0);
    assert!(!report.forwarded);
    assert!(broker.log().is_empty());
    for queue in QueueName::ALL {
        let stats = broker.stats(queue).await.expect("stats");
        assert_eq!(stats.total_jobs(), 0);
    }
}

// ============================================================================
// Full pipeline
// ============================================================================

#[tokio::test]
async fn test_scrape_request_flows_to_post_generated() {
    let broker = Arc::new(RecordingBroker::default());
    let bus = Arc::new(EventBus::new());
    let collector = Arc::new(FlakyCollector::new(0, &["i1", "i2"]));
    let writer = Arc::new(CountingWriter {
        calls: AtomicUsize::new(0),
    });

    let config = PipelineConfig {
        poll_interval: Duration::from_millis(20),
        ..PipelineConfig::default()
    };
    let mut supervisor =
        PipelineSupervisor::standard(&config, broker.clone(), bus.clone(), collector, writer.clone())
            .expect("standard pipeline");

    Arc::new(ScrapeRequestTrigger::new(broker.clone())).register(&bus);
    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    bus.subscribe(
        Topic::PostGenerated,
        "test",
        handler_fn(move |event: Event| {
            let tx = Arc::clone(&tx);
            async move {
                if let Some(tx) = tx.lock().expect("lock").take() {
                    let _ = tx.send(event);
                }
                Ok::<(), anyhow::Error>(())
            }
        }),
    );

    supervisor.start().await.expect("start");
    bus.publish(Event::ScrapeRequested(ScrapeRequested::new("p1", 7)))
        .await;

    let event = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("post.generated within 5s")
        .expect("sender kept");
    assert_eq!(
        event,
        Event::PostGenerated(PostGenerated {
            project: "p1".to_string(),
            count: 2,
        })
    );

    supervisor.shutdown().await.expect("shutdown");
    assert_eq!(writer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.enqueues_on(QueueName::ScrapeProject).len(), 1);
    assert_eq!(broker.enqueues_on(QueueName::GeneratePosts).len(), 1);
    assert_eq!(broker.log().last().map(String::as_str), Some("close"));

    let stats = supervisor.stats();
    assert_eq!(stats.total_completed(), 2);
    assert_eq!(stats.total_dead_lettered(), 0);
}
