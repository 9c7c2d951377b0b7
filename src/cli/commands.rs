//! CLI command definitions for bead-pipeline.
//!
//! `run` starts the worker pools; the other commands are one-shot operator
//! tools against the same Redis broker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::events::{handler_fn, Event, EventBus, RedisEventRelay, Topic};
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::pipeline::{HttpCollaborator, PipelineSupervisor, ScrapeRequestTrigger};
use crate::scheduler::{
    Broker, EnqueueOptions, GeneratePostsJob, InMemoryBroker, JobPayload, QueueName, QueueStats,
    RedisBroker, ScrapeProjectJob, SharedBroker, Source,
};

/// How often `run` samples queue depth into the metrics registry.
const DEPTH_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

/// Durable scrape → post generation job pipeline.
#[derive(Parser)]
#[command(name = "bead-pipeline")]
#[command(about = "Run and operate the bead scrape/post-generation job pipeline")]
#[command(version)]
#[command(
    long_about = "bead-pipeline runs worker pools that scrape projects and generate posts from durable Redis queues.\n\nExample usage:\n  bead-pipeline run\n  bead-pipeline enqueue scrape my-project --sources twitter,farcaster\n  bead-pipeline dead-letters scrape-project --limit 10"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL (overrides REDIS_HOST / REDIS_PORT).
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start one worker pool per stage and process jobs until interrupted.
    Run(RunArgs),

    /// Enqueue a job directly, bypassing events.
    Enqueue(EnqueueArgs),

    /// Publish an event to every connected pipeline process.
    Publish(PublishArgs),

    /// Show queue depth per state.
    Stats(StatsArgs),

    /// List dead-lettered jobs, newest first.
    DeadLetters(DeadLettersArgs),

    /// Put a dead-lettered job back on its queue with a fresh attempt budget.
    Requeue(RequeueArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BrokerKind {
    /// Durable broker on Redis.
    Redis,
    /// In-process broker; jobs are lost on exit.
    Memory,
}

/// Arguments for `bead-pipeline run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Broker backend.
    #[arg(long, value_enum, default_value = "redis")]
    pub broker: BrokerKind,

    /// Concurrent scrape handlers (overrides SCRAPE_CONCURRENCY).
    #[arg(long)]
    pub scrape_concurrency: Option<usize>,

    /// Concurrent post generation handlers (overrides POSTGEN_CONCURRENCY).
    #[arg(long)]
    pub postgen_concurrency: Option<usize>,

    /// Shutdown grace period in seconds (overrides SHUTDOWN_GRACE_SECS).
    #[arg(long)]
    pub shutdown_grace: Option<u64>,

    /// Do not relay events to other processes.
    #[arg(long)]
    pub no_relay: bool,
}

/// Arguments for `bead-pipeline enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    #[command(subcommand)]
    pub job: EnqueueJob,

    /// Explicit job id; enqueueing an existing id is a no-op.
    #[arg(long, global = true)]
    pub job_id: Option<Uuid>,

    /// Keep the job invisible for this many milliseconds.
    #[arg(long, global = true)]
    pub delay_ms: Option<u64>,

    /// Override the queue's attempt ceiling.
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,
}

#[derive(clap::Subcommand, Debug)]
pub enum EnqueueJob {
    /// Enqueue a `scrape-project` job.
    Scrape {
        /// Project to scrape.
        project: String,

        /// Comma-separated sources.
        #[arg(long, value_delimiter = ',', default_value = "twitter,farcaster")]
        sources: Vec<Source>,
    },

    /// Enqueue a `generate-posts` job.
    Posts {
        /// Project to generate posts for.
        project: String,

        /// Insight ids to build posts from (repeatable or comma-separated).
        #[arg(long = "insight", value_delimiter = ',')]
        insight_ids: Vec<String>,
    },
}

/// Arguments for `bead-pipeline publish`.
#[derive(Parser, Debug)]
pub struct PublishArgs {
    /// Topic (scrape.requested, insight.new, post.generated).
    pub topic: Topic,

    /// Event payload as JSON, e.g. '{"project":"p1","fid":3}'.
    pub payload: String,
}

/// Arguments for `bead-pipeline stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Only this queue.
    #[arg(long)]
    pub queue: Option<QueueName>,

    /// Output JSON.
    #[arg(short = 'j', long, conflicts_with = "prometheus")]
    pub json: bool,

    /// Output Prometheus text format (for a textfile collector).
    #[arg(long)]
    pub prometheus: bool,
}

/// Arguments for `bead-pipeline dead-letters`.
#[derive(Parser, Debug)]
pub struct DeadLettersArgs {
    /// Queue to inspect.
    pub queue: QueueName,

    /// Maximum number of jobs to list.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `bead-pipeline requeue`.
#[derive(Parser, Debug)]
pub struct RequeueArgs {
    /// Id of the dead-lettered job.
    pub job_id: Uuid,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = PipelineConfig::from_env().context("Invalid configuration")?;
    if let Some(url) = cli.redis_url {
        config = config.with_redis_url(url);
    }

    match cli.command {
        Commands::Run(args) => run_pipeline(config, args).await,
        Commands::Enqueue(args) => run_enqueue_command(config, args).await,
        Commands::Publish(args) => run_publish_command(config, args).await,
        Commands::Stats(args) => run_stats_command(config, args).await,
        Commands::DeadLetters(args) => run_dead_letters_command(config, args).await,
        Commands::Requeue(args) => run_requeue_command(config, args).await,
    }
}

// ============================================================================
// Run Command Implementation
// ============================================================================

async fn run_pipeline(mut config: PipelineConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(n) = args.scrape_concurrency {
        config = config.with_concurrency(QueueName::ScrapeProject, n);
    }
    if let Some(n) = args.postgen_concurrency {
        config = config.with_concurrency(QueueName::GeneratePosts, n);
    }
    if let Some(secs) = args.shutdown_grace {
        config = config.with_shutdown_grace(Duration::from_secs(secs));
    }
    config.validate().context("Invalid configuration")?;

    init_metrics().context("Failed to register metrics")?;

    let broker: SharedBroker = match args.broker {
        BrokerKind::Redis => Arc::new(connect_broker(&config).await?),
        BrokerKind::Memory => {
            warn!("Using the in-memory broker; queued jobs are lost on exit");
            Arc::new(InMemoryBroker::new(config.broker_settings()))
        }
    };
    broker.ping().await.context("Broker health check failed")?;

    let bus = Arc::new(EventBus::new());
    let (shutdown_tx, _) = broadcast::channel(1);

    let mut background: Vec<JoinHandle<()>> = Vec::new();
    if config.relay_events && !args.no_relay && args.broker == BrokerKind::Redis {
        let relay = Arc::new(
            RedisEventRelay::connect(&config.redis_url, &config.key_prefix)
                .await
                .context("Failed to connect event relay")?,
        );
        bus.set_sink(relay.clone());
        background.push(relay.spawn_listener(Arc::clone(&bus), shutdown_tx.subscribe()));
    }

    Arc::new(ScrapeRequestTrigger::new(Arc::clone(&broker))).register(&bus);
    bus.subscribe(
        Topic::PostGenerated,
        "post-log",
        handler_fn(|event: Event| async move {
            if let Event::PostGenerated(generated) = &event {
                info!(project_id = %generated.project, count = generated.count, "Posts ready");
            }
            Ok::<(), anyhow::Error>(())
        }),
    );

    let http = Arc::new(HttpCollaborator::new(&config.scraper_url, &config.postgen_url)?);
    let mut supervisor = PipelineSupervisor::standard(
        &config,
        Arc::clone(&broker),
        Arc::clone(&bus),
        http.clone(),
        http,
    )?;
    supervisor.start().await?;
    background.push(spawn_depth_sampler(
        Arc::clone(&broker),
        shutdown_tx.subscribe(),
    ));

    info!(
        scrape_concurrency = config.scrape_concurrency,
        postgen_concurrency = config.postgen_concurrency,
        "Pipeline running, press Ctrl+C to stop"
    );
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(());
    for handle in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task panicked");
        }
    }

    let result = supervisor.shutdown().await;
    let stats = supervisor.stats();
    for pool in &stats.pools {
        info!(
            queue = %pool.queue,
            completed = pool.jobs_completed,
            retried = pool.jobs_retried,
            dead_lettered = pool.jobs_failed,
            peak_active = pool.peak_active_workers,
            avg_duration_ms = pool.average_job_duration.as_millis() as u64,
            "Stage summary"
        );
    }
    result.map_err(Into::into)
}

/// Waits for Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn spawn_depth_sampler(
    broker: SharedBroker,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let metrics = MetricsCollector::new();
    tokio::spawn(async move {
        loop {
            for queue in QueueName::ALL {
                match broker.stats(queue).await {
                    Ok(stats) => metrics.record_queue_stats(&stats),
                    Err(e) => debug!(queue = %queue, error = %e, "Queue depth sample failed"),
                }
            }
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(DEPTH_SAMPLE_INTERVAL) => {}
            }
        }
    })
}

async fn connect_broker(config: &PipelineConfig) -> anyhow::Result<RedisBroker> {
    RedisBroker::connect(
        &config.redis_url,
        &config.key_prefix,
        config.broker_settings(),
        config.poll_interval,
    )
    .await
    .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))
}

// ============================================================================
// Operator Commands
// ============================================================================

async fn run_enqueue_command(config: PipelineConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    let payload = enqueue_payload(args.job);
    let options = enqueue_options(args.job_id, args.delay_ms, args.max_attempts);
    let queue = payload.queue();

    let broker = connect_broker(&config).await?;
    let job_id = broker.enqueue(queue, payload, options).await?;

    println!("✓ Enqueued job {} on {}", job_id, queue);
    Ok(())
}

fn enqueue_payload(job: EnqueueJob) -> JobPayload {
    match job {
        EnqueueJob::Scrape { project, sources } => ScrapeProjectJob::new(project, sources).into(),
        EnqueueJob::Posts {
            project,
            insight_ids,
        } => GeneratePostsJob::new(project, insight_ids).into(),
    }
}

fn enqueue_options(
    job_id: Option<Uuid>,
    delay_ms: Option<u64>,
    max_attempts: Option<u32>,
) -> EnqueueOptions {
    let mut options = EnqueueOptions::new();
    if let Some(id) = job_id {
        options = options.with_job_id(id);
    }
    if let Some(ms) = delay_ms {
        options = options.with_delay(Duration::from_millis(ms));
    }
    if let Some(attempts) = max_attempts {
        options = options.with_max_attempts(attempts);
    }
    options
}

async fn run_publish_command(config: PipelineConfig, args: PublishArgs) -> anyhow::Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("Payload is not valid JSON")?;
    let event = Event::from_parts(args.topic, payload)?;

    let relay = RedisEventRelay::connect(&config.redis_url, &config.key_prefix)
        .await
        .context("Failed to connect event relay")?;
    let bus = EventBus::new();
    bus.set_sink(Arc::new(relay));

    let report = bus.publish(event).await;
    if !report.forwarded {
        return Err(anyhow::anyhow!("Event was not forwarded to Redis"));
    }
    println!("✓ Published {}", args.topic);
    Ok(())
}

async fn run_stats_command(config: PipelineConfig, args: StatsArgs) -> anyhow::Result<()> {
    let broker = connect_broker(&config).await?;
    let queues: Vec<QueueName> = match args.queue {
        Some(queue) => vec![queue],
        None => QueueName::ALL.to_vec(),
    };

    let mut all_stats = Vec::with_capacity(queues.len());
    for queue in queues {
        all_stats.push(broker.stats(queue).await?);
    }

    if args.prometheus {
        init_metrics().context("Failed to register metrics")?;
        let metrics = MetricsCollector::new();
        for stats in &all_stats {
            metrics.record_queue_stats(stats);
        }
        print!("{}", export_metrics());
    } else if args.json {
        let output: Vec<serde_json::Value> = all_stats.iter().map(stats_json).collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("\n=== Queue Stats ===");
        for stats in &all_stats {
            println!(
                "  {:<16} pending={} delayed={} leased={} completed={} failed={}",
                stats.queue,
                stats.pending,
                stats.delayed,
                stats.leased,
                stats.completed,
                stats.failed
            );
        }
    }
    Ok(())
}

fn stats_json(stats: &QueueStats) -> serde_json::Value {
    serde_json::json!({
        "queue": stats.queue,
        "pending": stats.pending,
        "delayed": stats.delayed,
        "leased": stats.leased,
        "completed": stats.completed,
        "failed": stats.failed,
    })
}

async fn run_dead_letters_command(
    config: PipelineConfig,
    args: DeadLettersArgs,
) -> anyhow::Result<()> {
    let broker = connect_broker(&config).await?;
    let jobs = broker.dead_letters(args.queue, args.limit).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No dead-lettered jobs on {}", args.queue);
        return Ok(());
    }
    println!("\n=== Dead Letters: {} ===", args.queue);
    for job in &jobs {
        println!(
            "  {} project={} attempts={} enqueued={}",
            job.id,
            job.payload.project_id(),
            job.attempt,
            job.enqueued_at.to_rfc3339()
        );
        if let Some(err) = &job.last_error {
            println!("    error: {err}");
        }
    }
    Ok(())
}

async fn run_requeue_command(config: PipelineConfig, args: RequeueArgs) -> anyhow::Result<()> {
    let broker = connect_broker(&config).await?;
    if broker.requeue_failed(args.job_id).await? {
        println!("✓ Requeued job {}", args.job_id);
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Job {} is not dead-lettered",
            args.job_id
        ))
    }
}
