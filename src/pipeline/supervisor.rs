//! Pipeline supervisor: one worker pool per stage over a shared broker.
//!
//! The supervisor owns start-up and shutdown ordering. Pools start in reverse
//! topological order so every consumer is running before its producers. On
//! shutdown all pools drain concurrently and the broker is closed only after
//! the last one has stopped.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{error, info};

use crate::config::PipelineConfig;
use crate::events::EventBus;
use crate::scheduler::{PoolError, PoolStats, QueueName, SharedBroker, WorkerPool, WorkerPoolConfig};

use super::graph::{GraphError, StageGraph};
use super::stage::{StageHandler, StageRunner};
use super::stages::{InsightCollector, PostWriter, PostgenStage, ScrapeStage};

/// Errors raised while assembling or running the pipeline.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// The pool configuration names a different queue than the handler.
    #[error("Handler for {handler} given a pool for {pool}")]
    QueueMismatch { handler: QueueName, pool: QueueName },

    /// A stage in the graph has no handler.
    #[error("Stage {0} has no handler")]
    MissingStage(QueueName),
}

/// Aggregated statistics over every pool.
#[derive(Debug, Clone, Default)]
pub struct SupervisorStats {
    pub pools: Vec<PoolStats>,
}

impl SupervisorStats {
    pub fn total_completed(&self) -> u64 {
        self.pools.iter().map(|p| p.jobs_completed).sum()
    }

    pub fn total_dead_lettered(&self) -> u64 {
        self.pools.iter().map(|p| p.jobs_failed).sum()
    }

    pub fn for_queue(&self, queue: QueueName) -> Option<&PoolStats> {
        self.pools.iter().find(|p| p.queue == queue.as_str())
    }
}

/// Runs every stage of a [`StageGraph`].
pub struct PipelineSupervisor {
    broker: SharedBroker,
    bus: Arc<EventBus>,
    graph: Arc<StageGraph>,
    pools: BTreeMap<QueueName, WorkerPool>,
}

impl PipelineSupervisor {
    pub fn new(broker: SharedBroker, bus: Arc<EventBus>, graph: StageGraph) -> Self {
        Self {
            broker,
            bus,
            graph: Arc::new(graph),
            pools: BTreeMap::new(),
        }
    }

    /// The scrape → post generation pipeline with pool sizes from `config`.
    pub fn standard(
        config: &PipelineConfig,
        broker: SharedBroker,
        bus: Arc<EventBus>,
        collector: Arc<dyn InsightCollector>,
        writer: Arc<dyn PostWriter>,
    ) -> Result<Self, SupervisorError> {
        let mut supervisor = Self::new(broker, bus, StageGraph::standard());
        supervisor.add_stage(
            Arc::new(ScrapeStage::new(collector)),
            config.pool_config(QueueName::ScrapeProject),
        )?;
        supervisor.add_stage(
            Arc::new(PostgenStage::new(writer)),
            config.pool_config(QueueName::GeneratePosts),
        )?;
        Ok(supervisor)
    }

    /// Registers the handler and pool for one stage of the graph.
    pub fn add_stage(
        &mut self,
        handler: Arc<dyn StageHandler>,
        pool_config: WorkerPoolConfig,
    ) -> Result<(), SupervisorError> {
        let queue = handler.queue();
        if pool_config.queue != queue {
            return Err(SupervisorError::QueueMismatch {
                handler: queue,
                pool: pool_config.queue,
            });
        }
        if !self.graph.contains(queue) {
            return Err(GraphError::UnknownStage(queue).into());
        }
        if self.pools.contains_key(&queue) {
            return Err(GraphError::DuplicateStage(queue).into());
        }

        let runner = StageRunner::new(
            handler,
            Arc::clone(&self.broker),
            Arc::clone(&self.bus),
            Arc::clone(&self.graph),
        );
        let pool = WorkerPool::new(pool_config, Arc::clone(&self.broker), Arc::new(runner));
        self.pools.insert(queue, pool);
        Ok(())
    }

    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Starts every pool. If one fails to start, the ones already running are
    /// stopped again before the error is returned.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        let order: Vec<QueueName> = self.graph.topological_order().into_iter().rev().collect();
        if let Some(missing) = order.iter().find(|q| !self.pools.contains_key(*q)) {
            return Err(SupervisorError::MissingStage(*missing));
        }

        for queue in order {
            let Some(pool) = self.pools.get_mut(&queue) else {
                continue;
            };
            if let Err(e) = pool.start().await {
                error!(queue = %queue, error = %e, "Failed to start stage");
                let _ = self.stop_pools().await;
                return Err(e.into());
            }
        }

        info!(stages = self.pools.len(), "Pipeline started");
        Ok(())
    }

    /// Stops every pool, then closes the broker.
    ///
    /// Pools drain concurrently, each within its own grace period. The first
    /// pool error is returned after the broker has been closed.
    pub async fn shutdown(&mut self) -> Result<(), SupervisorError> {
        info!("Shutting down pipeline");
        let result = self.stop_pools().await;
        self.broker.close().await;
        info!("Pipeline stopped");
        result
    }

    async fn stop_pools(&mut self) -> Result<(), SupervisorError> {
        let results = join_all(
            self.pools
                .values_mut()
                .filter(|pool| pool.is_running())
                .map(|pool| pool.shutdown()),
        )
        .await;

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.pools.values().any(WorkerPool::is_running)
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            pools: self.pools.values().map(WorkerPool::stats).collect(),
        }
    }
}
