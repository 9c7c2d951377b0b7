//! Static stage graph.
//!
//! Stages are identified by the queue they consume. An edge `a → b` means a
//! successful `a` handler may enqueue jobs on `b`. The graph is built once at
//! start-up and must stay acyclic.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::scheduler::QueueName;

/// Errors raised while building or consulting the stage graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Stage {0} is already registered")]
    DuplicateStage(QueueName),

    #[error("Stage {0} is not part of the pipeline")]
    UnknownStage(QueueName),

    /// Adding the edge would create a cycle; the path closes the loop.
    #[error("Edge would create a cycle: {}", format_path(.0))]
    Cycle(Vec<QueueName>),

    #[error("Stage {from} may not enqueue on {to}")]
    EdgeNotAllowed { from: QueueName, to: QueueName },
}

fn format_path(path: &[QueueName]) -> String {
    path.iter()
        .map(QueueName::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Directed acyclic graph of pipeline stages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageGraph {
    edges: BTreeMap<QueueName, BTreeSet<QueueName>>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// `scrape-project → generate-posts`.
    pub fn standard() -> Self {
        let mut graph = Self::new();
        graph.edges.insert(
            QueueName::ScrapeProject,
            BTreeSet::from([QueueName::GeneratePosts]),
        );
        graph.edges.insert(QueueName::GeneratePosts, BTreeSet::new());
        graph
    }

    pub fn add_stage(&mut self, stage: QueueName) -> Result<(), GraphError> {
        if self.edges.contains_key(&stage) {
            return Err(GraphError::DuplicateStage(stage));
        }
        self.edges.insert(stage, BTreeSet::new());
        Ok(())
    }

    /// Adds `from → to`. Both stages must exist and the edge must not close a
    /// cycle (self-loops included).
    pub fn add_edge(&mut self, from: QueueName, to: QueueName) -> Result<(), GraphError> {
        for stage in [from, to] {
            if !self.contains(stage) {
                return Err(GraphError::UnknownStage(stage));
            }
        }

        if let Some(mut path) = self.path(to, from) {
            path.push(to);
            return Err(GraphError::Cycle(path));
        }

        self.edges.entry(from).or_default().insert(to);
        Ok(())
    }

    pub fn contains(&self, stage: QueueName) -> bool {
        self.edges.contains_key(&stage)
    }

    pub fn stages(&self) -> impl Iterator<Item = QueueName> + '_ {
        self.edges.keys().copied()
    }

    /// Queues `stage` may enqueue on.
    pub fn downstream(&self, stage: QueueName) -> impl Iterator<Item = QueueName> + '_ {
        self.edges
            .get(&stage)
            .into_iter()
            .flat_map(|targets| targets.iter().copied())
    }

    pub fn upstream(&self, stage: QueueName) -> Vec<QueueName> {
        self.edges
            .iter()
            .filter(|(_, targets)| targets.contains(&stage))
            .map(|(source, _)| *source)
            .collect()
    }

    /// Fails unless `from → to` is an edge.
    pub fn check_edge(&self, from: QueueName, to: QueueName) -> Result<(), GraphError> {
        let allowed = self
            .edges
            .get(&from)
            .is_some_and(|targets| targets.contains(&to));
        if allowed {
            Ok(())
        } else {
            Err(GraphError::EdgeNotAllowed { from, to })
        }
    }

    /// Stages ordered so every stage comes after all of its upstreams.
    pub fn topological_order(&self) -> Vec<QueueName> {
        let mut in_degree: BTreeMap<QueueName, usize> =
            self.edges.keys().map(|stage| (*stage, 0)).collect();
        for targets in self.edges.values() {
            for target in targets {
                *in_degree.entry(*target).or_default() += 1;
            }
        }

        let mut ready: Vec<QueueName> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(stage, _)| *stage)
            .collect();
        let mut order = Vec::with_capacity(in_degree.len());

        while let Some(stage) = ready.pop() {
            order.push(stage);
            for target in self.downstream(stage) {
                if let Some(degree) = in_degree.get_mut(&target) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(target);
                    }
                }
            }
        }
        order
    }

    /// Depth-first search for a path `from ⇝ to`, inclusive of both ends.
    fn path(&self, from: QueueName, to: QueueName) -> Option<Vec<QueueName>> {
        if from == to {
            return Some(vec![from]);
        }
        let mut visited = BTreeSet::new();
        let mut stack = vec![(from, vec![from])];
        while let Some((stage, path)) = stack.pop() {
            if !visited.insert(stage) {
                continue;
            }
            for next in self.downstream(stage) {
                let mut next_path = path.clone();
                next_path.push(next);
                if next == to {
                    return Some(next_path);
                }
                stack.push((next, next_path));
            }
        }
        None
    }
}
