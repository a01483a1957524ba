//! Batched Kahn's algorithm against a [`LayoutStore`].
//!
//! ## Waves
//!
//! The zero-in-degree frontier is processed in waves. `claim_frontier`
//! snapshots every node that is ready; the wave is drained in ascending id
//! order, `batch_size` nodes at a time; successors released while draining
//! join the next wave. Orders therefore depend only on the graph (wave
//! ascending, id ascending within a wave), never on the batch size.
//!
//! ## Residual cycles
//!
//! When no wave can be claimed but nodes remain unordered, they sit on or
//! behind a cycle. They are force-ordered by id, continuing the counter, and
//! reported through [`SortReport::forced_count`]. The run never fails for
//! this reason.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::LayoutError;
use crate::layering::progress::{LayoutStage, ProgressReporter};
use crate::memory::{MemoryBudget, ESTIMATED_BYTES_PER_NODE};
use crate::retry::RetryPolicy;
use crate::store::LayoutStore;
use crate::types::{NodeFilter, NodeId, RunId};

/// Outcome of one sort run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortReport {
    /// Nodes ordered (`0..node_count` were assigned).
    pub node_count: usize,
    /// Edges inside the run.
    pub link_count: usize,
    /// Nodes ordered by the cycle fallback.
    pub forced_count: usize,
    /// Kahn waves processed.
    pub waves: usize,
    /// Store batches written.
    pub batches: usize,
}

impl SortReport {
    /// True when no node needed the cycle fallback.
    pub fn is_acyclic(&self) -> bool {
        self.forced_count == 0
    }
}

/// Computes a total, contiguous topological order for a run.
pub struct TopologicalSorter<'a, S: LayoutStore> {
    store: &'a S,
    batch_size: usize,
    retry: RetryPolicy,
    budget: Option<&'a MemoryBudget>,
    progress: Option<&'a ProgressReporter>,
}

impl<'a, S: LayoutStore> TopologicalSorter<'a, S> {
    /// Create a sorter. A zero batch size is treated as 1.
    pub fn new(store: &'a S, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            retry: RetryPolicy::default(),
            budget: None,
            progress: None,
        }
    }

    /// Set the retry policy for store calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Shrink batches under memory pressure.
    pub fn with_budget(mut self, budget: &'a MemoryBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Publish progress.
    pub fn with_progress(mut self, progress: &'a ProgressReporter) -> Self {
        self.progress = Some(progress);
        self
    }

    fn next_batch_size(&self) -> usize {
        match self.budget {
            Some(budget) => budget.fit_batch(self.batch_size, ESTIMATED_BYTES_PER_NODE),
            None => self.batch_size,
        }
    }

    /// Assign `topo_order` to every node selected by `filter`.
    ///
    /// Fully re-initializes the run's scratch state first, so a failed or
    /// timed-out attempt can simply be repeated.
    pub async fn compute_order(&self, run: &RunId, filter: &NodeFilter) -> Result<SortReport, LayoutError> {
        let store = self.store;
        let counts = self
            .retry
            .run("begin_run", || store.begin_run(run, filter))
            .await?;
        if let Some(p) = self.progress {
            p.stage(LayoutStage::Ordering, counts.nodes);
        }

        let mut report = SortReport {
            node_count: 0,
            link_count: counts.links,
            ..SortReport::default()
        };
        let mut next_order: u64 = 0;

        loop {
            let claimed = self
                .retry
                .run("claim_frontier", || store.claim_frontier(run))
                .await?;
            if claimed == 0 {
                break;
            }
            report.waves += 1;
            debug!(run_id = %run, wave = report.waves, claimed, "Claimed frontier wave");

            loop {
                let limit = self.next_batch_size();
                let batch = self
                    .retry
                    .run("frontier_batch", || store.frontier_batch(run, limit))
                    .await?;
                if batch.is_empty() {
                    break;
                }
                next_order = self.commit_batch(run, &batch, next_order, true).await?;
                report.batches += 1;
                if let Some(p) = self.progress {
                    p.advance(next_order as usize);
                }
                tokio::task::yield_now().await;
            }
        }

        loop {
            let limit = self.next_batch_size();
            let residual = self
                .retry
                .run("unordered_batch", || store.unordered_batch(run, limit))
                .await?;
            if residual.is_empty() {
                break;
            }
            report.forced_count += residual.len();
            next_order = self.commit_batch(run, &residual, next_order, false).await?;
            report.batches += 1;
            tokio::task::yield_now().await;
        }

        report.node_count = next_order as usize;
        if report.forced_count > 0 {
            warn!(
                run_id = %run,
                forced_count = report.forced_count,
                "Residual cycles broken by id order"
            );
        }
        if report.node_count != counts.nodes {
            return Err(LayoutError::Internal(format!(
                "ordered {} nodes but run selected {}",
                report.node_count, counts.nodes
            )));
        }

        info!(
            run_id = %run,
            nodes = report.node_count,
            links = report.link_count,
            waves = report.waves,
            forced = report.forced_count,
            "Topological order computed"
        );
        Ok(report)
    }

    async fn commit_batch(
        &self,
        run: &RunId,
        batch: &[NodeId],
        first: u64,
        release: bool,
    ) -> Result<u64, LayoutError> {
        let store = self.store;
        let _reservation = self
            .budget
            .map(|b| b.reserve(batch.len() * ESTIMATED_BYTES_PER_NODE));

        let orders: Vec<(NodeId, u64)> = batch
            .iter()
            .zip(first..)
            .map(|(id, order)| (id.clone(), order))
            .collect();
        self.retry
            .run("assign_orders", || store.assign_orders(run, &orders))
            .await?;
        if release {
            self.retry
                .run("release_successors", || store.release_successors(run, batch))
                .await?;
        }
        Ok(first + batch.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLayoutStore;
    use crate::types::{Edge, GraphNode};
    use std::time::Duration;

    fn order_of(store: &InMemoryLayoutStore, run: &RunId, id: &str) -> u64 {
        store.run_order(run, &NodeId::from(id)).unwrap()
    }

    fn diamond() -> InMemoryLayoutStore {
        InMemoryLayoutStore::from_parts(
            ["A", "B", "C", "D"].map(GraphNode::new),
            [
                Edge::new("A", "B"),
                Edge::new("A", "C"),
                Edge::new("B", "D"),
                Edge::new("C", "D"),
            ],
        )
    }

    #[tokio::test]
    async fn test_diamond_order() {
        let store = diamond();
        let run = RunId::new();
        let report = TopologicalSorter::new(&store, 1000)
            .compute_order(&run, &NodeFilter::all())
            .await
            .unwrap();

        assert_eq!(report.node_count, 4);
        assert_eq!(report.link_count, 4);
        assert_eq!(report.waves, 3);
        assert!(report.is_acyclic());
        assert_eq!(order_of(&store, &run, "A"), 0);
        assert_eq!(order_of(&store, &run, "B"), 1);
        assert_eq!(order_of(&store, &run, "C"), 2);
        assert_eq!(order_of(&store, &run, "D"), 3);
    }

    #[tokio::test]
    async fn test_batch_size_does_not_change_order() {
        // "a" releases "z" before the roots "b" and "r1" are drained
        let nodes = ["a", "b", "r1", "z", "y"].map(GraphNode::new);
        let edges = [Edge::new("a", "z"), Edge::new("r1", "y")];

        let small = InMemoryLayoutStore::from_parts(nodes.clone(), edges.clone());
        let large = InMemoryLayoutStore::from_parts(nodes, edges);
        let run = RunId::new();

        TopologicalSorter::new(&small, 1)
            .compute_order(&run, &NodeFilter::all())
            .await
            .unwrap();
        TopologicalSorter::new(&large, 10_000)
            .compute_order(&run, &NodeFilter::all())
            .await
            .unwrap();

        for id in ["a", "b", "r1", "z", "y"] {
            assert_eq!(order_of(&small, &run, id), order_of(&large, &run, id), "{id}");
        }
        // Roots first, released nodes in the next wave
        assert_eq!(order_of(&small, &run, "r1"), 2);
        assert_eq!(order_of(&small, &run, "y"), 3);
        assert_eq!(order_of(&small, &run, "z"), 4);
    }

    #[tokio::test]
    async fn test_cycle_is_force_broken() {
        let store = InMemoryLayoutStore::from_parts(
            ["A", "B", "C"].map(GraphNode::new),
            [Edge::new("A", "B"), Edge::new("B", "C"), Edge::new("C", "A")],
        );
        let run = RunId::new();
        let report = TopologicalSorter::new(&store, 2)
            .compute_order(&run, &NodeFilter::all())
            .await
            .unwrap();

        assert_eq!(report.forced_count, 3);
        assert!(!report.is_acyclic());
        let mut orders: Vec<u64> = ["A", "B", "C"]
            .iter()
            .map(|id| order_of(&store, &run, id))
            .collect();
        orders.sort();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let store = diamond();
        let run = RunId::new();
        let sorter = TopologicalSorter::new(&store, 1);
        sorter.compute_order(&run, &NodeFilter::all()).await.unwrap();
        let first: Vec<u64> = ["A", "B", "C", "D"].iter().map(|id| order_of(&store, &run, id)).collect();

        sorter.compute_order(&run, &NodeFilter::all()).await.unwrap();
        let second: Vec<u64> = ["A", "B", "C", "D"].iter().map(|id| order_of(&store, &run, id)).collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = diamond();
        store.inject_failures(2, true);
        let retry = RetryPolicy::new(
            crate::retry::RetryConfig::default().with_initial_delay(Duration::from_millis(1)),
        );
        let report = TopologicalSorter::new(&store, 1000)
            .with_retry(retry)
            .compute_order(&RunId::new(), &NodeFilter::all())
            .await
            .unwrap();
        assert_eq!(report.node_count, 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_aborts() {
        let store = diamond();
        store.inject_failures(1, false);
        let err = TopologicalSorter::new(&store, 1000)
            .compute_order(&RunId::new(), &NodeFilter::all())
            .await
            .unwrap_err();
        assert!(matches!(err, LayoutError::Store(_)));
    }

    #[tokio::test]
    async fn test_memory_pressure_shrinks_batches() {
        let store = diamond();
        let budget = MemoryBudget::new(ESTIMATED_BYTES_PER_NODE);
        let report = TopologicalSorter::new(&store, 1000)
            .with_budget(&budget)
            .compute_order(&RunId::new(), &NodeFilter::all())
            .await
            .unwrap();
        // One node per batch
        assert_eq!(report.batches, 4);
        assert_eq!(budget.in_use(), 0);
    }
}
