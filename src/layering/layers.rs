//! Longest-path layer assignment.
//!
//! Nodes are streamed in ascending `topo_order`, one page at a time. For each
//! page the assigner fetches the page's incoming edges and the already
//! assigned layers of predecessors outside the page, then walks the page in
//! order: `layer(v) = max(0, max(layer(u) + 1))` over predecessors `u`.
//!
//! A predecessor without a layer yet comes later in the order, which only
//! happens for edges inside a force-broken cycle; such edges are skipped.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::LayoutError;
use crate::layering::progress::{LayoutStage, ProgressReporter};
use crate::memory::{MemoryBudget, ESTIMATED_BYTES_PER_NODE};
use crate::retry::RetryPolicy;
use crate::store::LayoutStore;
use crate::types::{NodeId, RunId};

/// Outcome of one layer assignment run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerReport {
    /// Nodes layered.
    pub node_count: usize,
    /// Deepest layer after capping. A pinned layer above the cap counts.
    pub max_layer: u32,
    /// Pinned nodes that kept their stored layer.
    pub pinned_kept: usize,
    /// Nodes whose layer was folded by `max_layers`.
    pub folded: usize,
    /// Edges skipped because the source was ordered after the target.
    pub back_edges: usize,
}

/// Derives `layer` from `topo_order` and edge structure.
pub struct LayerAssigner<'a, S: LayoutStore> {
    store: &'a S,
    batch_size: usize,
    max_layers: Option<u32>,
    retry: RetryPolicy,
    budget: Option<&'a MemoryBudget>,
    progress: Option<&'a ProgressReporter>,
}

impl<'a, S: LayoutStore> LayerAssigner<'a, S> {
    /// Create an assigner. A zero batch size is treated as 1.
    pub fn new(store: &'a S, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            max_layers: None,
            retry: RetryPolicy::default(),
            budget: None,
            progress: None,
        }
    }

    /// Cap the number of distinct layers. `Some(0)` is treated as unbounded.
    pub fn with_max_layers(mut self, max_layers: Option<u32>) -> Self {
        self.max_layers = max_layers.filter(|&m| m > 0);
        self
    }

    /// Set the retry policy for store calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Shrink pages under memory pressure.
    pub fn with_budget(mut self, budget: &'a MemoryBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Publish progress.
    pub fn with_progress(mut self, progress: &'a ProgressReporter) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Assign a layer to every ordered node of the run.
    ///
    /// Clears previously assigned layers first, so the stage is repeatable.
    pub async fn assign_layers(&self, run: &RunId, total: usize) -> Result<LayerReport, LayoutError> {
        let store = self.store;
        self.retry
            .run("reset_layers", || store.reset_layers(run))
            .await?;
        if let Some(p) = self.progress {
            p.stage(LayoutStage::Layering, total);
        }

        let cap = self.max_layers.map(|m| m - 1);
        let mut report = LayerReport::default();
        let mut after: Option<u64> = None;

        loop {
            let limit = match self.budget {
                Some(b) => b.fit_batch(self.batch_size, ESTIMATED_BYTES_PER_NODE * 2),
                None => self.batch_size,
            };
            let page = self
                .retry
                .run("ordered_page", || store.ordered_page(run, after, limit))
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.topo_order);
            let _reservation = self
                .budget
                .map(|b| b.reserve(page.len() * ESTIMATED_BYTES_PER_NODE * 2));

            let ids: Vec<NodeId> = page.iter().map(|n| n.id.clone()).collect();
            let edges = self
                .retry
                .run("incoming_edges", || store.incoming_edges(run, &ids))
                .await?;

            let in_page: BTreeSet<&NodeId> = ids.iter().collect();
            let outside: Vec<NodeId> = edges
                .iter()
                .map(|e| &e.source_id)
                .filter(|s| !in_page.contains(s))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .cloned()
                .collect();
            let mut known: HashMap<NodeId, u32> = if outside.is_empty() {
                HashMap::new()
            } else {
                self.retry
                    .run("layers_of", || store.layers_of(run, &outside))
                    .await?
                    .into_iter()
                    .collect()
            };

            let mut parents: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
            for edge in &edges {
                parents.entry(&edge.target_id).or_default().push(&edge.source_id);
            }

            let mut assigned = Vec::with_capacity(page.len());
            for node in &page {
                let mut layer = 0u32;
                for parent in parents.get(&node.id).map(Vec::as_slice).unwrap_or_default() {
                    match known.get(*parent) {
                        Some(&l) => layer = layer.max(l + 1),
                        None => report.back_edges += 1,
                    }
                }
                if let (Some(_), Some(stored)) = (node.pin, node.stored_layer) {
                    layer = stored;
                    report.pinned_kept += 1;
                } else if let Some(cap) = cap {
                    if layer > cap {
                        layer = cap;
                        report.folded += 1;
                    }
                }
                report.max_layer = report.max_layer.max(layer);
                known.insert(node.id.clone(), layer);
                assigned.push((node.id.clone(), layer));
            }

            self.retry
                .run("assign_layers", || store.assign_layers(run, &assigned))
                .await?;
            report.node_count += assigned.len();
            debug!(run_id = %run, page = assigned.len(), "Layered page");
            if let Some(p) = self.progress {
                p.advance(report.node_count);
            }
            tokio::task::yield_now().await;
        }

        info!(
            run_id = %run,
            nodes = report.node_count,
            max_layer = report.max_layer,
            folded = report.folded,
            back_edges = report.back_edges,
            "Layers assigned"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layering::topo_sort::TopologicalSorter;
    use crate::store::InMemoryLayoutStore;
    use crate::types::{Edge, GraphNode, NodeFilter, Pin};

    async fn layered(
        store: &InMemoryLayoutStore,
        batch_size: usize,
        max_layers: Option<u32>,
    ) -> (RunId, LayerReport, HashMap<String, u32>) {
        let run = RunId::new();
        let sort = TopologicalSorter::new(store, batch_size)
            .compute_order(&run, &NodeFilter::all())
            .await
            .unwrap();
        let report = LayerAssigner::new(store, batch_size)
            .with_max_layers(max_layers)
            .assign_layers(&run, sort.node_count)
            .await
            .unwrap();
        let page = store.layered_page(&run, None, usize::MAX).await.unwrap();
        let layers = page
            .into_iter()
            .map(|n| (n.id.as_str().to_string(), n.layer))
            .collect();
        (run, report, layers)
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
    async fn test_diamond_layers() {
        for batch_size in [1, 2, 1000] {
            let store = diamond();
            let (_, report, layers) = layered(&store, batch_size, None).await;
            assert_eq!(layers["A"], 0);
            assert_eq!(layers["B"], 1);
            assert_eq!(layers["C"], 1);
            assert_eq!(layers["D"], 2);
            assert_eq!(report.max_layer, 2);
            assert_eq!(report.back_edges, 0);
        }
    }

    #[tokio::test]
    async fn test_longest_path_wins() {
        // A -> D directly and through B -> C
        let store = InMemoryLayoutStore::from_parts(
            ["A", "B", "C", "D"].map(GraphNode::new),
            [
                Edge::new("A", "D"),
                Edge::new("A", "B"),
                Edge::new("B", "C"),
                Edge::new("C", "D"),
            ],
        );
        let (_, _, layers) = layered(&store, 1, None).await;
        assert_eq!(layers["D"], 3);
    }

    #[tokio::test]
    async fn test_max_layers_folds_into_last() {
        let store = InMemoryLayoutStore::from_parts(
            ["a", "b", "c", "d"].map(GraphNode::new),
            [Edge::new("a", "b"), Edge::new("b", "c"), Edge::new("c", "d")],
        );
        let (_, report, layers) = layered(&store, 1000, Some(2)).await;
        assert_eq!(layers["a"], 0);
        assert_eq!(layers["b"], 1);
        assert_eq!(layers["c"], 1);
        assert_eq!(layers["d"], 1);
        assert_eq!(report.folded, 2);
        assert_eq!(report.max_layer, 1);
    }

    #[tokio::test]
    async fn test_pinned_node_keeps_stored_layer() {
        let mut pinned = GraphNode::new("P").pinned(Pin::new(2, 7, 3));
        pinned.layer = Some(5);
        let store = InMemoryLayoutStore::from_parts(
            [GraphNode::new("A"), pinned, GraphNode::new("Q")],
            [Edge::new("A", "P"), Edge::new("P", "Q")],
        );
        let (_, report, layers) = layered(&store, 1000, None).await;
        assert_eq!(layers["P"], 5);
        // Neighbors are still placed relative to the anchor
        assert_eq!(layers["Q"], 6);
        assert_eq!(report.pinned_kept, 1);
    }

    #[tokio::test]
    async fn test_max_layers_does_not_move_pinned_node() {
        let mut pinned = GraphNode::new("P").pinned(Pin::new(2, 7, 3));
        pinned.layer = Some(5);
        let store = InMemoryLayoutStore::from_parts(
            [GraphNode::new("A"), pinned, GraphNode::new("Q")],
            [Edge::new("A", "P"), Edge::new("P", "Q")],
        );
        let (_, report, layers) = layered(&store, 1000, Some(2)).await;
        assert_eq!(layers["P"], 5);
        // Successors of the anchor still fold under the cap
        assert_eq!(layers["Q"], 1);
        assert_eq!(report.folded, 1);
        assert_eq!(report.max_layer, 5);
    }

    #[tokio::test]
    async fn test_cycle_back_edges_are_skipped() {
        let store = InMemoryLayoutStore::from_parts(
            ["A", "B", "C"].map(GraphNode::new),
            [Edge::new("A", "B"), Edge::new("B", "C"), Edge::new("C", "A")],
        );
        let (_, report, layers) = layered(&store, 1000, None).await;
        // Forced order A, B, C: C -> A points backwards
        assert_eq!(report.back_edges, 1);
        assert_eq!(layers["A"], 0);
        assert_eq!(layers["B"], 1);
        assert_eq!(layers["C"], 2);
    }
}
