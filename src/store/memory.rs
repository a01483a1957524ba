//! In-memory layout store for tests, benches and request-scoped RPC runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::error::Retryable;
use crate::types::{
    BlockPlacement, Edge, GraphNode, LayeredNode, NodeFilter, NodeId, OrderedNode, RunId,
};
use super::{LayoutStore, RunCounts};

/// Error type for in-memory store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InMemoryError {
    /// Run was never started or already ended.
    #[error("Run not found: {0}")]
    RunNotFound(RunId),
    /// Node not found.
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),
    /// Injected failure.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// Injected non-transient failure.
    #[error("Store rejected operation: {0}")]
    Rejected(String),
}

impl Retryable for InMemoryError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, Default)]
struct GraphData {
    nodes: BTreeMap<NodeId, GraphNode>,
    children: BTreeMap<NodeId, BTreeSet<NodeId>>,
    parents: BTreeMap<NodeId, BTreeSet<NodeId>>,
    edges: BTreeSet<Edge>,
    placements: BTreeMap<NodeId, BlockPlacement>,
}

/// Per-run scratch state. Never shared between runs.
#[derive(Debug, Default)]
struct RunScratch {
    members: BTreeSet<NodeId>,
    in_degree: BTreeMap<NodeId, u32>,
    /// Zero in-degree, unordered, not yet claimed.
    ready: BTreeSet<NodeId>,
    /// Claimed into the current wave, not yet ordered.
    pending: BTreeSet<NodeId>,
    orders: BTreeMap<NodeId, u64>,
    by_order: BTreeMap<u64, NodeId>,
    /// Sources whose successors were already released.
    released: BTreeSet<NodeId>,
    layers: BTreeMap<NodeId, u32>,
}

#[derive(Debug, Clone, Copy)]
struct InjectedFailures {
    skip: u32,
    remaining: u32,
    transient: bool,
}

/// In-memory layout store.
///
/// Uses BTreeMap/BTreeSet for deterministic iteration order. Interior
/// locking lets one instance be shared behind an `Arc` by several workers.
#[derive(Debug, Default)]
pub struct InMemoryLayoutStore {
    graph: RwLock<GraphData>,
    runs: RwLock<HashMap<RunId, RunScratch>>,
    failures: Mutex<Option<InjectedFailures>>,
}

impl InMemoryLayoutStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from nodes and edges.
    ///
    /// Edges are added without the acyclicity guard, as legacy data would be.
    pub fn from_parts(
        nodes: impl IntoIterator<Item = GraphNode>,
        edges: impl IntoIterator<Item = Edge>,
    ) -> Self {
        let store = Self::new();
        for node in nodes {
            store.add_node(node);
        }
        for edge in edges {
            store.add_edge(edge);
        }
        store
    }

    /// Add or replace a node.
    pub fn add_node(&self, node: GraphNode) {
        self.graph.write().nodes.insert(node.id.clone(), node);
    }

    /// Add an edge without consulting the acyclicity guard.
    pub fn add_edge(&self, edge: Edge) {
        let mut graph = self.graph.write();
        graph
            .children
            .entry(edge.source_id.clone())
            .or_default()
            .insert(edge.target_id.clone());
        graph
            .parents
            .entry(edge.target_id.clone())
            .or_default()
            .insert(edge.source_id.clone());
        graph.edges.insert(edge);
    }

    /// Fail the next `count` operations.
    pub fn inject_failures(&self, count: u32, transient: bool) {
        self.inject_failures_after(0, count, transient);
    }

    /// Let `skip` operations through, then fail the following `count`.
    pub fn inject_failures_after(&self, skip: u32, count: u32, transient: bool) {
        *self.failures.lock() = Some(InjectedFailures {
            skip,
            remaining: count,
            transient,
        });
    }

    /// Get a node.
    pub fn node(&self, id: &NodeId) -> Option<GraphNode> {
        self.graph.read().nodes.get(id).cloned()
    }

    /// Get the persisted placement of a node.
    pub fn placement(&self, id: &NodeId) -> Option<BlockPlacement> {
        self.graph.read().placements.get(id).cloned()
    }

    /// Get number of nodes.
    pub fn num_nodes(&self) -> usize {
        self.graph.read().nodes.len()
    }

    /// Get number of edges.
    pub fn num_edges(&self) -> usize {
        self.graph.read().edges.len()
    }

    /// Whether scratch state exists for a run.
    pub fn has_run(&self, run: &RunId) -> bool {
        self.runs.read().contains_key(run)
    }

    /// Provisional order of a node inside a run.
    pub fn run_order(&self, run: &RunId, id: &NodeId) -> Option<u64> {
        self.runs.read().get(run)?.orders.get(id).copied()
    }

    fn check_failure(&self) -> Result<(), InMemoryError> {
        let mut guard = self.failures.lock();
        if let Some(failures) = guard.as_mut() {
            if failures.skip > 0 {
                failures.skip -= 1;
                return Ok(());
            }
            if failures.remaining > 0 {
                failures.remaining -= 1;
                let transient = failures.transient;
                if failures.remaining == 0 {
                    *guard = None;
                }
                return Err(if transient {
                    InMemoryError::Unavailable("injected transient failure".to_string())
                } else {
                    InMemoryError::Rejected("injected failure".to_string())
                });
            }
        }
        Ok(())
    }

    fn with_run<T>(
        &self,
        run: &RunId,
        f: impl FnOnce(&RunScratch) -> T,
    ) -> Result<T, InMemoryError> {
        self.check_failure()?;
        let runs = self.runs.read();
        let scratch = runs.get(run).ok_or(InMemoryError::RunNotFound(*run))?;
        Ok(f(scratch))
    }

    fn with_run_mut<T>(
        &self,
        run: &RunId,
        f: impl FnOnce(&mut RunScratch) -> T,
    ) -> Result<T, InMemoryError> {
        self.check_failure()?;
        let mut runs = self.runs.write();
        let scratch = runs.get_mut(run).ok_or(InMemoryError::RunNotFound(*run))?;
        Ok(f(scratch))
    }
}

#[async_trait]
impl LayoutStore for InMemoryLayoutStore {
    type Error = InMemoryError;

    async fn begin_run(&self, run: &RunId, filter: &NodeFilter) -> Result<RunCounts, Self::Error> {
        self.check_failure()?;
        let graph = self.graph.read();

        let members: BTreeSet<NodeId> = graph
            .nodes
            .values()
            .filter(|n| filter.matches(n))
            .map(|n| n.id.clone())
            .collect();

        let mut scratch = RunScratch::default();
        for id in &members {
            let degree = graph
                .parents
                .get(id)
                .map(|ps| ps.iter().filter(|p| members.contains(*p)).count())
                .unwrap_or(0) as u32;
            if degree == 0 {
                scratch.ready.insert(id.clone());
            }
            scratch.in_degree.insert(id.clone(), degree);
        }

        let links = graph
            .edges
            .iter()
            .filter(|e| members.contains(&e.source_id) && members.contains(&e.target_id))
            .count();
        let counts = RunCounts {
            nodes: members.len(),
            links,
        };
        scratch.members = members;

        self.runs.write().insert(*run, scratch);
        Ok(counts)
    }

    async fn claim_frontier(&self, run: &RunId) -> Result<usize, Self::Error> {
        self.with_run_mut(run, |s| {
            let ready = std::mem::take(&mut s.ready);
            let claimed = ready.len();
            s.pending.extend(ready);
            claimed
        })
    }

    async fn frontier_batch(&self, run: &RunId, limit: usize) -> Result<Vec<NodeId>, Self::Error> {
        self.with_run(run, |s| s.pending.iter().take(limit).cloned().collect())
    }

    async fn assign_orders(&self, run: &RunId, orders: &[(NodeId, u64)]) -> Result<(), Self::Error> {
        self.with_run_mut(run, |s| {
            for (id, order) in orders {
                s.pending.remove(id);
                s.ready.remove(id);
                if let Some(previous) = s.orders.insert(id.clone(), *order) {
                    s.by_order.remove(&previous);
                }
                s.by_order.insert(*order, id.clone());
            }
        })
    }

    async fn release_successors(&self, run: &RunId, ids: &[NodeId]) -> Result<(), Self::Error> {
        let graph = self.graph.read();
        self.with_run_mut(run, |s| {
            for id in ids {
                if !s.released.insert(id.clone()) {
                    continue;
                }
                let Some(children) = graph.children.get(id) else {
                    continue;
                };
                for child in children {
                    if !s.members.contains(child) || s.orders.contains_key(child) {
                        continue;
                    }
                    if let Some(degree) = s.in_degree.get_mut(child) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 && !s.pending.contains(child) {
                            s.ready.insert(child.clone());
                        }
                    }
                }
            }
        })
    }

    async fn unordered_batch(&self, run: &RunId, limit: usize) -> Result<Vec<NodeId>, Self::Error> {
        self.with_run(run, |s| {
            s.members
                .iter()
                .filter(|id| !s.orders.contains_key(*id))
                .take(limit)
                .cloned()
                .collect()
        })
    }

    async fn ordered_page(
        &self,
        run: &RunId,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<OrderedNode>, Self::Error> {
        let graph = self.graph.read();
        self.with_run(run, |s| {
            let start = after.map(|a| a.saturating_add(1)).unwrap_or(0);
            s.by_order
                .range(start..)
                .take(limit)
                .map(|(order, id)| {
                    let node = graph.nodes.get(id);
                    OrderedNode {
                        id: id.clone(),
                        topo_order: *order,
                        pin: node.and_then(|n| n.pin),
                        stored_layer: node.and_then(|n| n.layer),
                    }
                })
                .collect()
        })
    }

    async fn incoming_edges(&self, run: &RunId, ids: &[NodeId]) -> Result<Vec<Edge>, Self::Error> {
        let graph = self.graph.read();
        self.with_run(run, |s| {
            let mut edges = Vec::new();
            for id in ids {
                let Some(parents) = graph.parents.get(id) else {
                    continue;
                };
                for parent in parents.iter().filter(|p| s.members.contains(*p)) {
                    edges.push(Edge::new(parent.clone(), id.clone()));
                }
            }
            edges.sort();
            edges
        })
    }

    async fn layers_of(&self, run: &RunId, ids: &[NodeId]) -> Result<Vec<(NodeId, u32)>, Self::Error> {
        self.with_run(run, |s| {
            ids.iter()
                .filter_map(|id| s.layers.get(id).map(|l| (id.clone(), *l)))
                .collect()
        })
    }

    async fn reset_layers(&self, run: &RunId) -> Result<(), Self::Error> {
        self.with_run_mut(run, |s| s.layers.clear())
    }

    async fn assign_layers(&self, run: &RunId, layers: &[(NodeId, u32)]) -> Result<(), Self::Error> {
        self.with_run_mut(run, |s| {
            for (id, layer) in layers {
                s.layers.insert(id.clone(), *layer);
            }
        })
    }

    async fn layered_page(
        &self,
        run: &RunId,
        after: Option<&NodeId>,
        limit: usize,
    ) -> Result<Vec<LayeredNode>, Self::Error> {
        let graph = self.graph.read();
        self.with_run(run, |s| {
            let range = match after {
                Some(a) => s
                    .members
                    .range::<NodeId, _>((std::ops::Bound::Excluded(a), std::ops::Bound::Unbounded)),
                None => s.members.range::<NodeId, _>(..),
            };
            range
                .take(limit)
                .map(|id| {
                    let linked = |adj: &BTreeMap<NodeId, BTreeSet<NodeId>>| {
                        adj.get(id)
                            .map(|xs| xs.iter().any(|x| s.members.contains(x)))
                            .unwrap_or(false)
                    };
                    let isolated = !linked(&graph.children) && !linked(&graph.parents);
                    LayeredNode {
                        id: id.clone(),
                        topo_order: s.orders.get(id).copied().unwrap_or_default(),
                        layer: s.layers.get(id).copied().unwrap_or_default(),
                        pin: graph.nodes.get(id).and_then(|n| n.pin),
                        isolated,
                        parents: Vec::new(),
                    }
                })
                .collect()
        })
    }

    async fn end_run(&self, run: &RunId) -> Result<(), Self::Error> {
        self.check_failure()?;
        self.runs.write().remove(run);
        Ok(())
    }

    async fn successors(&self, id: &NodeId) -> Result<Vec<NodeId>, Self::Error> {
        self.check_failure()?;
        Ok(self
            .graph
            .read()
            .children
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_edge(&self, edge: &Edge) -> Result<(), Self::Error> {
        self.check_failure()?;
        {
            let graph = self.graph.read();
            for id in [&edge.source_id, &edge.target_id] {
                if !graph.nodes.contains_key(id) {
                    return Err(InMemoryError::NodeNotFound(id.clone()));
                }
            }
        }
        self.add_edge(edge.clone());
        Ok(())
    }

    async fn persist_placements(&self, placements: &[BlockPlacement]) -> Result<(), Self::Error> {
        self.check_failure()?;
        let mut graph = self.graph.write();
        for placement in placements {
            let node = graph
                .nodes
                .get_mut(&placement.id)
                .ok_or_else(|| InMemoryError::NodeNotFound(placement.id.clone()))?;
            node.layer = Some(placement.layer);
            graph
                .placements
                .insert(placement.id.clone(), placement.clone());
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), Self::Error> {
        self.check_failure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> InMemoryLayoutStore {
        InMemoryLayoutStore::from_parts(
            ["a", "b", "c", "d"].map(GraphNode::new),
            [
                Edge::new("a", "b"),
                Edge::new("a", "c"),
                Edge::new("b", "d"),
                Edge::new("c", "d"),
            ],
        )
    }

    #[tokio::test]
    async fn test_begin_run_counts_and_frontier() {
        let store = diamond();
        let run = RunId::new();

        let counts = store.begin_run(&run, &NodeFilter::all()).await.unwrap();
        assert_eq!(counts, RunCounts { nodes: 4, links: 4 });

        assert_eq!(store.claim_frontier(&run).await.unwrap(), 1);
        let batch = store.frontier_batch(&run, 10).await.unwrap();
        assert_eq!(batch, vec![NodeId::from("a")]);
    }

    #[tokio::test]
    async fn test_release_moves_children_to_next_wave() {
        let store = diamond();
        let run = RunId::new();
        store.begin_run(&run, &NodeFilter::all()).await.unwrap();
        store.claim_frontier(&run).await.unwrap();

        store.assign_orders(&run, &[(NodeId::from("a"), 0)]).await.unwrap();
        store.release_successors(&run, &[NodeId::from("a")]).await.unwrap();

        // Released children wait for the next claim
        assert!(store.frontier_batch(&run, 10).await.unwrap().is_empty());
        assert_eq!(store.claim_frontier(&run).await.unwrap(), 2);
        let batch = store.frontier_batch(&run, 10).await.unwrap();
        assert_eq!(batch, vec![NodeId::from("b"), NodeId::from("c")]);
    }

    #[tokio::test]
    async fn test_repeated_release_decrements_once() {
        let store = diamond();
        let run = RunId::new();
        store.begin_run(&run, &NodeFilter::all()).await.unwrap();
        store.claim_frontier(&run).await.unwrap();
        store.assign_orders(&run, &[(NodeId::from("a"), 0)]).await.unwrap();
        store.release_successors(&run, &[NodeId::from("a")]).await.unwrap();
        assert_eq!(store.claim_frontier(&run).await.unwrap(), 2);

        let b = [NodeId::from("b")];
        store
            .assign_orders(&run, &[(NodeId::from("b"), 1), (NodeId::from("c"), 2)])
            .await
            .unwrap();
        // A retried call after a lost acknowledgement
        store.release_successors(&run, &b).await.unwrap();
        store.release_successors(&run, &b).await.unwrap();
        assert_eq!(store.claim_frontier(&run).await.unwrap(), 0);

        store.release_successors(&run, &[NodeId::from("c")]).await.unwrap();
        assert_eq!(store.claim_frontier(&run).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_filter_limits_run_members() {
        let store = InMemoryLayoutStore::from_parts(
            [
                GraphNode::new("a").with_label("Article"),
                GraphNode::new("b").with_label("Article"),
                GraphNode::new("p").with_label("Pattern"),
            ],
            [Edge::new("a", "b"), Edge::new("p", "a")],
        );
        let run = RunId::new();

        let counts = store
            .begin_run(&run, &NodeFilter::with_labels(["Article"]))
            .await
            .unwrap();
        assert_eq!(counts, RunCounts { nodes: 2, links: 1 });

        // The edge from the filtered-out node does not count toward in_degree
        assert_eq!(store.claim_frontier(&run).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_runs_are_isolated() {
        let store = diamond();
        let run1 = RunId::new();
        let run2 = RunId::new();
        store.begin_run(&run1, &NodeFilter::all()).await.unwrap();
        store.begin_run(&run2, &NodeFilter::all()).await.unwrap();

        store.assign_orders(&run1, &[(NodeId::from("a"), 0)]).await.unwrap();

        assert_eq!(store.run_order(&run1, &NodeId::from("a")), Some(0));
        assert_eq!(store.run_order(&run2, &NodeId::from("a")), None);

        store.end_run(&run1).await.unwrap();
        assert!(!store.has_run(&run1));
        assert!(store.has_run(&run2));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = diamond();
        store.inject_failures(2, true);

        let first = store.ping().await.unwrap_err();
        assert!(first.is_transient());
        assert!(store.ping().await.is_err());
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_insert_edge_requires_known_nodes() {
        let store = diamond();
        let err = store.insert_edge(&Edge::new("a", "zzz")).await.unwrap_err();
        assert!(matches!(err, InMemoryError::NodeNotFound(_)));
    }
}
