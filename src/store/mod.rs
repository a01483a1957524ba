//! Graph storage backends.
//!
//! The engine reaches the graph only through [`LayoutStore`], a narrow
//! query/bulk-update contract. Nothing here assumes the node or edge set fits
//! in process memory: every read is paged or batched by the caller.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Retryable;
use crate::types::{
    BlockPlacement, Edge, LayeredNode, NodeFilter, NodeId, OrderedNode, RunId,
};

/// Size of a run's node set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Nodes selected by the run filter.
    pub nodes: usize,
    /// Edges with both endpoints in the node set.
    pub links: usize,
}

/// Trait for graph storage backends.
///
/// Implementations must guarantee deterministic ordering of results
/// (ascending `NodeId` unless a method says otherwise). Scratch state is
/// scoped to a [`RunId`]; two runs never observe each other's scratch.
#[async_trait]
pub trait LayoutStore: Send + Sync {
    /// Error type for store operations.
    type Error: std::error::Error + Retryable + Send + Sync + 'static;

    /// Select the run's node set and (re)initialize its scratch state:
    /// `in_degree` from the current incoming-edge count, no waves, no orders,
    /// no layers. Calling it again fully resets the run.
    async fn begin_run(&self, run: &RunId, filter: &NodeFilter) -> Result<RunCounts, Self::Error>;

    /// Claim every unordered, unclaimed node with `in_degree == 0` as the next
    /// frontier wave. Returns the number of nodes claimed.
    async fn claim_frontier(&self, run: &RunId) -> Result<usize, Self::Error>;

    /// Up to `limit` claimed nodes that have no order yet.
    async fn frontier_batch(&self, run: &RunId, limit: usize) -> Result<Vec<NodeId>, Self::Error>;

    /// Record topological orders.
    async fn assign_orders(&self, run: &RunId, orders: &[(NodeId, u64)]) -> Result<(), Self::Error>;

    /// Decrement `in_degree` of every unordered successor of `ids`. A source
    /// is released at most once per run, so repeating a call is harmless.
    async fn release_successors(&self, run: &RunId, ids: &[NodeId]) -> Result<(), Self::Error>;

    /// Up to `limit` nodes that still have no order.
    async fn unordered_batch(&self, run: &RunId, limit: usize) -> Result<Vec<NodeId>, Self::Error>;

    /// Up to `limit` ordered nodes with `topo_order > after`, ascending by order.
    async fn ordered_page(
        &self,
        run: &RunId,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<OrderedNode>, Self::Error>;

    /// Edges inside the run whose target is one of `ids`.
    async fn incoming_edges(&self, run: &RunId, ids: &[NodeId]) -> Result<Vec<Edge>, Self::Error>;

    /// Layers already assigned to any of `ids`; unassigned ids are omitted.
    async fn layers_of(&self, run: &RunId, ids: &[NodeId]) -> Result<Vec<(NodeId, u32)>, Self::Error>;

    /// Drop every layer assigned in this run.
    async fn reset_layers(&self, run: &RunId) -> Result<(), Self::Error>;

    /// Record layers.
    async fn assign_layers(&self, run: &RunId, layers: &[(NodeId, u32)]) -> Result<(), Self::Error>;

    /// Up to `limit` layered nodes with id greater than `after`, ascending by id.
    /// `parents` is left empty.
    async fn layered_page(
        &self,
        run: &RunId,
        after: Option<&NodeId>,
        limit: usize,
    ) -> Result<Vec<LayeredNode>, Self::Error>;

    /// Discard the run's scratch state.
    async fn end_run(&self, run: &RunId) -> Result<(), Self::Error>;

    /// Direct successors of a node across the whole graph.
    async fn successors(&self, id: &NodeId) -> Result<Vec<NodeId>, Self::Error>;

    /// Commit an edge. Callers go through the acyclicity guard first.
    async fn insert_edge(&self, edge: &Edge) -> Result<(), Self::Error>;

    /// Write derived fields (`topo_order`, `layer`, `level_id`,
    /// `sublevel_id`, coordinates) back to the nodes. Pinned fields are never
    /// overwritten.
    async fn persist_placements(&self, placements: &[BlockPlacement]) -> Result<(), Self::Error>;

    /// Check reachability.
    async fn ping(&self) -> Result<(), Self::Error>;
}

pub use memory::InMemoryLayoutStore;

#[cfg(feature = "postgres")]
pub use postgres::{PoolStats, PostgresConfig, PostgresError, PostgresLayoutStore};
