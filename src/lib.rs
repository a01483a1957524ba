//! # knowledge-map-layering
//!
//! Deterministic, batched, multi-resolution layered layout for knowledge-map
//! DAGs stored in a shared graph store.
//!
//! The engine answers one question:
//!
//! > Where does every node of the map go, so that edges point forward and
//! > user-pinned nodes stay exactly where they were put?
//!
//! ## Core Contract
//!
//! 1. Guard edge writes so new edges never close a cycle
//! 2. Compute a total, contiguous topological order in bounded batches,
//!    force-breaking residual cycles instead of failing
//! 3. Derive layers, levels, sublevels and coordinates, preserving pins
//! 4. Run the stages as independently retryable tasks on a worker pool
//!
//! ## Architecture
//!
//! ```text
//! AcyclicityGuard ──gates──▶ edge writes
//!
//! DistributedLayoutCoordinator
//!   └─▶ TopologicalSorter → LayerAssigner → LevelGrouper → PositionEncoder → persist
//!              ↓
//!        LayoutStore (Postgres or Memory)
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Same graph + same options → identical `layout_hash`
//! - Orders do not depend on batch size or worker count
//! - Ties are always broken by ascending `NodeId`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod error;
pub mod config;
pub mod retry;
pub mod memory;
pub mod canonical;
pub mod store;
pub mod guard;
pub mod layering;
pub mod coordinator;

#[cfg(feature = "service")]
pub mod service;

// Re-exports
pub use types::{
    BlockPlacement, Edge, GraphNode, LayeredNode, LayoutOptions, LayoutResult, LayoutStatistics,
    LevelNode, NodeFilter, NodeId, OrderedNode, Pin, RunId, SublevelNode,
};
pub use error::{LayoutError, Retryable};
pub use config::WorkerConfig;
pub use retry::{RetryConfig, RetryPolicy};
pub use memory::MemoryBudget;
pub use canonical::{canonical_hash, canonical_hash_hex, layout_hash, to_canonical_bytes};
pub use store::{InMemoryLayoutStore, LayoutStore, RunCounts};
#[cfg(feature = "postgres")]
pub use store::{PostgresConfig, PostgresLayoutStore};
pub use guard::AcyclicityGuard;
pub use layering::{
    group_levels, Grouping, LayerAssigner, LayerReport, LayoutProgress, LayoutStage,
    LevelGrouper, PositionEncoder, ProgressRegistry, ProgressReporter, SortReport,
    TopologicalSorter,
};
pub use coordinator::{
    DistributedLayoutCoordinator, InProcessBroker, LayoutFailure, QueueName, StageExecutor,
    StageTask, TaskBroker, WorkerPool,
};
#[cfg(feature = "postgres")]
pub use coordinator::PostgresTaskBroker;

// Service re-exports (when service feature is enabled)
#[cfg(feature = "service")]
pub use service::{create_router, ServiceState};

/// Version of the layout result schema.
/// Increment on breaking changes to any serialized type.
pub const LAYOUT_SCHEMA_VERSION: &str = "1.0.0";
