//! Core types for the layering engine.

pub mod node;
pub mod edge;
pub mod options;
pub mod layout;

pub use node::{NodeId, RunId, Pin, GraphNode, NodeFilter, OrderedNode, LayeredNode};
pub use edge::Edge;
pub use options::LayoutOptions;
pub use layout::{LevelNode, SublevelNode, BlockPlacement, LayoutStatistics, LayoutResult};
