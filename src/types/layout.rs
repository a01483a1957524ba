//! Layout output types: levels, sublevels, placements and statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node::{NodeId, RunId};

/// Coarse visualization tier made of one or more sublevels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelNode {
    /// Level id.
    pub id: u32,
    /// Sublevels of this level, ascending.
    pub sublevel_ids: Vec<u32>,
    /// Display name.
    pub name: String,
    /// RGB color.
    pub color: u32,
    /// Bounding box of the level's blocks, padded by half a spacing.
    pub min_x: f64,
    /// See `min_x`.
    pub max_x: f64,
    /// See `min_x`.
    pub min_y: f64,
    /// See `min_x`.
    pub max_y: f64,
}

/// One row of blocks inside a level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SublevelNode {
    /// Sublevel id.
    pub id: u32,
    /// Owning level.
    pub level_id: u32,
    /// Blocks in this sublevel, ordered by column then id.
    pub block_ids: Vec<NodeId>,
    /// RGB color.
    pub color: u32,
    /// Row coordinate shared by every block of the sublevel.
    pub y: f64,
    /// Horizontal extent, padded by half a layer spacing.
    pub min_x: f64,
    /// See `min_x`.
    pub max_x: f64,
}

/// Final placement of a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockPlacement {
    /// Node id.
    pub id: NodeId,
    /// Position in the run's total order.
    pub topo_order: u64,
    /// Longest-path layer.
    pub layer: u32,
    /// Level id.
    pub level: u32,
    /// Sublevel id.
    pub sublevel_id: u32,
    /// Horizontal slot: the layer for connected nodes, a packing slot for isolated ones.
    pub column: u32,
    /// Whether the placement came from a pin.
    pub is_pinned: bool,
    /// Physical scale exponent (pinned nodes only).
    pub physical_scale: Option<i32>,
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
}

/// Aggregate statistics for one layout run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutStatistics {
    /// Nodes in the run.
    pub total_blocks: usize,
    /// Edges with both endpoints in the run.
    pub total_links: usize,
    /// Distinct levels.
    pub total_levels: usize,
    /// Distinct sublevels.
    pub total_sublevels: usize,
    /// Nodes without any edge in the run.
    pub isolated_blocks: usize,
    /// Pinned nodes.
    pub pinned_blocks: usize,
    /// Nodes ordered by the residual-cycle fallback.
    pub residual_cycle_blocks: usize,
    /// Largest assigned layer.
    pub max_layer: u32,
    /// Width of the drawing.
    pub total_width: f64,
    /// Height of the drawing.
    pub total_height: f64,
    /// Wall-clock time of the run.
    pub processing_time_ms: u64,
    /// False when the sorter had to force-break a residual cycle.
    pub is_acyclic: bool,
}

/// Complete output of a layout run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutResult {
    /// Run that produced this layout.
    pub run_id: RunId,
    /// Node placements, ascending by id.
    pub blocks: Vec<BlockPlacement>,
    /// Levels, ascending by id.
    pub levels: Vec<LevelNode>,
    /// Sublevels, ascending by level then id.
    pub sublevels: Vec<SublevelNode>,
    /// Aggregate statistics.
    pub statistics: LayoutStatistics,
    /// Canonical fingerprint of orders and groupings.
    pub layout_hash: String,
    /// Completion time.
    pub computed_at: DateTime<Utc>,
}

impl LayoutResult {
    /// Find a placement by node id.
    pub fn block(&self, id: &NodeId) -> Option<&BlockPlacement> {
        self.blocks
            .binary_search_by(|b| b.id.cmp(id))
            .ok()
            .map(|i| &self.blocks[i])
    }
}
