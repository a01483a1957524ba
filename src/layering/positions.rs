//! Coordinates, colors and statistics.
//!
//! Sublevels become rows, ordered by `(level_id, sublevel_id)`:
//! `y = row * sublevel_spacing`. Blocks sit at `x = column * layer_spacing`.
//! Colors cycle through fixed palettes, so a level keeps its color across
//! runs.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::layering::levels::Grouping;
use crate::types::{BlockPlacement, LayoutOptions, LayoutStatistics, LevelNode, NodeId, SublevelNode};

/// Level colors (RGB).
pub const LEVEL_PALETTE: [u32; 8] = [
    0xB0C4DE, 0x20B2AA, 0xFA8072, 0xFAFAD2, 0xDDA0DD, 0xD3D3D3, 0xE0FFFF, 0xE6E6FA,
];

/// Sublevel colors (RGB).
pub const SUBLEVEL_PALETTE: [u32; 10] = [
    0xADD8E6, 0x90EE90, 0xF08080, 0xFFFFE0, 0xFFB6C1, 0xD3D3D3, 0xE0FFFF, 0xE6E6FA, 0xFFE4E1,
    0xF0FFF0,
];

/// Color of a level.
pub fn level_color(level_id: u32) -> u32 {
    LEVEL_PALETTE[level_id as usize % LEVEL_PALETTE.len()]
}

/// Color of a sublevel.
pub fn sublevel_color(sublevel_id: u32) -> u32 {
    SUBLEVEL_PALETTE[sublevel_id as usize % SUBLEVEL_PALETTE.len()]
}

/// Run facts the encoder cannot derive from the grouping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFacts {
    /// Edges inside the run.
    pub total_links: usize,
    /// Nodes ordered by the residual-cycle fallback.
    pub forced_count: usize,
}

/// Positioned layout, before persistence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodedLayout {
    /// Placements, ascending id.
    pub blocks: Vec<BlockPlacement>,
    /// Levels, ascending id.
    pub levels: Vec<LevelNode>,
    /// Sublevels, ascending level then id.
    pub sublevels: Vec<SublevelNode>,
    /// Statistics; `processing_time_ms` is left for the caller.
    pub statistics: LayoutStatistics,
}

/// Converts a grouping into coordinates and statistics.
#[derive(Debug, Clone)]
pub struct PositionEncoder {
    layer_spacing: f64,
    sublevel_spacing: f64,
}

impl PositionEncoder {
    /// Create an encoder from layout options.
    pub fn new(options: &LayoutOptions) -> Self {
        Self {
            layer_spacing: options.layer_spacing,
            sublevel_spacing: options.sublevel_spacing,
        }
    }

    /// Place every block and summarize the layout.
    pub fn encode(&self, grouping: &Grouping, facts: RunFacts) -> EncodedLayout {
        let half_x = self.layer_spacing / 2.0;
        let half_y = self.sublevel_spacing / 2.0;

        let row_y: HashMap<u32, f64> = grouping
            .sublevels
            .iter()
            .zip(0u32..)
            .map(|(s, row)| (s.id, f64::from(row) * self.sublevel_spacing))
            .collect();

        let blocks: Vec<BlockPlacement> = grouping
            .blocks
            .iter()
            .map(|b| BlockPlacement {
                id: b.id.clone(),
                topo_order: b.topo_order,
                layer: b.layer,
                level: b.level,
                sublevel_id: b.sublevel_id,
                column: b.column,
                is_pinned: b.pin.is_some(),
                physical_scale: b.pin.map(|p| p.physical_scale),
                x: f64::from(b.column) * self.layer_spacing,
                y: row_y.get(&b.sublevel_id).copied().unwrap_or_default(),
            })
            .collect();
        let x_of: HashMap<&NodeId, f64> = blocks.iter().map(|b| (&b.id, b.x)).collect();

        let sublevels: Vec<SublevelNode> = grouping
            .sublevels
            .iter()
            .map(|s| {
                let xs = s.block_ids.iter().filter_map(|id| x_of.get(id).copied());
                let (min_x, max_x) = xs.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), x| {
                    (lo.min(x), hi.max(x))
                });
                SublevelNode {
                    id: s.id,
                    level_id: s.level_id,
                    block_ids: s.block_ids.clone(),
                    color: sublevel_color(s.id),
                    y: row_y.get(&s.id).copied().unwrap_or_default(),
                    min_x: min_x - half_x,
                    max_x: max_x + half_x,
                }
            })
            .collect();

        let mut by_level: BTreeMap<u32, Vec<&SublevelNode>> = BTreeMap::new();
        for sub in &sublevels {
            by_level.entry(sub.level_id).or_default().push(sub);
        }
        let levels: Vec<LevelNode> = by_level
            .into_iter()
            .map(|(id, subs)| {
                let fold = |f: fn(f64, f64) -> f64, init: f64, get: fn(&SublevelNode) -> f64| {
                    subs.iter().map(|s| get(s)).fold(init, f)
                };
                LevelNode {
                    id,
                    sublevel_ids: subs.iter().map(|s| s.id).collect(),
                    name: format!("Level {id}"),
                    color: level_color(id),
                    min_x: fold(f64::min, f64::INFINITY, |s| s.min_x),
                    max_x: fold(f64::max, f64::NEG_INFINITY, |s| s.max_x),
                    min_y: fold(f64::min, f64::INFINITY, |s| s.y) - half_y,
                    max_y: fold(f64::max, f64::NEG_INFINITY, |s| s.y) + half_y,
                }
            })
            .collect();

        let max_column = blocks.iter().map(|b| b.column).max();
        let statistics = LayoutStatistics {
            total_blocks: blocks.len(),
            total_links: facts.total_links,
            total_levels: levels.len(),
            total_sublevels: sublevels.len(),
            isolated_blocks: grouping.blocks.iter().filter(|b| b.isolated).count(),
            pinned_blocks: blocks.iter().filter(|b| b.is_pinned).count(),
            residual_cycle_blocks: facts.forced_count,
            max_layer: blocks.iter().map(|b| b.layer).max().unwrap_or(0),
            total_width: max_column.map_or(0.0, |c| f64::from(c + 1) * self.layer_spacing),
            total_height: sublevels.len() as f64 * self.sublevel_spacing,
            processing_time_ms: 0,
            is_acyclic: facts.forced_count == 0,
        };

        EncodedLayout {
            blocks,
            levels,
            sublevels,
            statistics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layering::levels::group_levels;
    use crate::types::{LayeredNode, Pin};

    fn node(id: &str, layer: u32, isolated: bool) -> LayeredNode {
        LayeredNode {
            id: NodeId::from(id),
            topo_order: 0,
            layer,
            pin: None,
            isolated,
            parents: Vec::new(),
        }
    }

    fn encode(nodes: &[LayeredNode], forced: usize) -> EncodedLayout {
        let options = LayoutOptions::default();
        let grouping = group_levels(nodes, &options).unwrap();
        PositionEncoder::new(&options).encode(
            &grouping,
            RunFacts {
                total_links: 4,
                forced_count: forced,
            },
        )
    }

    fn diamond() -> Vec<LayeredNode> {
        vec![
            node("A", 0, false),
            node("B", 1, false),
            node("C", 1, false),
            node("D", 2, false),
        ]
    }

    #[test]
    fn test_diamond_coordinates() {
        let layout = encode(&diamond(), 0);
        let pos = |id: &str| {
            let b = layout.blocks.iter().find(|b| b.id.as_str() == id).unwrap();
            (b.x, b.y)
        };
        assert_eq!(pos("A"), (0.0, 0.0));
        assert_eq!(pos("B"), (250.0, 0.0));
        assert_eq!(pos("C"), (250.0, 200.0));
        assert_eq!(pos("D"), (500.0, 400.0));

        let stats = &layout.statistics;
        assert_eq!(stats.total_blocks, 4);
        assert_eq!(stats.total_links, 4);
        assert_eq!(stats.max_layer, 2);
        assert_eq!(stats.total_levels, 2);
        assert_eq!(stats.total_sublevels, 3);
        assert_eq!(stats.total_width, 750.0);
        assert_eq!(stats.total_height, 600.0);
        assert!(stats.is_acyclic);
    }

    #[test]
    fn test_level_names_colors_and_bounds() {
        let layout = encode(&diamond(), 0);
        let level = &layout.levels[0];
        assert_eq!(level.name, "Level 0");
        assert_eq!(level.color, 0xB0C4DE);
        assert_eq!(level.sublevel_ids, vec![0, 1]);
        assert_eq!((level.min_y, level.max_y), (-100.0, 300.0));
        assert_eq!((level.min_x, level.max_x), (-125.0, 375.0));
        assert_eq!(layout.sublevels[2].color, 0xF08080);
    }

    #[test]
    fn test_palettes_cycle() {
        assert_eq!(level_color(8), level_color(0));
        assert_eq!(sublevel_color(13), sublevel_color(3));
    }

    #[test]
    fn test_counts_isolated_pinned_and_forced() {
        let mut nodes = diamond();
        nodes.push(node("Z", 0, true));
        nodes.push(LayeredNode {
            pin: Some(Pin::new(9, 9, 3)),
            ..node("P", 1, false)
        });
        let layout = encode(&nodes, 2);

        let stats = &layout.statistics;
        assert_eq!(stats.isolated_blocks, 1);
        assert_eq!(stats.pinned_blocks, 1);
        assert_eq!(stats.residual_cycle_blocks, 2);
        assert!(!stats.is_acyclic);

        let p = layout.blocks.iter().find(|b| b.id.as_str() == "P").unwrap();
        assert!(p.is_pinned);
        assert_eq!(p.physical_scale, Some(3));
    }

    #[test]
    fn test_empty_layout() {
        let layout = encode(&[], 0);
        assert_eq!(layout.statistics.total_width, 0.0);
        assert_eq!(layout.statistics.total_height, 0.0);
        assert!(layout.levels.is_empty());
    }
}
