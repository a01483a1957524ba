//! Edge types for the layering engine.

use serde::{Deserialize, Serialize};
use super::node::NodeId;

/// Directed edge of the knowledge map.
///
/// Implements `Ord` for deterministic ordering: (source, target).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Source node.
    pub source_id: NodeId,
    /// Target node.
    pub target_id: NodeId,
}

impl Edge {
    /// Create a new edge.
    pub fn new(source_id: impl Into<NodeId>, target_id: impl Into<NodeId>) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
        }
    }

    /// Whether the edge points back at its own source.
    pub fn is_self_loop(&self) -> bool {
        self.source_id == self.target_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_ordering() {
        let e1 = Edge::new("a", "b");
        let e2 = Edge::new("a", "c");
        let e3 = Edge::new("b", "a");

        // Same source, different target
        assert!(e1 < e2);
        // Different source
        assert!(e2 < e3);
    }

    #[test]
    fn test_self_loop() {
        assert!(Edge::new("x", "x").is_self_loop());
        assert!(!Edge::new("x", "y").is_self_loop());
    }
}
