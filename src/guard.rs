//! Edge-insert cycle guard.
//!
//! Before a new edge `from -> to` is committed, the guard walks the graph from
//! `to`. Reaching `from` means the edge would close a cycle. The walk is an
//! explicit-stack DFS, so chain depth is bounded by heap, not by call stack.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::error::LayoutError;
use crate::store::LayoutStore;
use crate::types::{Edge, NodeId};

/// Rejects edges that would close a cycle.
pub struct AcyclicityGuard<'a, S: LayoutStore> {
    store: &'a S,
}

impl<'a, S: LayoutStore> AcyclicityGuard<'a, S> {
    /// Create a guard over a store.
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// True iff committing `from -> to` would create a cycle, including the
    /// self-loop case `from == to`. Read-only.
    pub async fn would_create_cycle(&self, from: &NodeId, to: &NodeId) -> Result<bool, LayoutError> {
        if from == to {
            return Ok(true);
        }

        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut path: HashSet<NodeId> = HashSet::new();
        // (node, finalize): a finalize marker pops the node off the current path
        let mut stack: Vec<(NodeId, bool)> = vec![(to.clone(), false)];

        while let Some((node, finalize)) = stack.pop() {
            if finalize {
                path.remove(&node);
                continue;
            }
            if &node == from || path.contains(&node) {
                return Ok(true);
            }
            if !visited.insert(node.clone()) {
                continue;
            }

            path.insert(node.clone());
            let successors = self
                .store
                .successors(&node)
                .await
                .map_err(LayoutError::from_store)?;
            stack.push((node, true));
            for succ in successors.into_iter().rev() {
                if !visited.contains(&succ) || path.contains(&succ) {
                    stack.push((succ, false));
                }
            }
        }

        Ok(false)
    }

    /// Commit `edge` unless it would close a cycle.
    pub async fn insert_edge(&self, edge: &Edge) -> Result<(), LayoutError> {
        if self.would_create_cycle(&edge.source_id, &edge.target_id).await? {
            warn!(
                source_id = %edge.source_id,
                target_id = %edge.target_id,
                "Rejected edge that would create a cycle"
            );
            return Err(LayoutError::CycleRejected {
                source_id: edge.source_id.clone(),
                target_id: edge.target_id.clone(),
            });
        }

        self.store
            .insert_edge(edge)
            .await
            .map_err(LayoutError::from_store)?;
        debug!(source_id = %edge.source_id, target_id = %edge.target_id, "Edge committed");
        Ok(())
    }
}
