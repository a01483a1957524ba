//! Node types for the layering engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Opaque, store-assigned identifier of a node in the knowledge map.
///
/// Implements `Ord` so every batch and tie-break can be ordered
/// lexicographically, which keeps sort runs reproducible.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of one layout run.
///
/// Scratch state (`in_degree`, waves, provisional orders and layers) is keyed
/// by this id so concurrent runs never observe each other's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Generate a fresh run id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a run id from its UUID string form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// User-fixed placement of a node.
///
/// A pinned node keeps these values verbatim across every re-layout. A pin
/// without a sublevel fixes only the level; the grouper then allocates a
/// sublevel for it inside that level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pin {
    /// Pinned level id.
    pub level_id: u32,
    /// Pinned sublevel id, if fixed.
    #[serde(default)]
    pub sublevel_id: Option<u32>,
    /// Power-of-ten exponent of the node's physical scale.
    pub physical_scale: i32,
}

impl Pin {
    /// Pin a node to an exact level and sublevel.
    pub fn new(level_id: u32, sublevel_id: u32, physical_scale: i32) -> Self {
        Self {
            level_id,
            sublevel_id: Some(sublevel_id),
            physical_scale,
        }
    }

    /// Pin a node to a level only.
    pub fn at_level(level_id: u32, physical_scale: i32) -> Self {
        Self {
            level_id,
            sublevel_id: None,
            physical_scale,
        }
    }
}

/// A node as owned by the graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Node id.
    pub id: NodeId,
    /// Labels used by run filters (e.g. `Article`).
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Free-form properties used by run filters and echoed back to callers.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Pin, if the user fixed this node's placement.
    #[serde(default)]
    pub pin: Option<Pin>,
    /// Previously persisted layer. Only consulted for pinned nodes.
    #[serde(default)]
    pub layer: Option<u32>,
}

impl GraphNode {
    /// Create an unpinned node without labels.
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            labels: BTreeSet::new(),
            properties: BTreeMap::new(),
            pin: None,
            layer: None,
        }
    }

    /// Add a label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    /// Set a property.
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Pin the node.
    pub fn pinned(mut self, pin: Pin) -> Self {
        self.pin = Some(pin);
        self
    }

    /// Whether the node is pinned.
    pub fn is_pinned(&self) -> bool {
        self.pin.is_some()
    }
}

/// Selects the node set of a layout run.
///
/// An empty filter selects every node. Labels match if the node carries any
/// of them; properties must all be equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFilter {
    /// Accepted labels.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Required property values.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl NodeFilter {
    /// Filter that selects every node.
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter by labels.
    pub fn with_labels<I, L>(labels: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            properties: BTreeMap::new(),
        }
    }

    /// Check whether a node belongs to the run.
    pub fn matches(&self, node: &GraphNode) -> bool {
        let label_ok = self.labels.is_empty()
            || self.labels.iter().any(|l| node.labels.contains(l));
        label_ok
            && self
                .properties
                .iter()
                .all(|(k, v)| node.properties.get(k) == Some(v))
    }
}

/// A node read back in topological order, as needed by layer assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderedNode {
    /// Node id.
    pub id: NodeId,
    /// Position in the run's total order.
    pub topo_order: u64,
    /// Pin, if any.
    pub pin: Option<Pin>,
    /// Previously persisted layer.
    pub stored_layer: Option<u32>,
}

/// A node with its assigned layer, as needed by level grouping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayeredNode {
    /// Node id.
    pub id: NodeId,
    /// Position in the run's total order.
    pub topo_order: u64,
    /// Assigned layer.
    pub layer: u32,
    /// Pin, if any.
    pub pin: Option<Pin>,
    /// True when the node has no edges inside the run.
    pub isolated: bool,
    /// Direct predecessors. Only populated when the layout is optimized.
    #[serde(default)]
    pub parents: Vec<NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_id_ordering_is_lexicographic() {
        let a = NodeId::from("a");
        let b = NodeId::from("b");
        let a10 = NodeId::from("a10");
        assert!(a < a10);
        assert!(a10 < b);
    }

    #[test]
    fn test_filter_matches_labels_and_properties() {
        let node = GraphNode::new("n1")
            .with_label("Article")
            .with_property("source", json!("pubmed"));

        assert!(NodeFilter::all().matches(&node));
        assert!(NodeFilter::with_labels(["Article"]).matches(&node));
        assert!(!NodeFilter::with_labels(["Pattern"]).matches(&node));

        let mut filter = NodeFilter::with_labels(["Article"]);
        filter.properties.insert("source".into(), json!("pmc"));
        assert!(!filter.matches(&node));
    }

    #[test]
    fn test_run_id_roundtrips_through_string() {
        let run = RunId::new();
        let parsed = RunId::parse(&run.to_string()).unwrap();
        assert_eq!(run, parsed);
    }
}
