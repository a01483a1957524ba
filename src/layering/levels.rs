//! Level and sublevel grouping.
//!
//! ## Model
//!
//! - Contiguous runs of `layers_per_level` layers form one level. Beyond
//!   `max_levels` (less the levels held by pins, at least one), deeper levels
//!   fold into the last allowed one.
//! - Inside a level, each layer's nodes are ranked (by id, or by predecessor
//!   barycenter when `optimize_layout` is set). Row `r` holds the `r`-th node
//!   of every layer, so no row contains two nodes of the same layer. Rows are
//!   cut into sublevels of at most `blocks_per_sublevel` nodes.
//! - Isolated nodes get a trailing level, packed `blocks_per_sublevel` wide
//!   (default `max_layer + 1`). If `max_levels` is already used up they join
//!   the last level instead.
//! - Pinned nodes sit at exactly their pinned level and sublevel. Level and
//!   sublevel ids handed to unpinned nodes skip every pinned id. A pin that
//!   fixes only the level gets a freshly allocated sublevel in that level,
//!   shared with no unpinned node.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::LayoutError;
use crate::layering::progress::{LayoutStage, ProgressReporter};
use crate::retry::RetryPolicy;
use crate::store::LayoutStore;
use crate::types::{LayeredNode, LayoutOptions, NodeId, Pin, RunId};

/// A node with its level, sublevel and horizontal slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedBlock {
    /// Node id.
    pub id: NodeId,
    /// Position in the run's total order.
    pub topo_order: u64,
    /// Assigned layer.
    pub layer: u32,
    /// Level id.
    pub level: u32,
    /// Sublevel id.
    pub sublevel_id: u32,
    /// Horizontal slot.
    pub column: u32,
    /// Pin, if any.
    pub pin: Option<Pin>,
    /// No edges inside the run.
    pub isolated: bool,
}

/// Membership of one sublevel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SublevelGroup {
    /// Sublevel id.
    pub id: u32,
    /// Owning level.
    pub level_id: u32,
    /// Members, by column then id.
    pub block_ids: Vec<NodeId>,
}

/// Partition of a run's nodes into levels and sublevels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Grouping {
    /// Every node, ascending id.
    pub blocks: Vec<GroupedBlock>,
    /// Every sublevel, ascending `(level_id, id)`.
    pub sublevels: Vec<SublevelGroup>,
}

impl Grouping {
    /// Distinct level ids, ascending.
    pub fn level_ids(&self) -> Vec<u32> {
        self.sublevels
            .iter()
            .map(|s| s.level_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Hands out ascending ids, skipping reserved ones.
struct IdAllocator {
    reserved: BTreeSet<u32>,
    next: u32,
}

impl IdAllocator {
    fn new(reserved: BTreeSet<u32>) -> Self {
        Self { reserved, next: 0 }
    }

    fn next_id(&mut self) -> u32 {
        while self.reserved.contains(&self.next) {
            self.next += 1;
        }
        let id = self.next;
        self.next += 1;
        id
    }
}

struct Builder {
    blocks: Vec<GroupedBlock>,
    sublevels: Vec<SublevelGroup>,
    sublevel_ids: IdAllocator,
}

impl Builder {
    /// Add one sublevel holding `members` as `(node, column)`.
    fn push_row(&mut self, level: u32, members: Vec<(&LayeredNode, u32)>) {
        let id = self.sublevel_ids.next_id();
        let block_ids = members.iter().map(|(n, _)| n.id.clone()).collect();
        for (node, column) in members {
            self.blocks.push(block(node, level, id, column));
        }
        self.sublevels.push(SublevelGroup {
            id,
            level_id: level,
            block_ids,
        });
    }

    fn push_packed(&mut self, level: u32, nodes: &[&LayeredNode], width: usize) {
        for chunk in nodes.chunks(width.max(1)) {
            let members = chunk.iter().zip(0u32..).map(|(n, c)| (*n, c)).collect();
            self.push_row(level, members);
        }
    }
}

fn block(node: &LayeredNode, level: u32, sublevel_id: u32, column: u32) -> GroupedBlock {
    GroupedBlock {
        id: node.id.clone(),
        topo_order: node.topo_order,
        layer: node.layer,
        level,
        sublevel_id,
        column,
        pin: node.pin,
        isolated: node.isolated,
    }
}

/// Parents by child id, fetched for one level at a time.
type ParentMap = HashMap<NodeId, Vec<NodeId>>;

/// Rank one layer's nodes: by id, or by mean rank of already-ranked parents.
///
/// Parents come from `parents` when present there, else from the node.
fn rank_layer<'n>(
    mut nodes: Vec<&'n LayeredNode>,
    optimize: bool,
    parents: &ParentMap,
    ranks: &mut HashMap<NodeId, usize>,
) -> Vec<&'n LayeredNode> {
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    if optimize {
        let barycenter = |n: &LayeredNode| -> Option<f64> {
            let parent_ids = parents.get(&n.id).map_or(n.parents.as_slice(), Vec::as_slice);
            let known: Vec<usize> = parent_ids.iter().filter_map(|p| ranks.get(p).copied()).collect();
            (!known.is_empty()).then(|| known.iter().sum::<usize>() as f64 / known.len() as f64)
        };
        let mut keyed: Vec<(Option<f64>, &LayeredNode)> =
            nodes.into_iter().map(|n| (barycenter(n), n)).collect();
        // Nodes without ranked parents keep id order after the others
        keyed.sort_by(|(ka, a), (kb, b)| match (ka, kb) {
            (Some(x), Some(y)) => x.total_cmp(y).then_with(|| a.id.cmp(&b.id)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.id.cmp(&b.id),
        });
        nodes = keyed.into_iter().map(|(_, n)| n).collect();
    }
    for (rank, node) in nodes.iter().enumerate() {
        ranks.insert(node.id.clone(), rank);
    }
    nodes
}

/// Level assignment of a run, turned into rows one level at a time.
struct LevelPlan<'n> {
    optimize: bool,
    row_width: Option<usize>,
    isolated_width: usize,
    groups: Vec<Vec<&'n LayeredNode>>,
    pinned: BTreeMap<(u32, u32), Vec<&'n LayeredNode>>,
    level_pinned: BTreeMap<u32, Vec<&'n LayeredNode>>,
    isolated: Vec<&'n LayeredNode>,
    isolated_joins_last: bool,
    level_ids: IdAllocator,
    builder: Builder,
    ranks: HashMap<NodeId, usize>,
}

impl<'n> LevelPlan<'n> {
    fn new(nodes: &'n [LayeredNode], options: &LayoutOptions) -> Result<Self, LayoutError> {
        let per_level = options.layers_per_level.max(1);
        let row_width = options.blocks_per_sublevel.filter(|&b| b > 0).map(|b| b as usize);
        let max_layer = nodes
            .iter()
            .filter(|n| !n.isolated)
            .map(|n| n.layer)
            .max()
            .unwrap_or(0);

        let mut pinned: BTreeMap<(u32, u32), Vec<&LayeredNode>> = BTreeMap::new();
        let mut level_pinned: BTreeMap<u32, Vec<&LayeredNode>> = BTreeMap::new();
        let mut pinned_sublevels: BTreeMap<u32, u32> = BTreeMap::new();
        let mut pinned_levels: BTreeSet<u32> = BTreeSet::new();
        let mut isolated: Vec<&LayeredNode> = Vec::new();
        let mut buckets: BTreeMap<u32, Vec<&LayeredNode>> = BTreeMap::new();

        for node in nodes {
            match node.pin {
                Some(pin) => {
                    pinned_levels.insert(pin.level_id);
                    let Some(sublevel) = pin.sublevel_id else {
                        level_pinned.entry(pin.level_id).or_default().push(node);
                        continue;
                    };
                    if let Some(&level) = pinned_sublevels.get(&sublevel) {
                        if level != pin.level_id {
                            return Err(LayoutError::Validation(format!(
                                "sublevel {} is pinned under both level {} and level {}",
                                sublevel, level, pin.level_id
                            )));
                        }
                    }
                    pinned_sublevels.insert(sublevel, pin.level_id);
                    pinned.entry((pin.level_id, sublevel)).or_default().push(node);
                }
                None if node.isolated => isolated.push(node),
                None => buckets.entry(node.layer / per_level).or_default().push(node),
            }
        }

        isolated.sort_by(|a, b| a.id.cmp(&b.id));

        let level_budget = options
            .max_levels
            .filter(|&m| m > 0)
            .map(|m| (m as usize).saturating_sub(pinned_levels.len()).max(1));

        let mut groups: Vec<Vec<&LayeredNode>> = Vec::new();
        for (index, (_, members)) in buckets.into_iter().enumerate() {
            let target = level_budget.map_or(index, |budget| index.min(budget - 1));
            if target == groups.len() {
                groups.push(members);
            } else {
                groups[target].extend(members);
            }
        }
        let isolated_joins_last =
            !groups.is_empty() && level_budget.is_some_and(|budget| groups.len() >= budget);

        Ok(Self {
            optimize: options.optimize_layout,
            row_width,
            isolated_width: row_width.unwrap_or(max_layer as usize + 1),
            groups,
            pinned,
            level_pinned,
            isolated,
            isolated_joins_last,
            level_ids: IdAllocator::new(pinned_levels),
            builder: Builder {
                blocks: Vec::with_capacity(nodes.len()),
                sublevels: Vec::new(),
                sublevel_ids: IdAllocator::new(pinned_sublevels.keys().copied().collect()),
            },
            ranks: HashMap::new(),
        })
    }

    fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Unpinned, non-isolated members of level group `index`.
    fn group(&self, index: usize) -> &[&'n LayeredNode] {
        &self.groups[index]
    }

    /// Cut group `index` into rows. Groups must be placed in ascending order.
    fn place_group(&mut self, index: usize, parents: &ParentMap) {
        let group = std::mem::take(&mut self.groups[index]);
        let level = self.level_ids.next_id();
        let mut by_layer: BTreeMap<u32, Vec<&LayeredNode>> = BTreeMap::new();
        for node in group {
            by_layer.entry(node.layer).or_default().push(node);
        }
        let optimize = self.optimize;
        let columns: Vec<(u32, Vec<&LayeredNode>)> = by_layer
            .into_iter()
            .map(|(layer, members)| (layer, rank_layer(members, optimize, parents, &mut self.ranks)))
            .collect();

        let rows = columns.iter().map(|(_, c)| c.len()).max().unwrap_or(0);
        for r in 0..rows {
            let row: Vec<(&LayeredNode, u32)> = columns
                .iter()
                .filter_map(|(layer, members)| members.get(r).map(|n| (*n, *layer)))
                .collect();
            let width = self.row_width.unwrap_or(row.len()).max(1);
            let mut row = row.into_iter().peekable();
            while row.peek().is_some() {
                let chunk: Vec<_> = row.by_ref().take(width).collect();
                self.builder.push_row(level, chunk);
            }
        }

        if self.isolated_joins_last && index + 1 == self.groups.len() {
            self.builder.push_packed(level, &self.isolated, self.isolated_width);
        }
    }

    /// Add the isolated level and pinned sublevels, and sort the result.
    fn finish(mut self) -> Grouping {
        if !self.isolated.is_empty() && !self.isolated_joins_last {
            let level = self.level_ids.next_id();
            self.builder.push_packed(level, &self.isolated, self.isolated_width);
        }

        for ((level, sublevel), mut members) in std::mem::take(&mut self.pinned) {
            members.sort_by(|a, b| a.layer.cmp(&b.layer).then_with(|| a.id.cmp(&b.id)));
            let block_ids = members.iter().map(|n| n.id.clone()).collect();
            for node in members {
                self.builder.blocks.push(block(node, level, sublevel, node.layer));
            }
            self.builder.sublevels.push(SublevelGroup {
                id: sublevel,
                level_id: level,
                block_ids,
            });
        }

        // Level-only pins get fresh sublevels inside their level
        for (level, mut members) in std::mem::take(&mut self.level_pinned) {
            members.sort_by(|a, b| a.layer.cmp(&b.layer).then_with(|| a.id.cmp(&b.id)));
            let width = self.row_width.unwrap_or(members.len());
            self.builder.push_packed(level, &members, width);
        }

        let Builder {
            mut blocks,
            mut sublevels,
            ..
        } = self.builder;
        blocks.sort_by(|a, b| a.id.cmp(&b.id));
        sublevels.sort_by_key(|s| (s.level_id, s.id));

        debug!(
            blocks = blocks.len(),
            sublevels = sublevels.len(),
            isolated = self.isolated.len(),
            "Grouped levels"
        );
        Grouping { blocks, sublevels }
    }
}

/// Partition layered nodes into levels and sublevels, using each node's own
/// `parents` for barycenter ordering.
pub fn group_levels(nodes: &[LayeredNode], options: &LayoutOptions) -> Result<Grouping, LayoutError> {
    let mut plan = LevelPlan::new(nodes, options)?;
    let parents = ParentMap::new();
    for index in 0..plan.group_count() {
        plan.place_group(index, &parents);
    }
    Ok(plan.finish())
}

/// Reads a run's layered nodes from the store and groups them.
pub struct LevelGrouper<'a, S: LayoutStore> {
    store: &'a S,
    batch_size: usize,
    retry: RetryPolicy,
    progress: Option<&'a ProgressReporter>,
}

impl<'a, S: LayoutStore> LevelGrouper<'a, S> {
    /// Create a grouper. A zero batch size is treated as 1.
    pub fn new(store: &'a S, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            retry: RetryPolicy::default(),
            progress: None,
        }
    }

    /// Set the retry policy for store calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Publish progress.
    pub fn with_progress(mut self, progress: &'a ProgressReporter) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Read every layered node, with parents when `with_parents` is set.
    pub async fn collect(&self, run: &RunId, with_parents: bool) -> Result<Vec<LayeredNode>, LayoutError> {
        let store = self.store;
        let limit = self.batch_size;
        let mut nodes: Vec<LayeredNode> = Vec::new();
        let mut after: Option<NodeId> = None;

        loop {
            let mut page = self
                .retry
                .run("layered_page", || store.layered_page(run, after.as_ref(), limit))
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());

            if with_parents {
                let ids: Vec<NodeId> = page.iter().map(|n| n.id.clone()).collect();
                let mut parents = self.fetch_parents(run, &ids).await?;
                for node in &mut page {
                    node.parents = parents.remove(&node.id).unwrap_or_default();
                }
            }

            nodes.extend(page);
            if let Some(p) = self.progress {
                p.advance(nodes.len());
            }
            tokio::task::yield_now().await;
        }
        Ok(nodes)
    }

    /// Incoming edges of `ids`, as parent lists, in `batch_size` chunks.
    async fn fetch_parents(&self, run: &RunId, ids: &[NodeId]) -> Result<ParentMap, LayoutError> {
        let store = self.store;
        let mut parents = ParentMap::new();
        for chunk in ids.chunks(self.batch_size) {
            let edges = self
                .retry
                .run("incoming_edges", || store.incoming_edges(run, chunk))
                .await?;
            for edge in edges {
                parents.entry(edge.target_id).or_default().push(edge.source_id);
            }
        }
        Ok(parents)
    }

    /// Collect and group a run.
    ///
    /// The run's nodes are held in memory since every one of them is part of
    /// the result. Parent lists for barycenter ordering are fetched one level
    /// at a time.
    pub async fn group(&self, run: &RunId, options: &LayoutOptions, total: usize) -> Result<Grouping, LayoutError> {
        if let Some(p) = self.progress {
            p.stage(LayoutStage::Grouping, total);
        }
        let nodes = self.collect(run, false).await?;
        let mut plan = LevelPlan::new(&nodes, options)?;
        for index in 0..plan.group_count() {
            // Only one level's parent lists are held at a time
            let parents = if options.optimize_layout {
                let ids: Vec<NodeId> = plan.group(index).iter().map(|n| n.id.clone()).collect();
                self.fetch_parents(run, &ids).await?
            } else {
                ParentMap::new()
            };
            plan.place_group(index, &parents);
        }
        let grouping = plan.finish();
        info!(
            run_id = %run,
            levels = grouping.level_ids().len(),
            sublevels = grouping.sublevels.len(),
            "Levels grouped"
        );
        Ok(grouping)
    }
}
