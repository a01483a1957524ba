//! Property-based tests for ordering, layering and grouping.
//!
//! Graphs are random but ids are shuffled against the generating order, so
//! the id tie-break never coincides with the topology by accident.

use std::collections::{BTreeSet, HashMap};

use proptest::prelude::*;

use knowledge_map_layering::{
    group_levels, Edge, GraphNode, InMemoryLayoutStore, LayerAssigner, LayoutOptions,
    LevelGrouper, NodeFilter, NodeId, RunId, SortReport, TopologicalSorter,
};

// =============================================================================
// Strategies
// =============================================================================

/// A graph as (ids, edges by index).
#[derive(Debug, Clone)]
struct Graph {
    ids: Vec<NodeId>,
    edges: Vec<(usize, usize)>,
}

impl Graph {
    fn store(&self) -> InMemoryLayoutStore {
        InMemoryLayoutStore::from_parts(
            self.ids.iter().cloned().map(GraphNode::new),
            self.edges
                .iter()
                .map(|&(u, v)| Edge::new(self.ids[u].clone(), self.ids[v].clone())),
        )
    }
}

prop_compose! {
    /// DAG: every edge goes from a lower to a higher generating index.
    fn arb_dag()(n in 1usize..40)(
        names in Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
        raw in prop::collection::vec((0..n, 0..n), 0..(n * 3)),
    ) -> Graph {
        let edges: BTreeSet<(usize, usize)> = raw
            .into_iter()
            .filter(|(u, v)| u != v)
            .map(|(u, v)| (u.min(v), u.max(v)))
            .collect();
        Graph {
            ids: names.into_iter().map(|i| NodeId::from(format!("v{i:02}"))).collect(),
            edges: edges.into_iter().collect(),
        }
    }
}

prop_compose! {
    /// Arbitrary directed graph without self-loops; may contain cycles.
    fn arb_graph()(n in 1usize..30)(
        raw in prop::collection::vec((0..n, 0..n), 0..(n * 3)),
        n in Just(n),
    ) -> Graph {
        let edges: BTreeSet<(usize, usize)> = raw.into_iter().filter(|(u, v)| u != v).collect();
        Graph {
            ids: (0..n).map(|i| NodeId::from(format!("v{i:02}"))).collect(),
            edges: edges.into_iter().collect(),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

fn sort(store: &InMemoryLayoutStore, batch_size: usize) -> (RunId, SortReport) {
    let run = RunId::new();
    let report = block_on(TopologicalSorter::new(store, batch_size).compute_order(&run, &NodeFilter::all()))
        .unwrap();
    (run, report)
}

fn orders(store: &InMemoryLayoutStore, run: &RunId, ids: &[NodeId]) -> Vec<u64> {
    ids.iter().map(|id| store.run_order(run, id).unwrap()).collect()
}

fn layers(store: &InMemoryLayoutStore, run: &RunId, total: usize) -> HashMap<NodeId, u32> {
    block_on(async {
        LayerAssigner::new(store, 5).assign_layers(run, total).await.unwrap();
        LevelGrouper::new(store, 5).collect(run, false).await.unwrap()
    })
    .into_iter()
    .map(|node| (node.id, node.layer))
    .collect()
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Orders form a permutation of 0..n and respect every edge of a DAG.
    #[test]
    fn test_order_is_topological_permutation(graph in arb_dag(), batch in 1usize..8) {
        let store = graph.store();
        let (run, report) = sort(&store, batch);
        prop_assert!(report.is_acyclic());
        prop_assert_eq!(report.node_count, graph.ids.len());

        let orders = orders(&store, &run, &graph.ids);
        let unique: BTreeSet<u64> = orders.iter().copied().collect();
        prop_assert_eq!(unique, (0..graph.ids.len() as u64).collect::<BTreeSet<_>>());

        for &(u, v) in &graph.edges {
            prop_assert!(orders[u] < orders[v], "edge {} -> {}", graph.ids[u], graph.ids[v]);
        }
    }

    /// The final order does not depend on batch size.
    #[test]
    fn test_order_is_batch_invariant(graph in arb_graph(), batch in 1usize..6) {
        let store = graph.store();
        let (small, _) = sort(&store, batch);
        let (large, _) = sort(&store, 10_000);
        prop_assert_eq!(orders(&store, &small, &graph.ids), orders(&store, &large, &graph.ids));
    }

    /// Cyclic input still yields a total order, flagged as forced.
    #[test]
    fn test_cycles_terminate_with_permutation(graph in arb_graph()) {
        let store = graph.store();
        let (run, report) = sort(&store, 3);
        let orders = orders(&store, &run, &graph.ids);
        let unique: BTreeSet<u64> = orders.iter().copied().collect();
        prop_assert_eq!(unique.len(), graph.ids.len());
        prop_assert_eq!(unique.iter().max().copied(), Some(graph.ids.len() as u64 - 1));

        let backward = graph.edges.iter().any(|&(u, v)| orders[u] > orders[v]);
        if backward {
            prop_assert!(!report.is_acyclic());
        }
    }

    /// Layers strictly increase along every DAG edge.
    #[test]
    fn test_layers_follow_edges(graph in arb_dag()) {
        let store = graph.store();
        let (run, report) = sort(&store, 4);
        let layers = layers(&store, &run, report.node_count);
        for &(u, v) in &graph.edges {
            prop_assert!(layers[&graph.ids[u]] < layers[&graph.ids[v]]);
        }
        // Sources sit on layer 0
        let targets: BTreeSet<usize> = graph.edges.iter().map(|&(_, v)| v).collect();
        for (i, id) in graph.ids.iter().enumerate() {
            if !targets.contains(&i) {
                prop_assert_eq!(layers[id], 0);
            }
        }
    }

    /// Every node lands in exactly one sublevel, and a sublevel belongs to
    /// exactly one level.
    #[test]
    fn test_grouping_partitions_nodes(
        graph in arb_dag(),
        per_sublevel in prop::option::of(1u32..5),
        max_levels in prop::option::of(1u32..4),
        optimize_layout in any::<bool>(),
    ) {
        let store = graph.store();
        let (run, report) = sort(&store, 4);
        let nodes = block_on(async {
            LayerAssigner::new(&store, 4).assign_layers(&run, report.node_count).await.unwrap();
            LevelGrouper::new(&store, 4).collect(&run, optimize_layout).await.unwrap()
        });
        let options = LayoutOptions {
            blocks_per_sublevel: per_sublevel,
            max_levels,
            optimize_layout,
            ..LayoutOptions::default()
        };
        let grouping = group_levels(&nodes, &options).unwrap();

        let mut seen = BTreeSet::new();
        let mut owner: HashMap<u32, u32> = HashMap::new();
        for sublevel in &grouping.sublevels {
            if let Some(cap) = per_sublevel {
                prop_assert!(sublevel.block_ids.len() <= cap as usize);
            }
            prop_assert_eq!(*owner.entry(sublevel.id).or_insert(sublevel.level_id), sublevel.level_id);
            for id in &sublevel.block_ids {
                prop_assert!(seen.insert(id.clone()), "{} listed twice", id);
            }
        }
        prop_assert_eq!(seen.len(), graph.ids.len());
        if let Some(cap) = max_levels {
            prop_assert!(grouping.level_ids().len() <= cap as usize);
        }
    }
}
