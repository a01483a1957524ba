//! End-to-end layout runs against the in-memory store.
//!
//! These tests drive the full pipeline (sort, layer, group, encode, persist)
//! through the coordinator and its worker pool.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use knowledge_map_layering::{
    AcyclicityGuard, DistributedLayoutCoordinator, Edge, GraphNode, InMemoryLayoutStore,
    LayoutError, LayoutOptions, LayoutResult, NodeFilter, NodeId, Pin, RetryConfig,
    WorkerConfig,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn config() -> WorkerConfig {
    WorkerConfig::default()
        .with_max_workers(3)
        .with_retry(RetryConfig::default().with_initial_delay(Duration::from_millis(1)))
}

fn diamond() -> InMemoryLayoutStore {
    InMemoryLayoutStore::from_parts(
        ["A", "B", "C", "D"].map(GraphNode::new),
        [
            Edge::new("A", "B"),
            Edge::new("A", "C"),
            Edge::new("B", "D"),
            Edge::new("C", "D"),
        ],
    )
}

/// Layered graph with fan-in and fan-out, generated deterministically.
fn lattice(width: usize, depth: usize) -> InMemoryLayoutStore {
    let id = |layer: usize, i: usize| format!("n{layer:02}_{i:02}");
    let store = InMemoryLayoutStore::new();
    for layer in 0..depth {
        for i in 0..width {
            store.add_node(GraphNode::new(id(layer, i)));
        }
    }
    for layer in 1..depth {
        for i in 0..width {
            store.add_edge(Edge::new(id(layer - 1, i), id(layer, i)));
            if (i + layer) % 3 == 0 {
                store.add_edge(Edge::new(id(layer - 1, (i + 1) % width), id(layer, i)));
            }
        }
    }
    store
}

async fn layout(
    store: Arc<InMemoryLayoutStore>,
    config: WorkerConfig,
    options: &LayoutOptions,
) -> LayoutResult {
    let coordinator = DistributedLayoutCoordinator::in_process(store, config);
    let result = coordinator
        .calculate_layout(&NodeFilter::all(), options)
        .await
        .unwrap();
    coordinator.shutdown().await;
    result
}

fn orders(result: &LayoutResult) -> HashMap<&str, u64> {
    result
        .blocks
        .iter()
        .map(|b| (b.id.as_str(), b.topo_order))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_diamond_layout() {
    let store = Arc::new(diamond());
    let result = layout(Arc::clone(&store), config(), &LayoutOptions::default()).await;

    let orders = orders(&result);
    assert_eq!(orders["A"], 0);
    assert_eq!(orders["D"], 3);
    assert!(orders["B"] < orders["D"] && orders["C"] < orders["D"]);

    let layer = |id: &str| result.block(&NodeId::from(id)).unwrap().layer;
    assert_eq!(layer("A"), 0);
    assert_eq!(layer("B"), 1);
    assert_eq!(layer("C"), 1);
    assert_eq!(layer("D"), 2);

    assert_eq!(result.statistics.total_blocks, 4);
    assert_eq!(result.statistics.total_links, 4);
    assert_eq!(result.statistics.max_layer, 2);
    assert_eq!(result.statistics.isolated_blocks, 0);
    assert!(result.statistics.is_acyclic);

    // Every block lands in exactly one sublevel
    let listed: Vec<&NodeId> = result.sublevels.iter().flat_map(|s| &s.block_ids).collect();
    assert_eq!(listed.len(), 4);
    assert_eq!(listed.iter().collect::<BTreeSet<_>>().len(), 4);

    // Placements were written back
    assert_eq!(store.placement(&NodeId::from("D")).unwrap().layer, 2);
}

#[tokio::test]
async fn test_residual_cycle_is_broken_not_fatal() {
    let store = Arc::new(InMemoryLayoutStore::from_parts(
        ["A", "X", "Y", "Z"].map(GraphNode::new),
        [
            Edge::new("A", "X"),
            Edge::new("X", "Y"),
            Edge::new("Y", "Z"),
            Edge::new("Z", "X"),
        ],
    ));
    let result = layout(store, config(), &LayoutOptions::default()).await;

    assert!(!result.statistics.is_acyclic);
    assert_eq!(result.statistics.residual_cycle_blocks, 3);

    let orders = orders(&result);
    assert_eq!(orders["A"], 0);
    let mut all: Vec<u64> = orders.values().copied().collect();
    all.sort_unstable();
    assert_eq!(all, vec![0, 1, 2, 3]);
    // Residual members are ordered by id
    assert!(orders["X"] < orders["Y"] && orders["Y"] < orders["Z"]);
}

#[tokio::test]
async fn test_pins_survive_relayout() {
    for optimize_layout in [false, true] {
        let store = Arc::new(InMemoryLayoutStore::from_parts(
            [
                GraphNode::new("A"),
                GraphNode::new("B"),
                GraphNode::new("C"),
                GraphNode::new("P").pinned(Pin::new(2, 7, 3)),
            ],
            [Edge::new("A", "B"), Edge::new("B", "C"), Edge::new("A", "P")],
        ));
        let options = LayoutOptions {
            optimize_layout,
            ..LayoutOptions::default()
        };

        let first = layout(Arc::clone(&store), config(), &options).await;
        let second = layout(Arc::clone(&store), config(), &options).await;

        for result in [&first, &second] {
            let pinned = result.block(&NodeId::from("P")).unwrap();
            assert!(pinned.is_pinned);
            assert_eq!(pinned.level, 2);
            assert_eq!(pinned.sublevel_id, 7);
            assert_eq!(pinned.physical_scale, Some(3));

            // No unpinned block shares the pinned sublevel id
            for block in result.blocks.iter().filter(|b| !b.is_pinned) {
                assert_ne!(block.sublevel_id, 7);
            }
            assert_eq!(result.statistics.pinned_blocks, 1);
        }
        assert_eq!(first.layout_hash, second.layout_hash);
        assert_eq!(store.node(&NodeId::from("P")).unwrap().pin, Some(Pin::new(2, 7, 3)));
    }
}

#[tokio::test]
async fn test_layer_cap_leaves_pinned_layer_alone() {
    let mut pinned = GraphNode::new("P").pinned(Pin::new(2, 7, 3));
    pinned.layer = Some(5);
    let store = Arc::new(InMemoryLayoutStore::from_parts(
        [GraphNode::new("A"), GraphNode::new("B"), GraphNode::new("C"), pinned],
        [Edge::new("A", "B"), Edge::new("B", "C"), Edge::new("A", "P")],
    ));
    let options = LayoutOptions {
        max_layers: Some(2),
        ..LayoutOptions::default()
    };
    let result = layout(store, config(), &options).await;

    let layer = |id: &str| result.block(&NodeId::from(id)).unwrap().layer;
    assert_eq!(layer("P"), 5);
    assert_eq!(layer("C"), 1);
    assert_eq!(result.statistics.max_layer, 5);
}

#[tokio::test]
async fn test_relayout_is_idempotent() {
    let store = Arc::new(lattice(6, 5));
    let options = LayoutOptions {
        blocks_per_sublevel: Some(2),
        ..LayoutOptions::default()
    };

    let first = layout(Arc::clone(&store), config(), &options).await;
    let second = layout(Arc::clone(&store), config(), &options).await;

    assert_eq!(first.layout_hash, second.layout_hash);
    assert_eq!(first.blocks, second.blocks);
    assert_eq!(first.levels, second.levels);
    assert_eq!(first.sublevels, second.sublevels);
}

#[tokio::test]
async fn test_batch_size_does_not_change_layout() {
    let options = LayoutOptions::default();
    let small = layout(
        Arc::new(lattice(7, 6)),
        config().with_batch_size(1),
        &options,
    )
    .await;
    let large = layout(
        Arc::new(lattice(7, 6)),
        config().with_batch_size(10_000),
        &options,
    )
    .await;

    assert_eq!(small.layout_hash, large.layout_hash);
    assert_eq!(orders(&small), orders(&large));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let store = Arc::new(diamond());
    store.inject_failures(2, true);
    let result = layout(store, config(), &LayoutOptions::default()).await;
    assert_eq!(result.statistics.total_blocks, 4);
}

#[tokio::test]
async fn test_permanent_failure_reports_statistics() {
    let store = Arc::new(diamond());
    store.inject_failures(1, false);
    let coordinator = DistributedLayoutCoordinator::in_process(store, config());
    let failure = coordinator
        .calculate_layout(&NodeFilter::all(), &LayoutOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(failure.error, LayoutError::Store(_)));
    assert!(!failure.error.is_retryable());
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_run_times_out() {
    let store = Arc::new(diamond());
    store.inject_failures(5, true);
    let config = config().with_retry(
        RetryConfig::default()
            .with_initial_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(10)),
    );
    let coordinator = DistributedLayoutCoordinator::in_process(store, config);
    let failure = coordinator
        .calculate_layout_with_timeout(
            &NodeFilter::all(),
            &LayoutOptions::default(),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert_eq!(failure.error.code(), "TIMEOUT");
    // Not shut down: the worker is still sleeping off its retry delay
    drop(coordinator);
}

#[tokio::test]
async fn test_label_filter_restricts_run() {
    let store = Arc::new(InMemoryLayoutStore::from_parts(
        [
            GraphNode::new("a1").with_label("Article"),
            GraphNode::new("a2").with_label("Article"),
            GraphNode::new("p1").with_label("Pattern"),
        ],
        [Edge::new("a1", "p1"), Edge::new("p1", "a2")],
    ));
    let coordinator = DistributedLayoutCoordinator::in_process(Arc::clone(&store), config());
    let result = coordinator
        .calculate_layout(&NodeFilter::with_labels(["Article"]), &LayoutOptions::default())
        .await
        .unwrap();
    coordinator.shutdown().await;

    assert_eq!(result.statistics.total_blocks, 2);
    // Edges through the excluded node do not count
    assert_eq!(result.statistics.total_links, 0);
    assert_eq!(result.statistics.isolated_blocks, 2);
    assert!(store.placement(&NodeId::from("p1")).is_none());
}

#[tokio::test]
async fn test_guarded_writes_keep_layout_acyclic() {
    let store = Arc::new(InMemoryLayoutStore::from_parts(
        ["A", "B", "C"].map(GraphNode::new),
        [],
    ));
    let guard = AcyclicityGuard::new(store.as_ref());
    guard.insert_edge(&Edge::new("A", "B")).await.unwrap();
    guard.insert_edge(&Edge::new("B", "C")).await.unwrap();

    let rejected = guard.insert_edge(&Edge::new("C", "A")).await.unwrap_err();
    assert!(matches!(rejected, LayoutError::CycleRejected { .. }));
    assert_eq!(store.num_edges(), 2);

    let result = layout(store, config(), &LayoutOptions::default()).await;
    assert!(result.statistics.is_acyclic);
    assert_eq!(result.statistics.max_layer, 2);
}

#[tokio::test]
async fn test_empty_graph() {
    let result = layout(
        Arc::new(InMemoryLayoutStore::new()),
        config(),
        &LayoutOptions::default(),
    )
    .await;
    assert!(result.blocks.is_empty());
    assert!(result.levels.is_empty());
    assert_eq!(result.statistics.total_blocks, 0);
    assert!(result.statistics.is_acyclic);
}
