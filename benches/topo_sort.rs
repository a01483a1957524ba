//! Performance benchmarks for the batched sorter and full layout runs.
//!
//! Run with: `cargo bench --bench topo_sort`
//!
//! ## What is measured
//!
//! | Benchmark | Varies | Notes |
//! |-----------|--------|-------|
//! | `compute_order` | batch size | Store round trips dominate small batches |
//! | `layout_run` | graph size | Sort, layer, group, encode and persist |

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use knowledge_map_layering::{
    DistributedLayoutCoordinator, Edge, GraphNode, InMemoryLayoutStore, LayoutOptions,
    NodeFilter, RunId, TopologicalSorter, WorkerConfig,
};

/// Layered graph: `depth` layers of `width` nodes, each node linked to two
/// nodes of the next layer.
fn layered_graph(width: usize, depth: usize) -> InMemoryLayoutStore {
    let id = |layer: usize, i: usize| format!("n{layer:04}_{i:04}");
    let store = InMemoryLayoutStore::new();
    for layer in 0..depth {
        for i in 0..width {
            store.add_node(GraphNode::new(id(layer, i)));
            if layer > 0 {
                store.add_edge(Edge::new(id(layer - 1, i), id(layer, i)));
                store.add_edge(Edge::new(id(layer - 1, (i * 7 + 3) % width), id(layer, i)));
            }
        }
    }
    store
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Benchmark the sorter alone at several batch sizes.
fn bench_compute_order(c: &mut Criterion) {
    let rt = runtime();
    let store = layered_graph(100, 50);

    let mut group = c.benchmark_group("compute_order");
    group.throughput(Throughput::Elements(5_000));
    group.sample_size(20);

    for batch_size in [10, 100, 1_000, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("batch_size", batch_size),
            &batch_size,
            |b, &batch_size| {
                b.to_async(&rt).iter(|| async {
                    let run = RunId::new();
                    let report = TopologicalSorter::new(&store, batch_size)
                        .compute_order(&run, &NodeFilter::all())
                        .await
                        .unwrap();
                    black_box(report)
                })
            },
        );
    }

    group.finish();
}

/// Benchmark complete runs through the coordinator.
fn bench_layout_run(c: &mut Criterion) {
    let rt = runtime();

    let mut group = c.benchmark_group("layout_run");
    group.sample_size(10);

    for width in [10, 50, 100] {
        let store = Arc::new(layered_graph(width, 20));
        let coordinator = rt.block_on(async {
            DistributedLayoutCoordinator::in_process(Arc::clone(&store), WorkerConfig::default())
        });

        group.throughput(Throughput::Elements((width * 20) as u64));
        group.bench_with_input(BenchmarkId::new("nodes", width * 20), &width, |b, _| {
            b.to_async(&rt).iter(|| async {
                let result = coordinator
                    .calculate_layout(&NodeFilter::all(), &LayoutOptions::default())
                    .await
                    .unwrap();
                black_box(result.layout_hash)
            })
        });

        rt.block_on(coordinator.shutdown());
    }

    group.finish();
}

criterion_group!(benches, bench_compute_order, bench_layout_run);
criterion_main!(benches);
