//! Query Engine Benchmarks
//!
//! Measures single, pairwise and multi-op queries over an index with a million
//! objects, plus snapshot and replication passes.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tagbox::durability::{save_snapshot, Replicator};
use tagbox::{MemoryStore, QueryOp, TagIndex};

// =============================================================================
// Index Generators
// =============================================================================

/// Every object gets a deterministic mix of dense and sparse tags
fn create_index(objects: u32) -> TagIndex {
    let index = TagIndex::new();

    let vip: Vec<u32> = (0..objects).filter(|i| i % 10 == 0).collect();
    let male: Vec<u32> = (0..objects).filter(|i| i % 2 == 0).collect();
    let female: Vec<u32> = (0..objects).filter(|i| i % 2 == 1).collect();
    let active: Vec<u32> = (0..objects).filter(|i| i % 3 != 0).collect();
    let new_user: Vec<u32> = (0..objects).filter(|i| i % 97 == 0).collect();

    index.batch_add_objects_to_tag(&vip, "vip");
    index.batch_add_objects_to_tag(&male, "male");
    index.batch_add_objects_to_tag(&female, "female");
    index.batch_add_objects_to_tag(&active, "active");
    index.batch_add_objects_to_tag(&new_user, "new_user");
    index
}

// =============================================================================
// Query Benchmarks
// =============================================================================

fn bench_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("queries");

    for objects in [100_000u32, 1_000_000] {
        let index = create_index(objects);
        let engine = index.engine();
        group.throughput(Throughput::Elements(objects as u64));

        group.bench_with_input(BenchmarkId::new("single", objects), &objects, |b, _| {
            b.iter(|| black_box(engine.query("male")))
        });

        group.bench_with_input(BenchmarkId::new("and", objects), &objects, |b, _| {
            b.iter(|| black_box(engine.query_and(&["vip", "male", "active"])))
        });

        group.bench_with_input(BenchmarkId::new("or", objects), &objects, |b, _| {
            b.iter(|| black_box(engine.query_or(&["vip", "new_user"])))
        });

        group.bench_with_input(BenchmarkId::new("not_in_system", objects), &objects, |b, _| {
            b.iter(|| black_box(engine.query_not_in_system("active")))
        });

        group.bench_with_input(BenchmarkId::new("xor", objects), &objects, |b, _| {
            b.iter(|| black_box(engine.query_xor("vip", "active")))
        });

        let ops = vec![
            QueryOp::and(["vip", "male"]),
            QueryOp::or(["active", "new_user"]),
            QueryOp::not("female"),
        ];
        group.bench_with_input(BenchmarkId::new("complex", objects), &objects, |b, _| {
            b.iter(|| black_box(engine.complex_query(&ops).unwrap()))
        });
    }

    group.finish();
}

fn bench_mutations(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutations");
    let index = create_index(100_000);
    let mut next = 200_000u32;

    group.bench_function("add_tag", |b| {
        b.iter(|| {
            next = next.wrapping_add(1);
            index.add_tag(black_box(next), "vip");
        })
    });

    group.bench_function("batch_add_tags", |b| {
        b.iter(|| {
            next = next.wrapping_add(1);
            index.batch_add_tags(black_box(next), &["male", "active", "new_user"]);
        })
    });

    group.finish();
}

// =============================================================================
// Durability Benchmarks
// =============================================================================

fn bench_durability(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("durability");
    group.sample_size(20);

    let index = Arc::new(create_index(1_000_000));
    let replicator = Replicator::new(index.clone(), Arc::new(MemoryStore::new()), "tags:");

    group.bench_function("replicate_all", |b| {
        b.iter(|| rt.block_on(async { black_box(replicator.replicate_all().await.unwrap()) }))
    });

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("bench.json");
    group.bench_function("save_snapshot", |b| {
        b.iter(|| black_box(save_snapshot(&index, &path).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_queries, bench_mutations, bench_durability);
criterion_main!(benches);
