//! Continuation registry and segment arena churn: capture/resume throughput
//! (one-shot use) and segment alloc/free, the two
//! structures a long-running program grows and shrinks on every `Perform`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use doeff_core::continuation::{CallMetadata, Continuation, ContinuationRegistry};
use doeff_core::segment::{Segment, SegmentArena};
use std::sync::Arc;

fn fresh_continuation(segment_id: usize) -> Continuation {
    Continuation::new(
        segment_id,
        Arc::new(Vec::new()),
        Arc::new(Vec::new()),
        None,
        Vec::new(),
        CallMetadata::default(),
        None,
    )
}

fn bench_register_and_take(c: &mut Criterion) {
    c.bench_function("continuation_register_take", |b| {
        b.iter(|| {
            let registry = ContinuationRegistry::new();
            let handle = registry.register(fresh_continuation(0));
            black_box(registry.take(handle).unwrap());
        });
    });
}

fn bench_registry_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("continuation_registry_live_set");
    for live in [1usize, 100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(live), &live, |b, &live| {
            b.iter(|| {
                let registry = ContinuationRegistry::new();
                let handles: Vec<_> = (0..live).map(|i| registry.register(fresh_continuation(i))).collect();
                for h in &handles {
                    black_box(registry.peek(*h));
                }
            });
        });
    }
    group.finish();
}

fn bench_second_take_fails_fast(c: &mut Criterion) {
    c.bench_function("continuation_second_take_rejected", |b| {
        b.iter(|| {
            let registry = ContinuationRegistry::new();
            let handle = registry.register(fresh_continuation(0));
            let _ = registry.take(handle);
            black_box(registry.take(handle).is_err());
        });
    });
}

fn bench_segment_arena(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_arena_alloc_free");
    for count in [1usize, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let mut arena = SegmentArena::new();
                let ids: Vec<_> = (0..count).map(|_| arena.alloc(Segment::root(Vec::new()))).collect();
                for id in ids {
                    arena.free(id);
                }
                black_box(arena.live_count())
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_register_and_take,
    bench_registry_scaling,
    bench_second_take_fails_fast,
    bench_segment_arena
);
criterion_main!(benches);
