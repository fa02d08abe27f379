//! `Perform`/dispatch throughput: a single native handler resuming
//! immediately, the same effect reached through several unrelated handlers
//! (masking has to walk past each), and a long `FlatMap` chain with no
//! effects at all as a baseline.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use doeff_core::handler::{HandlerEntry, NativeOutcome};
use doeff_core::ir::DoExpr;
use doeff_core::value::Value;
use doeff_core::{run, Bindings};
use indexmap::IndexMap;

fn echo_handler(name: &'static str, tag: &'static str) -> HandlerEntry {
    HandlerEntry::native(
        name,
        move |effect| effect.record_tag() == Some(tag),
        |_vm, effect, k| {
            let value = effect.field("value").cloned().unwrap_or(Value::Unit);
            Ok(NativeOutcome::Step(DoExpr::resume(k, value)))
        },
    )
}

fn perform(tag: &str, n: i64) -> DoExpr {
    let mut fields = IndexMap::new();
    fields.insert("value".to_string(), Value::Int(n));
    DoExpr::perform(Value::record(tag, fields))
}

fn bench_single_perform(c: &mut Criterion) {
    c.bench_function("perform_single_handler", |b| {
        b.iter(|| {
            let result = run(
                perform("Echo", 1),
                vec![echo_handler("echo", "Echo")],
                Bindings::new(),
                Bindings::new(),
            );
            black_box(result.value)
        });
    });
}

fn bench_nested_handlers(c: &mut Criterion) {
    let mut group = c.benchmark_group("perform_through_nested_handlers");
    for depth in [1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            let mut handlers: Vec<HandlerEntry> = (0..depth.saturating_sub(1))
                .map(|_| echo_handler("unused", "Unused"))
                .collect();
            handlers.push(echo_handler("echo", "Echo"));
            b.iter(|| {
                let result = run(
                    perform("Echo", 1),
                    handlers.clone(),
                    Bindings::new(),
                    Bindings::new(),
                );
                black_box(result.value)
            });
        });
    }
    group.finish();
}

fn bench_chained_flat_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("flat_map_chain");
    for len in [1usize, 10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            b.iter(|| {
                let mut expr = DoExpr::pure(Value::Int(0));
                for _ in 0..len {
                    expr = expr.flat_map(doeff_core::ir::bind_fn(|v| {
                        let n = v.as_int().unwrap_or(0);
                        Ok(DoExpr::pure(Value::Int(n + 1)))
                    }));
                }
                let result = run(expr, Vec::new(), Bindings::new(), Bindings::new());
                black_box(result.value)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_single_perform, bench_nested_handlers, bench_chained_flat_map);
criterion_main!(benches);
