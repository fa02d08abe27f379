//! Scheduler step throughput: spawning N
//! cooperative tasks and gathering them, and a chain of sequential `Wait`s,
//! both driven through the FIFO ready queue a real `Spawn`-using program
//! exercises.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use doeff_core::ir::DoExpr;
use doeff_core::native::scheduler::{gather, scheduler_handler, spawn, wait};
use doeff_core::value::Value;
use doeff_core::{run, Bindings};

fn child(n: i64) -> DoExpr {
    DoExpr::pure(Value::Int(n))
}

fn bench_spawn_gather(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_gather");
    for width in [1usize, 10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            b.iter(|| {
                let mut program = DoExpr::pure(Value::List(std::sync::Arc::new(Vec::new())));
                for i in 0..width {
                    let spawn_i = spawn(child(i as i64));
                    program = program.flat_map(doeff_core::ir::bind_fn(move |acc| {
                        let Value::List(tasks) = acc else { unreachable!() };
                        let tasks = (*tasks).clone();
                        Ok(spawn_i.clone().flat_map(doeff_core::ir::bind_fn(move |t| {
                            let mut next = tasks.clone();
                            next.push(t);
                            Ok(DoExpr::pure(Value::List(std::sync::Arc::new(next))))
                        })))
                    }));
                }
                let program = program.flat_map(doeff_core::ir::bind_fn(|tasks| {
                    let Value::List(tasks) = tasks else { unreachable!() };
                    Ok(gather((*tasks).iter().map(|t| match t {
                        Value::Task(id) => *id,
                        _ => unreachable!(),
                    }).collect()))
                }));
                let result = run(program, vec![scheduler_handler()], Bindings::new(), Bindings::new());
                black_box(result.value)
            });
        });
    }
    group.finish();
}

fn bench_wait_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("wait_chain");
    for depth in [1usize, 10, 50] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                let mut program = spawn(child(0));
                for i in 0..depth {
                    program = program.flat_map(doeff_core::ir::bind_fn(move |t| {
                        let Value::Task(id) = t else { unreachable!() };
                        Ok(wait(id).then(spawn(child(i as i64))))
                    }));
                }
                program = program.flat_map(doeff_core::ir::bind_fn(|t| {
                    let Value::Task(id) = t else { unreachable!() };
                    Ok(wait(id))
                }));
                let result = run(program, vec![scheduler_handler()], Bindings::new(), Bindings::new());
                black_box(result.value)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_spawn_gather, bench_wait_chain);
criterion_main!(benches);
