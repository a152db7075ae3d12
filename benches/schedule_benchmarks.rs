//! Schedule primitive benchmarks: stage construction, split/fuse chains,
//! and cache_read insertion at increasing stage-graph sizes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tensor_schedule::ir::{call, compute_op, output_tensor, placeholder_op, Expr};
use tensor_schedule::itervar::{range_iter_var, IterVarType};
use tensor_schedule::schedule::Schedule;

fn chain_schedule(depth: usize) -> (Schedule, Vec<tensor_schedule::ir::Operation>) {
    let mut ops = Vec::with_capacity(depth + 1);
    let mut prev = placeholder_op("P0", vec![Expr::int(1024)]);
    ops.push(prev.clone());
    for n in 1..=depth {
        let prev_t = output_tensor(&prev, 0);
        let i = range_iter_var("i", Expr::int(1024), IterVarType::DataPar);
        let next = compute_op(
            format!("P{n}"),
            "",
            vec![i.clone()],
            vec![],
            vec![call(prev_t, vec![Expr::Var(i.var.clone())])],
        );
        ops.push(next.clone());
        prev = next;
    }
    let sched = Schedule::make(vec![prev]);
    (sched, ops)
}

fn bench_schedule_make(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule_make");
    for &depth in &[8usize, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &d| {
            b.iter(|| chain_schedule(d));
        });
    }
    group.finish();
}

fn bench_split_fuse_chain(c: &mut Criterion) {
    c.bench_function("split_fuse_chain_1024", |b| {
        b.iter(|| {
            let i = range_iter_var("i", Expr::int(1024), IterVarType::DataPar);
            let op = compute_op("S", "", vec![i.clone()], vec![], vec![Expr::int(0)]);
            let mut sched = Schedule::make(vec![op]);
            let stage = &mut sched.stages[0];
            let (outer, inner) = stage.split(&i, Expr::int(32)).unwrap();
            stage.fuse(&outer, &inner).unwrap();
        });
    });
}

fn bench_cache_read_insertion(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_read_insertion");
    for &depth in &[8usize, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &d| {
            b.iter(|| {
                let (mut sched, ops) = chain_schedule(d);
                let target = output_tensor(&ops[0], 0);
                let reader = ops[1].clone();
                sched.cache_read(&target, "shared", &[reader]).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_schedule_make, bench_split_fuse_chain, bench_cache_read_insertion);
criterion_main!(benches);
