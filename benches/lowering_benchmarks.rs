//! Benchmarks for lowering and for the interpreter.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pipelower::analysis::{bounds_of_expr, simplify, Interval, Scope};
use pipelower::prelude::*;
use std::collections::BTreeMap;

/// Separable 3x3 blur: blur_x computed per row of blur_y.
fn blur(sliding: bool) -> (StageGraph, StageId) {
    let (x, y) = (Expr::var("x"), Expr::var("y"));
    let mut g = StageGraph::new();
    g.add_input("in", &["x", "y"]);
    let bx = g.add_stage(
        "blur_x",
        &["x", "y"],
        Expr::call("in", vec![x.clone() - 1, y.clone()])
            + Expr::call("in", vec![x.clone(), y.clone()])
            + Expr::call("in", vec![x.clone() + 1, y.clone()]),
    );
    let by = g.add_stage(
        "blur_y",
        &["x", "y"],
        Expr::call("blur_x", vec![x.clone(), y.clone() - 1])
            + Expr::call("blur_x", vec![x.clone(), y.clone()])
            + Expr::call("blur_x", vec![x, y + 1]),
    );
    g.definition_schedule(by, 0).vectorize("x", Some(8));
    let s = g.schedule(bx).compute_at(by, "y");
    if sliding {
        s.store_root();
    }
    (g, by)
}

fn bench_lowering(c: &mut Criterion) {
    let (graph, out) = blur(true);
    let request = [OutputRequest::constant(out, &[(0, 256), (0, 256)])];
    let config = LowerConfig::default();

    c.bench_function("lower_blur_sliding", |b| {
        b.iter(|| pipelower::lower("blur", black_box(&graph), black_box(&request), &config).unwrap())
    });

    let target = LowerConfig::for_target(Target::cuda());
    let mut gpu = StageGraph::new();
    gpu.add_input("in", &["x", "y"]);
    let (x, y) = (Expr::var("x"), Expr::var("y"));
    let f = gpu.add_stage("f", &["x", "y"], Expr::call("in", vec![x.clone(), y.clone()]) * 2 + x - y);
    gpu.definition_schedule(f, 0).gpu_tile("x", "xb", "xt", 16).gpu_tile("y", "yb", "yt", 16);
    let request = [OutputRequest::constant(f, &[(0, 512), (0, 512)])];

    c.bench_function("lower_gpu_tiles", |b| {
        b.iter(|| pipelower::lower("gpu", black_box(&gpu), black_box(&request), &target).unwrap())
    });
}

fn bench_execution(c: &mut Criterion) {
    let mut inputs = BTreeMap::new();
    inputs.insert(
        "in".to_string(),
        Buffer::from_fn(vec![-1, -1], vec![66, 66], |p| (p[0] * 3 + p[1] * 7) % 11),
    );
    let config = LowerConfig::default();

    for (name, sliding) in [("run_blur_sliding", true), ("run_blur_recompute", false)] {
        let (graph, out) = blur(sliding);
        let lowered =
            pipelower::lower("blur", &graph, &[OutputRequest::constant(out, &[(0, 64), (0, 64)])], &config).unwrap();
        c.bench_function(name, |b| b.iter(|| run_pipeline(black_box(&lowered), &inputs).unwrap()));
    }
}

fn bench_analysis(c: &mut Criterion) {
    let (x, y) = (Expr::var("x"), Expr::var("y"));
    let e = Expr::min(
        Expr::div(x.clone() * 4 + y.clone() * 8 + 3, Expr::int(4)),
        Expr::max(x.clone() - y.clone(), Expr::modulo(x.clone() + 7, Expr::int(5))),
    ) + (x.clone() + 1 - x.clone()) * y.clone();

    c.bench_function("simplify_mixed", |b| b.iter(|| simplify(black_box(&e))));

    let mut scope = Scope::new();
    scope.push("x", Interval::new(Expr::int(0), Expr::var("n") - 1));
    scope.push("y", Interval::new(Expr::int(-2), Expr::int(2)));
    c.bench_function("bounds_of_mixed", |b| b.iter(|| bounds_of_expr(black_box(&e), &scope)));
}

criterion_group!(benches, bench_lowering, bench_execution, bench_analysis);
criterion_main!(benches);
