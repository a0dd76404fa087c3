//! Integration tests for the lowering pipeline.
//!
//! Every lowered pipeline here is executed by the interpreter and compared
//! against direct evaluation of the stage definitions.

use pipelower::analysis::{const_value, Interval};
use pipelower::interp::{evaluate, run_pipeline, Buffer, ExecStats};
use pipelower::prelude::*;
use pipelower::print_loop_nest;
use pipelower::transform::storage_folding::FoldPlan;
use std::collections::BTreeMap;

fn x() -> Expr {
    Expr::var("x")
}

fn y() -> Expr {
    Expr::var("y")
}

fn call(stage: &str, args: Vec<Expr>) -> Expr {
    Expr::call(stage, args)
}

fn input_1d(mins: i64, extent: i64) -> BTreeMap<String, Buffer> {
    let mut m = BTreeMap::new();
    m.insert("in".to_string(), Buffer::from_fn(vec![mins], vec![extent], |p| (p[0] * 7 + 3) % 23));
    m
}

fn input_2d() -> BTreeMap<String, Buffer> {
    let mut m = BTreeMap::new();
    m.insert(
        "in".to_string(),
        Buffer::from_fn(vec![-4, -4], vec![24, 24], |p| (p[0] * 5 + p[1] * 11) % 17),
    );
    m
}

/// Lower, run, and compare every output with the reference evaluator.
fn lower_and_check(
    graph: &StageGraph,
    outputs: &[OutputRequest],
    config: &LowerConfig,
    inputs: &BTreeMap<String, Buffer>,
) -> (LoweredPipeline, ExecStats) {
    let lowered = pipelower::lower("test", graph, outputs, config).unwrap();
    let (results, stats) = run_pipeline(&lowered, inputs).unwrap();
    for request in outputs {
        let stage = graph.stage(request.stage);
        let expected = evaluate(graph, inputs, request).unwrap();
        for (v, buffer) in expected.iter().enumerate() {
            assert_eq!(&results[&stage.buffer_name(v)], buffer, "values of {}", stage.buffer_name(v));
        }
    }
    (lowered, stats)
}

fn count_loops(s: &Stmt) -> usize {
    let mut n = 0;
    s.visit(&mut |s| {
        if matches!(s, Stmt::For { .. }) {
            n += 1;
        }
    });
    n
}

#[test]
fn test_single_stage_over_input() {
    // out(x) = in(x) + in(x + 1) over [0, 100)
    let mut g = StageGraph::new();
    g.add_input("in", &["x"]);
    let out = g.add_stage("out", &["x"], call("in", vec![x()]) + call("in", vec![x() + 1]));
    let request = OutputRequest::constant(out, &[(0, 100)]);

    let (p, stats) = lower_and_check(&g, &[request], &LowerConfig::default(), &input_1d(0, 101));
    assert_eq!(p.regions["in"], vec![Interval::new(Expr::int(0), Expr::int(100))]);
    assert_eq!(count_loops(&p.body), 1);
    match p.body.find_loop("out.s0.x") {
        Some(Stmt::For { min, extent, kind, .. }) => {
            assert_eq!(min, &Expr::int(0));
            assert_eq!(extent, &Expr::int(100));
            assert_eq!(*kind, ForKind::Serial);
        }
        other => panic!("expected loop, got {:?}", other),
    }
    assert_eq!(stats.stores_to("out"), 100);
    assert!(print_loop_nest(&p.body).starts_with("produce out:\n  for out.s0.x:"));
}

#[test]
fn test_input_too_small_fails_assertion() {
    let mut g = StageGraph::new();
    g.add_input("in", &["x"]);
    let out = g.add_stage("out", &["x"], call("in", vec![x()]) + call("in", vec![x() + 1]));
    let p = pipelower::lower("test", &g, &[OutputRequest::constant(out, &[(0, 100)])], &LowerConfig::default())
        .unwrap();
    let err = run_pipeline(&p, &input_1d(0, 100)).unwrap_err();
    assert!(matches!(err, ExecError::AssertionFailed(_)));
}

#[test]
fn test_stencil_computed_per_tile() {
    // f(x) = in(x) * 2; g(x) = f(x - 1) + f(x) + f(x + 1), f at g's tile loop
    let mut g = StageGraph::new();
    g.add_input("in", &["x"]);
    let f = g.add_stage("f", &["x"], call("in", vec![x()]) * 2);
    let gs = g.add_stage(
        "g",
        &["x"],
        call("f", vec![x() - 1]) + call("f", vec![x()]) + call("f", vec![x() + 1]),
    );
    g.definition_schedule(gs, 0).split("x", "xo", "xi", 8);
    g.schedule(f).compute_at(gs, "xo");

    let request = OutputRequest::constant(gs, &[(0, 64)]);
    let (p, stats) = lower_and_check(&g, &[request], &LowerConfig::default(), &input_1d(-1, 66));
    // eight tiles, each computing the tile plus the stencil radius on both sides
    assert_eq!(stats.stores_to("f"), 80);
    assert_eq!(stats.allocations["f"], 10);
    assert_eq!(stats.stores_to("g"), 64);
    let nest = print_loop_nest(&p.body);
    assert!(nest.contains("for g.s0.xo:\n    store f:\n      produce f:\n        for f.s0.x:"));
}

fn parallel_stencil(store_root: bool) -> (StageGraph, StageId, StageId) {
    // out(x, y) = f(x, y - 1) + f(x, y) + f(x, y + 1)
    let mut g = StageGraph::new();
    g.add_input("in", &["x", "y"]);
    let f = g.add_stage("f", &["x", "y"], call("in", vec![x(), y()]) + x());
    let out = g.add_stage(
        "out",
        &["x", "y"],
        call("f", vec![x(), y() - 1]) + call("f", vec![x(), y()]) + call("f", vec![x(), y() + 1]),
    );
    g.schedule(f).compute_at(out, "y");
    if store_root {
        g.schedule(f).store_root();
    }
    g.definition_schedule(out, 0).parallel("y");
    (g, f, out)
}

#[test]
fn test_parallel_sliding_window_is_folded_and_synchronized() {
    let (g, _, out) = parallel_stencil(true);
    let request = OutputRequest::constant(out, &[(0, 8), (0, 8)]);
    let (p, stats) = lower_and_check(&g, &[request], &LowerConfig::default(), &input_2d());

    assert_eq!(p.slides.len(), 1);
    assert_eq!(p.slides[0].loop_name, "out.s0.y");
    assert_eq!(p.folds, vec![FoldPlan { stage: "f".into(), dim: 1, factor: 4, explicit: false }]);
    // each row of f is computed once: 8 rows plus the two halo rows
    assert_eq!(stats.stores_to("f"), 8 * 10);
    assert_eq!(stats.allocations["f"], 8 * 4);

    let text = p.body.to_string();
    assert_eq!(text.matches("semaphore ").count(), 2);
    assert_eq!(text.matches("wait(f.produced").count(), 1);
    assert_eq!(text.matches("signal(f.produced").count(), 1);
    assert_eq!(text.matches("wait(f.consumed").count(), 2);
    assert_eq!(text.matches("signal(f.consumed").count(), 1);
}

#[test]
fn test_without_reuse_recomputes_rows() {
    let (g, _, out) = parallel_stencil(true);
    let request = OutputRequest::constant(out, &[(0, 8), (0, 8)]);
    let (p, stats) = lower_and_check(&g, &[request], &LowerConfig::without_reuse(), &input_2d());
    assert!(p.slides.is_empty());
    assert!(p.folds.is_empty());
    assert_eq!(stats.stores_to("f"), 8 * 8 * 3);
    assert!(!p.body.to_string().contains("semaphore"));
}

#[test]
fn test_serial_slide_has_no_semaphores() {
    let mut g = StageGraph::new();
    g.add_input("in", &["x", "y"]);
    let f = g.add_stage("f", &["x", "y"], call("in", vec![x(), y()]) * 3);
    let out = g.add_stage("out", &["x", "y"], call("f", vec![x(), y()]) - call("f", vec![x(), y() + 2]));
    g.schedule(f).compute_at(out, "y").store_root();
    let request = OutputRequest::constant(out, &[(0, 6), (0, 10)]);
    let (p, stats) = lower_and_check(&g, &[request], &LowerConfig::default(), &input_2d());
    assert_eq!(p.folds[0].factor, 4);
    assert_eq!(stats.stores_to("f"), 6 * 12);
    assert!(!p.body.to_string().contains("semaphore"));
}

#[test]
fn test_explicit_fold() {
    let (mut g, f, out) = parallel_stencil(true);
    g.definition_schedule(out, 0).directives.clear();
    g.schedule(f).fold_storage("y", 3);
    let config = LowerConfig { enable_storage_folding: false, ..LowerConfig::default() };
    let request = OutputRequest::constant(out, &[(0, 8), (0, 8)]);
    let (p, stats) = lower_and_check(&g, &[request], &config, &input_2d());
    assert_eq!(p.folds, vec![FoldPlan { stage: "f".into(), dim: 1, factor: 3, explicit: true }]);
    assert_eq!(stats.allocations["f"], 8 * 3);
}

#[test]
fn test_fold_too_small_is_rejected() {
    let (mut g, f, out) = parallel_stencil(true);
    g.schedule(f).fold_storage("y", 2);
    let err = pipelower::lower("test", &g, &[OutputRequest::constant(out, &[(0, 8), (0, 8)])], &LowerConfig::default())
        .unwrap_err();
    match err {
        LowerError::FoldSafety(e) => assert_eq!(e.kind, FoldErrorKind::FactorTooSmall),
        other => panic!("unexpected {}", other),
    }
}

#[test]
fn test_split_then_fuse_visits_every_point() {
    // out(x) = in(x) * 2, split by 4 then fused back
    for (extent, stores) in [(12, 12), (10, 12)] {
        let mut g = StageGraph::new();
        g.add_input("in", &["x"]);
        let out = g.add_stage("out", &["x"], call("in", vec![x()]) * 2);
        g.definition_schedule(out, 0).split("x", "xo", "xi", 4).fuse("xi", "xo", "xf");
        let request = OutputRequest::constant(out, &[(0, extent)]);
        let (p, stats) = lower_and_check(&g, &[request], &LowerConfig::default(), &input_1d(0, extent));
        assert_eq!(count_loops(&p.body), 1);
        match p.body.find_loop("out.s0.xf") {
            Some(Stmt::For { extent: e, .. }) => assert_eq!(const_value(e), Some(12)),
            other => panic!("expected fused loop, got {:?}", other),
        }
        // A tail shifted inwards recomputes the last points.
        assert_eq!(stats.stores_to("out"), stores);
    }
}

#[test]
fn test_updates_run_in_declaration_order() {
    // f(x) = x; f(x) = f(x) * 2; f(x) = f(x) + 1
    let mut g = StageGraph::new();
    let f = g.add_stage("f", &["x"], x());
    g.add_update(f, vec![x()], vec![call("f", vec![x()]) * 2], None);
    g.add_update(f, vec![x()], vec![call("f", vec![x()]) + 1], None);
    let request = OutputRequest::constant(f, &[(0, 5)]);
    let p = pipelower::lower("test", &g, &[request], &LowerConfig::default()).unwrap();
    let (results, _) = run_pipeline(&p, &BTreeMap::new()).unwrap();
    assert_eq!(results["f"].data, vec![1, 3, 5, 7, 9]);
    assert!(print_loop_nest(&p.body).contains("update f:\n  for f.s1.x:"));
}

#[test]
fn test_running_sum_consumed_by_another_stage() {
    // f(x) = in(x); f(r) = f(r - 1) + f(r) for r in [1, 8); out(x) = f(x) * 10
    let mut g = StageGraph::new();
    g.add_input("in", &["x"]);
    let f = g.add_stage("f", &["x"], call("in", vec![x()]));
    let r = Expr::var("r");
    g.add_update(
        f,
        vec![r.clone()],
        vec![call("f", vec![r.clone() - 1]) + call("f", vec![r])],
        Some(ReductionDomain::new(&[("r", 1, 7)])),
    );
    let out = g.add_stage("out", &["x"], call("f", vec![x()]) * 10);
    g.schedule(f).compute_root();
    let request = OutputRequest::constant(out, &[(0, 8)]);
    let inputs = input_1d(0, 8);
    let (_, stats) = lower_and_check(&g, &[request.clone()], &LowerConfig::default(), &inputs);
    assert_eq!(stats.stores_to("f"), 8 + 7);

    let sums = evaluate(&g, &inputs, &request).unwrap();
    let mut acc = 0;
    for (i, v) in inputs["in"].data.iter().enumerate() {
        acc += v;
        assert_eq!(sums[0].data[i], acc * 10);
    }
}

fn accumulated_stencil(store_root: bool) -> (StageGraph, StageId) {
    // f(x) = in(x) * 2; out(x) = 0; out(x) = out(x) + f(x) + f(x + 1), f at the update's loop
    let mut g = StageGraph::new();
    g.add_input("in", &["x"]);
    let f = g.add_stage("f", &["x"], call("in", vec![x()]) * 2);
    let out = g.add_stage("out", &["x"], Expr::int(0));
    g.add_update(
        out,
        vec![x()],
        vec![call("out", vec![x()]) + call("f", vec![x()]) + call("f", vec![x() + 1])],
        None,
    );
    g.schedule(f).compute_at_definition(out, 1, "x");
    if store_root {
        g.schedule(f).store_root();
    }
    (g, out)
}

#[test]
fn test_compute_at_update_loop() {
    let (g, out) = accumulated_stencil(false);
    let request = OutputRequest::constant(out, &[(0, 8)]);
    let (p, stats) = lower_and_check(&g, &[request], &LowerConfig::default(), &input_1d(0, 9));
    assert_eq!(stats.stores_to("f"), 8 * 2);
    assert_eq!(stats.stores_to("out"), 8 + 8);
    assert!(p.slides.is_empty());
    let nest = print_loop_nest(&p.body);
    assert!(nest.contains("update out:\n  for out.s1.x:\n    store f:\n      produce f:\n        for f.s0.x:"));
    assert!(!nest.contains("for out.s0.x:\n    store f:"));
}

#[test]
fn test_compute_at_update_loop_slides_with_root_storage() {
    let (g, out) = accumulated_stencil(true);
    let request = OutputRequest::constant(out, &[(0, 8)]);
    let (p, stats) = lower_and_check(&g, &[request], &LowerConfig::default(), &input_1d(0, 9));
    assert_eq!(p.slides.len(), 1);
    assert_eq!(p.slides[0].loop_name, "out.s1.x");
    // the first iteration computes two points, every later one a single new point
    assert_eq!(stats.stores_to("f"), 9);
    let nest = print_loop_nest(&p.body);
    assert!(nest.starts_with("store f:"));
    assert!(nest.contains("update out:\n    for out.s1.x:\n      produce f:"));
}

#[test]
fn test_compute_inline_overrides_earlier_levels() {
    let mut g = StageGraph::new();
    g.add_input("in", &["x"]);
    let f = g.add_stage("f", &["x"], call("in", vec![x()]) * 2);
    let out = g.add_stage("out", &["x"], call("f", vec![x()]) + call("f", vec![x() + 1]));
    g.schedule(f).compute_root().store_root().compute_inline();
    assert!(g.stage(f).schedule.compute_level.is_inlined());
    assert_eq!(g.stage(f).schedule.store_level, None);

    let request = OutputRequest::constant(out, &[(0, 6)]);
    let (p, stats) = lower_and_check(&g, &[request], &LowerConfig::default(), &input_1d(0, 7));
    assert!(!p.body.contains_producer("f"));
    assert!(!p.regions.contains_key("f"));
    assert_eq!(stats.stores_to("f"), 0);
    assert_eq!(stats.stores_to("out"), 6);
}

#[test]
fn test_histogram_with_predicate() {
    let mut g = StageGraph::new();
    g.add_input("in", &["x"]);
    let hist = g.add_stage("hist", &["b"], Expr::int(0));
    let bucket = Expr::modulo(call("in", vec![Expr::var("r")]), Expr::int(4));
    let rdom = ReductionDomain::new(&[("r", 0, 20)])
        .with_predicate(Expr::lt(Expr::int(2), call("in", vec![Expr::var("r")])));
    g.add_update(hist, vec![bucket.clone()], vec![call("hist", vec![bucket]) + 1], Some(rdom));
    let request = OutputRequest::constant(hist, &[(0, 4)]);
    lower_and_check(&g, &[request], &LowerConfig::default(), &input_1d(0, 20));
}

#[test]
fn test_tuple_stage() {
    let mut g = StageGraph::new();
    g.add_input("in", &["x"]);
    let f = g.add_tuple_stage("f", &["x"], vec![call("in", vec![x()]), call("in", vec![x()]) * -1]);
    let out = g.add_stage(
        "out",
        &["x"],
        Expr::call_value("f", vec![x()], 0) - Expr::call_value("f", vec![x() + 1], 1),
    );
    g.schedule(f).compute_root();
    let request = OutputRequest::constant(out, &[(0, 12)]);
    let (_, stats) = lower_and_check(&g, &[request], &LowerConfig::default(), &input_1d(0, 13));
    assert_eq!(stats.stores_to("f.0"), 13);
    assert_eq!(stats.stores_to("f.1"), 13);
}

#[test]
fn test_gpu_kernel_is_bracketed_by_transfers() {
    let mut g = StageGraph::new();
    g.add_input("in", &["x"]);
    let out = g.add_stage("out", &["x"], call("in", vec![x()]) + 1);
    g.definition_schedule(out, 0).gpu_tile("x", "xb", "xt", 4);
    let config = LowerConfig::for_target(Target::cuda());
    let request = OutputRequest::constant(out, &[(0, 16)]);
    let (p, _) = lower_and_check(&g, &[request], &config, &input_1d(0, 16));
    let text = p.body.to_string();
    let to_device = text.find("copy_to_device in(").unwrap();
    let launch = text.find("gpu_block for").unwrap();
    let sync = text.find("device_sync").unwrap();
    let to_host = text.find("copy_to_host out(").unwrap();
    assert!(to_device < launch && launch < sync && sync < to_host);
}

#[test]
fn test_vector_width_wider_than_output() {
    let mut g = StageGraph::new();
    g.add_input("in", &["x"]);
    let out = g.add_stage("out", &["x"], call("in", vec![x()]) + 1);
    g.definition_schedule(out, 0).vectorize("x", Some(8));
    let err = pipelower::lower("test", &g, &[OutputRequest::constant(out, &[(0, 5)])], &LowerConfig::default())
        .unwrap_err();
    match err {
        LowerError::Schedule(e) => {
            assert_eq!(e.kind, ScheduleErrorKind::InvalidFactor);
            assert_eq!(e.stage, "out");
        }
        other => panic!("unexpected {}", other),
    }

    let request = OutputRequest::constant(out, &[(0, 11)]);
    let (_, stats) = lower_and_check(&g, &[request], &LowerConfig::default(), &input_1d(0, 11));
    // the last vector is shifted inwards and overlaps the first
    assert_eq!(stats.stores_to("out"), 16);
}

#[test]
fn test_gpu_schedule_needs_gpu_target() {
    let mut g = StageGraph::new();
    let out = g.add_stage("out", &["x"], x());
    g.definition_schedule(out, 0).gpu_blocks("x");
    let err = pipelower::lower("test", &g, &[OutputRequest::constant(out, &[(0, 4)])], &LowerConfig::default())
        .unwrap_err();
    match err {
        LowerError::Schedule(e) => assert_eq!(e.kind, ScheduleErrorKind::UnsupportedByTarget),
        other => panic!("unexpected {}", other),
    }
}

#[test]
fn test_same_values_under_every_schedule() {
    let build = |choice: usize| {
        let mut g = StageGraph::new();
        g.add_input("in", &["x", "y"]);
        let f = g.add_stage("f", &["x", "y"], call("in", vec![x() + 1, y()]) - call("in", vec![x(), y()]));
        let out = g.add_stage(
            "out",
            &["x", "y"],
            call("f", vec![x(), y()]) * 3 + call("f", vec![x() + 2, y() + 1]),
        );
        match choice {
            0 => {}
            1 => {
                g.schedule(f).compute_root();
            }
            2 => {
                g.schedule(f).compute_at(out, "y");
            }
            3 => {
                g.schedule(f).compute_at(out, "y").store_root();
                g.definition_schedule(out, 0).vectorize("x", Some(4));
            }
            4 => {
                g.schedule(f).compute_at(out, "xo");
                g.definition_schedule(out, 0).tile("x", "y", "xo", "yo", "xi", "yi", 4, 4);
            }
            5 => {
                g.schedule(f).compute_root();
                g.definition_schedule(f, 0).parallel("y").unroll("x", Some(2));
                g.definition_schedule(out, 0).fuse("x", "y", "xy").parallel("xy");
            }
            _ => {
                g.schedule(f).compute_at(out, "yi").store_at(out, "yo");
                g.definition_schedule(out, 0).split("y", "yo", "yi", 3).reorder(&["yo", "yi", "x"]);
            }
        }
        (g, out)
    };
    let inputs = input_2d();
    let mut reference = None;
    for choice in 0..7 {
        let (g, out) = build(choice);
        let request = OutputRequest::constant(out, &[(0, 9), (0, 7)]);
        let p = pipelower::lower("test", &g, &[request.clone()], &LowerConfig::default()).unwrap();
        let (results, _) = run_pipeline(&p, &inputs).unwrap();
        let expected = evaluate(&g, &inputs, &request).unwrap();
        assert_eq!(results["out"], expected[0], "schedule {}", choice);
        match &reference {
            None => reference = Some(results["out"].clone()),
            Some(r) => assert_eq!(&results["out"], r, "schedule {}", choice),
        }
    }
}

#[test]
fn test_data_dependent_access() {
    let mut g = StageGraph::new();
    g.add_input("in", &["x"]);
    let bad = g.add_stage("out", &["x"], call("in", vec![call("in", vec![x()])]));
    let err = pipelower::lower("test", &g, &[OutputRequest::constant(bad, &[(0, 4)])], &LowerConfig::default())
        .unwrap_err();
    match err {
        LowerError::Bounds(e) => assert_eq!(e.kind, BoundsErrorKind::Unbounded),
        other => panic!("unexpected {}", other),
    }

    let mut g = StageGraph::new();
    g.add_input("in", &["x"]);
    let clamped = Expr::clamp(call("in", vec![x()]), Expr::int(0), Expr::int(19));
    let out = g.add_stage("out", &["x"], call("in", vec![clamped]));
    let request = OutputRequest::constant(out, &[(0, 10)]);
    let (p, _) = lower_and_check(&g, &[request], &LowerConfig::default(), &input_1d(0, 20));
    assert_eq!(p.regions["in"], vec![Interval::new(Expr::int(0), Expr::int(19))]);
}

#[test]
fn test_overflowing_region_is_rejected() {
    // out(x) = in(x * 4): the last read of a [0, 2^62) output does not fit in i64
    let mut g = StageGraph::new();
    g.add_input("in", &["x"]);
    let out = g.add_stage("out", &["x"], call("in", vec![x() * 4]));
    let err = pipelower::lower("test", &g, &[OutputRequest::constant(out, &[(0, 1 << 62)])], &LowerConfig::default())
        .unwrap_err();
    match err {
        LowerError::Bounds(e) => {
            assert_eq!(e.kind, BoundsErrorKind::Overflow);
            assert_eq!(e.stage, "in");
        }
        other => panic!("unexpected {}", other),
    }

    let p = pipelower::lower("test", &g, &[OutputRequest::constant(out, &[(0, 1 << 60)])], &LowerConfig::default())
        .unwrap();
    assert_eq!(p.regions["in"], vec![Interval::new(Expr::int(0), Expr::int(((1i64 << 60) - 1) * 4))]);
}

#[test]
fn test_graph_errors() {
    let mut g = StageGraph::new();
    let f = g.add_stage("f", &["x"], call("g", vec![x()]));
    let gs = g.add_stage("g", &["x"], call("f", vec![x()]));
    g.schedule(f).compute_root();
    g.schedule(gs).compute_root();
    let out = g.add_stage("out", &["x"], call("f", vec![x()]));
    let err = pipelower::lower("test", &g, &[OutputRequest::constant(out, &[(0, 4)])], &LowerConfig::default())
        .unwrap_err();
    match err {
        LowerError::Graph(e) => assert_eq!(e.kind, GraphErrorKind::Cycle),
        other => panic!("unexpected {}", other),
    }

    let mut g = StageGraph::new();
    let f = g.add_stage("f", &["x"], x());
    let out = g.add_stage("out", &["x"], call("f", vec![x()]));
    g.schedule(f).compute_at(out, "nope");
    let err = pipelower::lower("test", &g, &[OutputRequest::constant(out, &[(0, 4)])], &LowerConfig::default())
        .unwrap_err();
    assert!(matches!(err, LowerError::Graph(_) | LowerError::Schedule(_)), "{}", err);
    assert_eq!(err.stage(), Some("f"));
}

#[test]
fn test_lowered_pipeline_serializes() {
    let (g, _, out) = parallel_stencil(true);
    let p = pipelower::lower("stencil", &g, &[OutputRequest::constant(out, &[(0, 8), (0, 8)])], &LowerConfig::default())
        .unwrap();
    let json = serde_json::to_value(&p).unwrap();
    assert_eq!(json["name"], "stencil");
    assert_eq!(json["order"], serde_json::json!(["in", "f", "out"]));
    assert_eq!(json["folds"][0]["factor"], 4);
}
