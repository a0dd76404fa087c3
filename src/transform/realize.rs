//! Realization injection.
//!
//! Builds the statement tree of the whole pipeline: the loop nests of every
//! realized stage, each wrapped in a `ProducerConsumer` node at its compute
//! level and a `Realize` node at its store level. Stages are injected in
//! reverse realization order, so every stage is placed around (or inside)
//! the already-built statements of its consumers.

use crate::analysis::order::RealizationOrder;
use crate::ir::schedule::LoopLevel;
use crate::ir::stage::{OutputRequest, Stage, StageGraph, StageId};
use crate::ir::stmt::{Range, Stmt};
use crate::transform::inline::is_inlined;
use crate::transform::loops::{check_region_widths, definition_nest, loop_name, NestOptions};
use crate::utils::errors::{GraphError, GraphErrorKind, LowerResult, ScheduleError, ScheduleErrorKind};
use log::debug;

fn level_loop(graph: &StageGraph, level: &LoopLevel) -> Option<String> {
    match level {
        LoopLevel::At { stage, definition, var } => Some(loop_name(&graph.stage(*stage).name, *definition, var)),
        _ => None,
    }
}

fn level_error(stage: &Stage, message: String) -> ScheduleError {
    ScheduleError::new(ScheduleErrorKind::InvalidLevel, &stage.name, message)
}

/// True if `s` reads `stage` anywhere except inside its own producer.
fn calls_outside_producer(s: &Stmt, stage: &str) -> bool {
    if matches!(s, Stmt::ProducerConsumer { name, .. } if name == stage) {
        return false;
    }
    s.exprs().iter().any(|e| e.calls(stage)) || s.children().iter().any(|c| calls_outside_producer(c, stage))
}

/// The first GPU loop between `s` and the producer of `stage`.
fn gpu_loop_above_producer<'a>(s: &'a Stmt, stage: &str) -> Option<&'a str> {
    if let Stmt::For { name, kind, body, .. } = s {
        if kind.is_gpu() && body.contains_producer(stage) {
            return Some(name);
        }
    }
    s.children()
        .into_iter()
        .filter(|c| c.contains_producer(stage))
        .find_map(|c| gpu_loop_above_producer(c, stage))
}

fn producer(stage: &Stage, options: NestOptions<'_>, consume: Stmt) -> LowerResult<Stmt> {
    let produce = definition_nest(stage, 0, options)?;
    let mut updates = Vec::with_capacity(stage.definitions.len().saturating_sub(1));
    for k in 1..stage.definitions.len() {
        updates.push(definition_nest(stage, k, options)?);
    }
    Ok(Stmt::ProducerConsumer {
        name: stage.name.clone(),
        produce: Box::new(produce),
        updates,
        consume: Box::new(consume),
    })
}

fn realize(stage: &Stage, body: Stmt) -> Stmt {
    Stmt::Realize {
        name: stage.name.clone(),
        values: stage.values(),
        bounds: vec![Range::new(0, 0); stage.dimensions()],
        folds: Vec::new(),
        body: Box::new(body),
    }
}

fn inject_stage(graph: &StageGraph, id: StageId, tree: Stmt, options: NestOptions<'_>) -> LowerResult<Stmt> {
    let stage = graph.stage(id);
    let compute = &stage.schedule.compute_level;
    let store = stage.schedule.store_level();

    let tree = match level_loop(graph, compute) {
        None => {
            if !store.is_root() {
                return Err(level_error(
                    stage,
                    format!("store level of `{}` does not enclose its compute level", stage.name),
                )
                .into());
            }
            let pc = producer(stage, options, tree)?;
            return Ok(realize(stage, pc));
        }
        Some(compute_loop) => {
            if tree.find_loop(&compute_loop).is_none() {
                return Err(level_error(
                    stage,
                    format!("compute level `{}` of `{}` is not a loop of its host", compute_loop, stage.name),
                )
                .into());
            }
            let mut result = Ok(());
            let tree = tree.replace_loop_body(&compute_loop, &mut |body| {
                match producer(stage, options, body) {
                    Ok(pc) => pc,
                    Err(e) => {
                        result = Err(e);
                        Stmt::NoOp
                    }
                }
            });
            result?;
            if calls_outside_producer(&tree, &stage.name) {
                return Err(level_error(
                    stage,
                    format!("`{}` is used outside its compute level `{}`", stage.name, compute_loop),
                )
                .into());
            }
            tree
        }
    };

    let tree = match store {
        LoopLevel::Root => {
            let realized = realize(stage, tree);
            check_gpu_nesting(&realized, stage)?;
            realized
        }
        LoopLevel::Inlined => {
            return Err(level_error(stage, format!("`{}` cannot be stored inline", stage.name)).into())
        }
        level @ LoopLevel::At { .. } => {
            let store_loop = level_loop(graph, level).unwrap_or_default();
            let encloses = tree
                .find_loop(&store_loop)
                .map_or(false, |l| l.contains_producer(&stage.name));
            if !encloses {
                return Err(level_error(
                    stage,
                    format!("store level `{}` of `{}` does not enclose its compute level", store_loop, stage.name),
                )
                .into());
            }
            let tree = tree.replace_loop_body(&store_loop, &mut |body| realize(stage, body));
            if let Some(Stmt::For { body, .. }) = tree.find_loop(&store_loop) {
                check_gpu_nesting(body, stage)?;
            }
            tree
        }
    };
    Ok(tree)
}

fn check_gpu_nesting(realized: &Stmt, stage: &Stage) -> LowerResult<()> {
    if let Some(gpu_loop) = gpu_loop_above_producer(realized, &stage.name) {
        return Err(GraphError::new(
            GraphErrorKind::InvalidNesting,
            format!(
                "`{}` is stored outside GPU loop `{}` but computed inside it",
                stage.name, gpu_loop
            ),
            vec![stage.name.clone()],
        )
        .into());
    }
    Ok(())
}

/// Build the loop nests of every realized stage and nest them according
/// to their compute and store levels.
pub fn build_realizations(
    graph: &StageGraph,
    order: &RealizationOrder,
    outputs: &[OutputRequest],
    options: NestOptions<'_>,
) -> LowerResult<Stmt> {
    let mut tree = Stmt::NoOp;
    for id in order.order.iter().rev() {
        let stage = graph.stage(*id);
        if stage.is_input() || is_inlined(graph, *id, outputs) {
            continue;
        }
        if let Some(request) = outputs.iter().find(|o| o.stage == *id) {
            check_region_widths(stage, &request.region, options)?;
            let pc = producer(stage, options, Stmt::NoOp)?;
            tree = Stmt::block(vec![pc, tree]);
        } else {
            tree = inject_stage(graph, *id, tree, options)?;
        }
        debug!("injected `{}`", stage.name);
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::order::realization_order;
    use crate::ir::expr::Expr;
    use crate::ir::target::Target;
    use crate::utils::errors::LowerError;

    fn x() -> Expr {
        Expr::var("x")
    }

    fn y() -> Expr {
        Expr::var("y")
    }

    fn blur() -> (StageGraph, StageId, StageId) {
        let mut g = StageGraph::new();
        g.add_input("in", &["x", "y"]);
        let f = g.add_stage("f", &["x", "y"], Expr::call("in", vec![x(), y()]) * 2);
        let out = g.add_stage(
            "out",
            &["x", "y"],
            Expr::call("f", vec![x(), y() - 1]) + Expr::call("f", vec![x(), y() + 1]),
        );
        (g, f, out)
    }

    fn build(g: &StageGraph, out: StageId) -> LowerResult<Stmt> {
        let target = Target::host();
        let outputs = [OutputRequest::constant(out, &[(0, 8), (0, 8)])];
        let order = realization_order(g, &[out])?;
        build_realizations(g, &order, &outputs, NestOptions { target: &target, no_vectorize: false })
    }

    #[test]
    fn test_root_wraps_consumers() {
        let (mut g, f, out) = blur();
        g.schedule(f).compute_root();
        let text = build(&g, out).unwrap().to_string();
        assert!(text.starts_with("realize f("));
        let produce_f = text.find("produce f").unwrap();
        let produce_out = text.find("produce out").unwrap();
        assert!(produce_f < produce_out);
        assert!(text.contains("consume f {"));
    }

    #[test]
    fn test_compute_at_inside_loop() {
        let (mut g, f, out) = blur();
        g.schedule(f).compute_at(out, "y").store_root();
        let tree = build(&g, out).unwrap();
        match tree.find_loop("out.s0.y") {
            Some(Stmt::For { body, .. }) => assert!(matches!(body.as_ref(), Stmt::ProducerConsumer { name, .. } if name == "f")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(tree, Stmt::Realize { ref name, .. } if name == "f"));
    }

    #[test]
    fn test_missing_compute_loop() {
        let (mut g, f, out) = blur();
        g.schedule(f).compute_at(out, "z");
        match build(&g, out).unwrap_err() {
            LowerError::Schedule(e) => assert_eq!(e.kind, ScheduleErrorKind::InvalidLevel),
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_store_inside_compute_is_rejected() {
        let (mut g, f, out) = blur();
        g.schedule(f).compute_at(out, "y").store_at(out, "x");
        match build(&g, out).unwrap_err() {
            LowerError::Schedule(e) => assert_eq!(e.kind, ScheduleErrorKind::InvalidLevel),
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_use_outside_compute_site() {
        // g reads f too but is computed at root
        let mut g = StageGraph::new();
        g.add_input("in", &["x"]);
        let f = g.add_stage("f", &["x"], Expr::call("in", vec![x()]));
        let h = g.add_stage("h", &["x"], Expr::call("f", vec![x()]) + 1);
        let out = g.add_stage("out", &["x"], Expr::call("h", vec![x()]) + Expr::call("f", vec![x()]));
        g.schedule(h).compute_root();
        g.schedule(f).compute_at(h, "x");
        let target = Target::host();
        let outputs = [OutputRequest::constant(out, &[(0, 4)])];
        let order = realization_order(&g, &[out]).unwrap();
        let err = build_realizations(&g, &order, &outputs, NestOptions { target: &target, no_vectorize: false })
            .unwrap_err();
        assert!(err.to_string().contains("used outside"));
    }
}
