//! Inlining of stages scheduled `Inlined`.
//!
//! Calls to an inlined stage are replaced by its pure value with the
//! call's arguments substituted for the stage's dimensions. Stages are
//! visited in realization order, so an inlined stage's own callees are
//! already inlined by the time it is substituted anywhere.

use crate::analysis::order::RealizationOrder;
use crate::ir::expr::Expr;
use crate::ir::stage::{OutputRequest, StageGraph, StageId};
use crate::utils::errors::{LowerResult, ScheduleError, ScheduleErrorKind};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};

/// True if `id` is substituted into its callers rather than realized.
pub fn is_inlined(graph: &StageGraph, id: StageId, outputs: &[OutputRequest]) -> bool {
    let stage = graph.stage(id);
    !stage.is_input() && stage.schedule.compute_level.is_inlined() && !outputs.iter().any(|o| o.stage == id)
}

/// Return a copy of `graph` with every inlined stage substituted into
/// its callers.
pub fn inline_stages(
    graph: &StageGraph,
    order: &RealizationOrder,
    outputs: &[OutputRequest],
) -> LowerResult<StageGraph> {
    let mut inlined = HashSet::new();
    for id in &order.order {
        if !is_inlined(graph, *id, outputs) {
            continue;
        }
        let stage = graph.stage(*id);
        if stage.has_updates() {
            return Err(ScheduleError::new(
                ScheduleErrorKind::InvalidLevel,
                &stage.name,
                format!("`{}` has update definitions and cannot be inlined", stage.name),
            )
            .into());
        }
        if stage.schedule.store_level.is_some() {
            return Err(ScheduleError::new(
                ScheduleErrorKind::InvalidLevel,
                &stage.name,
                format!("`{}` is inlined but has a store level", stage.name),
            )
            .into());
        }
        if !stage.definitions[0].schedule.directives.is_empty() {
            warn!("loop directives of inlined stage `{}` are ignored", stage.name);
        }
        inlined.insert(stage.name.clone());
    }
    if inlined.is_empty() {
        return Ok(graph.clone());
    }

    let mut out = graph.clone();
    for id in &order.order {
        let rewritten: Vec<_> = {
            let stage = out.stage(*id);
            stage
                .definitions
                .iter()
                .map(|def| {
                    let mut def = def.clone();
                    let rewrite = |e: &Expr| substitute_calls(&out, &inlined, e);
                    def.args = def.args.iter().map(&rewrite).collect();
                    def.values = def.values.iter().map(&rewrite).collect();
                    if let Some(rdom) = def.rdom.as_mut() {
                        for v in &mut rdom.vars {
                            v.min = rewrite(&v.min);
                            v.extent = rewrite(&v.extent);
                        }
                        rdom.predicate = rdom.predicate.as_ref().map(&rewrite);
                    }
                    def
                })
                .collect()
        };
        out.stage_mut(*id).definitions = rewritten;
    }
    debug!("inlined {} stage(s)", inlined.len());
    Ok(out)
}

fn substitute_calls(graph: &StageGraph, inlined: &HashSet<String>, e: &Expr) -> Expr {
    e.replace_calls(&mut |name, args, value_index| {
        if !inlined.contains(name) {
            return None;
        }
        let callee = graph.by_name(name)?;
        let value = callee.definitions.first()?.values.get(value_index)?;
        let map: HashMap<String, Expr> = callee.args.iter().cloned().zip(args.iter().cloned()).collect();
        Some(value.substitute_all(&map))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::order::realization_order;
    use crate::ir::stage::ReductionDomain;

    fn x() -> Expr {
        Expr::var("x")
    }

    #[test]
    fn test_chain_is_substituted() {
        let mut g = StageGraph::new();
        g.add_input("in", &["x"]);
        g.add_stage("a", &["x"], Expr::call("in", vec![x()]) * 2);
        g.add_stage("b", &["x"], Expr::call("a", vec![x() + 1]) + 1);
        let out = g.add_stage("out", &["x"], Expr::call("b", vec![x() * 3]));
        let outputs = [OutputRequest::constant(out, &[(0, 8)])];
        let order = realization_order(&g, &[out]).unwrap();
        let inlined = inline_stages(&g, &order, &outputs).unwrap();
        let value = &inlined.stage(out).definitions[0].values[0];
        assert_eq!(value.to_string(), "((in(((x * 3) + 1)) * 2) + 1)");
        assert!(is_inlined(&g, StageId(1), &outputs));
        assert!(!is_inlined(&g, out, &outputs));
    }

    #[test]
    fn test_updates_cannot_be_inlined() {
        let mut g = StageGraph::new();
        let h = g.add_stage("h", &["x"], Expr::int(0));
        g.add_update(
            h,
            vec![Expr::var("r")],
            vec![Expr::call("h", vec![Expr::var("r")]) + 1],
            Some(ReductionDomain::new(&[("r", 0, 3)])),
        );
        let out = g.add_stage("out", &["x"], Expr::call("h", vec![x()]));
        let outputs = [OutputRequest::constant(out, &[(0, 3)])];
        let order = realization_order(&g, &[out]).unwrap();
        let err = inline_stages(&g, &order, &outputs).unwrap_err();
        assert!(err.to_string().contains("cannot be inlined"));
    }
}
