//! Bounds inference.
//!
//! Runs over the statement tree after realizations have been injected, in
//! reverse realization order. For every computed stage it derives the
//! region its consumers need, defines the per-definition loop bounds
//! (`f.s<k>.<var>.min` / `.max`) as lets around the stage's
//! `ProducerConsumer` node, and finally sizes every `Realize` to cover
//! everything its body touches. External buffers get assertions that the
//! caller-bound buffers cover what the pipeline accesses.

use crate::analysis::interval::{
    bounds_of_expr, narrow_by_condition, region_hull, Interval, Region, Scope,
};
use crate::analysis::order::RealizationOrder;
use crate::analysis::simplify::{can_prove, overflows, simplify};
use crate::ir::expr::Expr;
use crate::ir::stage::{OutputRequest, Stage, StageGraph};
use crate::ir::stmt::{Range, Stmt};
use crate::transform::loops::{max_name, min_name};
use crate::utils::errors::{
    BoundsError, BoundsErrorKind, LowerError, LowerResult, ScheduleError, ScheduleErrorKind,
};
use log::{debug, trace};
use std::collections::BTreeMap;

/// Which accesses count as touching a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Reads,
    Writes,
    Both,
}

impl Access {
    fn reads(self) -> bool {
        matches!(self, Access::Reads | Access::Both)
    }

    fn writes(self) -> bool {
        matches!(self, Access::Writes | Access::Both)
    }
}

/// Collects the boxes of every stage accessed in a statement.
struct BoxCollector<'a> {
    only: Option<&'a str>,
    access: Access,
    scope: Scope<Interval>,
    boxes: BTreeMap<String, Region>,
}

fn add_box(boxes: &mut BTreeMap<String, Region>, name: &str, region: Region) {
    match boxes.get_mut(name) {
        Some(existing) if existing.len() == region.len() => *existing = region_hull(existing, &region),
        Some(_) => {}
        None => {
            boxes.insert(name.to_string(), region);
        }
    }
}

impl<'a> BoxCollector<'a> {
    fn new(only: Option<&'a str>, access: Access, scope: Scope<Interval>) -> Self {
        Self { only, access, scope, boxes: BTreeMap::new() }
    }

    fn wanted(&self, name: &str) -> bool {
        self.only.map_or(true, |o| o == name)
    }

    fn visit_expr(&mut self, e: &Expr) {
        if !self.access.reads() {
            return;
        }
        let only = self.only;
        let scope = &self.scope;
        let boxes = &mut self.boxes;
        e.visit(&mut |n| {
            if let Expr::Call { name, args, .. } = n {
                if only.map_or(true, |o| o == name) {
                    let region = args.iter().map(|a| bounds_of_expr(a, scope)).collect();
                    add_box(boxes, name, region);
                }
            }
        });
    }

    fn visit(&mut self, s: &Stmt) {
        match s {
            Stmt::For { name, min, extent, body, .. } => {
                self.visit_expr(min);
                self.visit_expr(extent);
                let lo = bounds_of_expr(min, &self.scope);
                let hi = bounds_of_expr(&simplify(&(min.clone() + extent.clone() - 1)), &self.scope);
                self.scope.push(name, Interval { min: lo.min, max: hi.max });
                self.visit(body);
                self.scope.pop(name);
            }
            Stmt::LetStmt { name, value, body } => {
                self.visit_expr(value);
                let interval = bounds_of_expr(value, &self.scope);
                self.scope.push(name, interval);
                self.visit(body);
                self.scope.pop(name);
            }
            Stmt::IfThenElse { cond, then_case, else_case } => {
                self.visit_expr(cond);
                let narrowed = narrow_by_condition(cond, &self.scope);
                for (name, interval) in &narrowed {
                    self.scope.push(name, interval.clone());
                }
                self.visit(then_case);
                for (name, _) in narrowed.iter().rev() {
                    self.scope.pop(name);
                }
                if let Some(e) = else_case {
                    self.visit(e);
                }
            }
            Stmt::Provide { name, values, args } => {
                for e in values.iter().chain(args.iter()) {
                    self.visit_expr(e);
                }
                if self.access.writes() && self.wanted(name) {
                    let region = args.iter().map(|a| bounds_of_expr(a, &self.scope)).collect();
                    add_box(&mut self.boxes, name, region);
                }
            }
            _ => {
                for e in s.exprs() {
                    self.visit_expr(e);
                }
                for c in s.children() {
                    self.visit(c);
                }
            }
        }
    }
}

/// Boxes of every stage accessed in `s`. Variables bound outside `s` stay
/// symbolic.
pub fn boxes_touched(s: &Stmt, access: Access) -> BTreeMap<String, Region> {
    boxes_touched_in(s, access, Scope::new())
}

/// As [`boxes_touched`], starting from known intervals of outer variables.
pub fn boxes_touched_in(s: &Stmt, access: Access, scope: Scope<Interval>) -> BTreeMap<String, Region> {
    let mut c = BoxCollector::new(None, access, scope);
    c.visit(s);
    c.boxes
}

/// Box of `stage` accessed in `s`, or `None` if `s` never touches it.
pub fn box_touched(s: &Stmt, stage: &str, access: Access) -> Option<Region> {
    let mut c = BoxCollector::new(Some(stage), access, Scope::new());
    c.visit(s);
    c.boxes.remove(stage)
}

/// Result of bounds inference.
#[derive(Debug, Clone)]
pub struct InferredBounds {
    pub body: Stmt,
    /// Region of every stage: the requested region for outputs, the
    /// region computed by the pure definition for other computed stages,
    /// the accessed region for inputs
    pub regions: BTreeMap<String, Region>,
}

fn empty_region(dims: usize) -> Region {
    vec![Interval::new(Expr::Int(0), Expr::Int(-1)); dims]
}

fn require_bounded(region: &Region, stage: &Stage, what: &str) -> LowerResult<()> {
    for (d, interval) in region.iter().enumerate() {
        let dim = stage.args.get(d).map(|s| s.as_str());
        if !interval.is_bounded() {
            return Err(BoundsError::new(
                BoundsErrorKind::Unbounded,
                &stage.name,
                dim,
                format!("{} of `{}` has no finite bound in dimension {}", what, stage.name, d),
            )
            .into());
        }
        require_no_overflow(interval, &stage.name, dim, what)?;
    }
    Ok(())
}

fn require_no_overflow(interval: &Interval, name: &str, dim: Option<&str>, what: &str) -> LowerResult<()> {
    let wraps = [&interval.min, &interval.max].into_iter().flatten().any(overflows);
    if wraps {
        return Err(BoundsError::new(
            BoundsErrorKind::Overflow,
            name,
            dim,
            format!("{} of `{}` overflows 64-bit integers: {}", what, name, interval),
        )
        .into());
    }
    Ok(())
}

fn side(e: &Option<Expr>) -> Expr {
    e.clone().unwrap_or(Expr::Int(0))
}

/// The lets and assertions defining the loop bounds of every definition
/// of `stage`, given the region its consumers need.
fn definition_bounds(stage: &Stage, producer: &Stmt, required: &Region) -> LowerResult<(Vec<(String, Expr)>, Vec<Stmt>, Region)> {
    let updates: &[Stmt] = match producer {
        Stmt::ProducerConsumer { updates, .. } => updates,
        _ => &[],
    };
    let mut asserts = Vec::new();
    let mut effective = required.clone();
    for (d, var) in stage.args.iter().enumerate() {
        let Some(b) = stage.schedule.bound_for(var) else { continue };
        let bmin = b.min.clone();
        let bmax = simplify(&(b.min.clone() + b.extent.clone() - 1));
        let lo = Expr::le(bmin.clone(), side(&required[d].min));
        let hi = Expr::le(side(&required[d].max), bmax.clone());
        if can_prove(&Expr::not(lo.clone())) || can_prove(&Expr::not(hi.clone())) {
            return Err(ScheduleError::new(
                ScheduleErrorKind::BoundConflict,
                &stage.name,
                format!(
                    "bound of `{}` is [{}, {}] but {} is required",
                    var, bmin, bmax, required[d]
                ),
            )
            .with_directive(format!("bound({}, {}, {})", var, b.min, b.extent))
            .into());
        }
        let cond = simplify(&Expr::and(lo, hi));
        if !can_prove(&cond) {
            asserts.push(Stmt::AssertStmt {
                cond,
                message: format!("region of `{}` required in `{}` exceeds its bound", stage.name, var),
            });
        }
        effective[d] = Interval::new(bmin, bmax);
    }

    let last = stage.definitions.len() - 1;
    let mut lets = Vec::new();
    let mut region = effective.clone();
    for k in (0..=last).rev() {
        let def = &stage.definitions[k];
        if k < last {
            // Everything the next update reads or writes of the stage must
            // already exist.
            if let Some(touched) = updates.get(k).and_then(|u| box_touched(u, &stage.name, Access::Both)) {
                require_bounded(&touched, stage, "update region")?;
                let next: Region = stage
                    .args
                    .iter()
                    .map(|a| {
                        Interval::new(
                            Expr::var(min_name(&stage.name, k + 1, a)),
                            Expr::var(max_name(&stage.name, k + 1, a)),
                        )
                    })
                    .collect();
                region = region_hull(&next, &touched);
            }
            for (d, var) in stage.args.iter().enumerate() {
                if stage.schedule.bound_for(var).is_some() {
                    region[d] = effective[d].clone();
                }
            }
        }
        for (d, var) in stage.args.iter().enumerate() {
            lets.push((min_name(&stage.name, k, var), side(&region[d].min)));
            lets.push((max_name(&stage.name, k, var), side(&region[d].max)));
        }
        if let Some(rdom) = &def.rdom {
            for rv in &rdom.vars {
                lets.push((min_name(&stage.name, k, &rv.name), rv.min.clone()));
                lets.push((
                    max_name(&stage.name, k, &rv.name),
                    simplify(&(rv.min.clone() + rv.extent.clone() - 1)),
                ));
            }
        }
    }
    Ok((lets, asserts, region))
}

fn wrap_lets(lets: &[(String, Expr)], body: Stmt) -> Stmt {
    lets.iter()
        .rev()
        .fold(body, |body, (name, value)| Stmt::let_stmt(name.clone(), value.clone(), body))
}

fn coverage_assertions(buffer: &str, region: &Region, kind: &str) -> Vec<Stmt> {
    let mut out = Vec::new();
    for (d, interval) in region.iter().enumerate() {
        let (Some(lo), Some(hi)) = (&interval.min, &interval.max) else { continue };
        let bmin = Expr::var(format!("{}.min.{}", buffer, d));
        let bmax = bmin.clone() + Expr::var(format!("{}.extent.{}", buffer, d)) - 1;
        let cond = simplify(&Expr::and(Expr::le(bmin, lo.clone()), Expr::le(hi.clone(), bmax)));
        if can_prove(&cond) {
            continue;
        }
        out.push(Stmt::AssertStmt {
            cond,
            message: format!("{} buffer `{}` does not cover the accessed region in dimension {}", kind, buffer, d),
        });
    }
    out
}

/// Size every `Realize` to the box its body touches.
fn size_realizations(s: Stmt) -> LowerResult<Stmt> {
    match s {
        Stmt::Realize { name, values, bounds, folds, body } => {
            let body = size_realizations(*body)?;
            let region = box_touched(&body, &name, Access::Both);
            let bounds = match region {
                Some(region) => {
                    let mut out = Vec::with_capacity(region.len());
                    for (d, interval) in region.iter().enumerate() {
                        let (Some(lo), Some(hi)) = (&interval.min, &interval.max) else {
                            return Err(BoundsError::new(
                                BoundsErrorKind::Unbounded,
                                &name,
                                None,
                                format!("storage of `{}` has no finite bound in dimension {}", name, d),
                            )
                            .into());
                        };
                        let extent = simplify(&(hi.clone() - lo.clone() + 1));
                        require_no_overflow(interval, &name, None, "storage")?;
                        require_no_overflow(&Interval::point(extent.clone()), &name, None, "storage extent")?;
                        out.push(Range { min: lo.clone(), extent });
                    }
                    out
                }
                None => bounds.iter().map(|_| Range::new(0, 0)).collect(),
            };
            trace!("realize {}({})", name, bounds.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(", "));
            Ok(Stmt::Realize { name, values, bounds, folds, body: Box::new(body) })
        }
        other => {
            let mut err = None;
            let out = other.map_children(|c| match size_realizations(c) {
                Ok(c) => c,
                Err(e) => {
                    err.get_or_insert(e);
                    Stmt::NoOp
                }
            });
            match err {
                Some(e) => Err(e),
                None => Ok(out),
            }
        }
    }
}

/// Infer the bounds of every stage in `body`.
pub fn infer_bounds(
    body: Stmt,
    graph: &StageGraph,
    order: &RealizationOrder,
    outputs: &[OutputRequest],
) -> LowerResult<InferredBounds> {
    let mut body = body;
    let mut regions = BTreeMap::new();

    for id in order.order.iter().rev() {
        let stage = graph.stage(*id);
        if stage.is_input() {
            continue;
        }
        let request = outputs.iter().find(|o| o.stage == *id);
        let Some(producer) = body.find_producer(&stage.name) else {
            // inlined
            continue;
        };
        let required: Region = match request {
            Some(req) => req
                .region
                .iter()
                .map(|r| Interval::new(r.min.clone(), simplify(&r.max())))
                .collect(),
            None => {
                let consume = match producer {
                    Stmt::ProducerConsumer { consume, .. } => consume.as_ref(),
                    _ => return Err(LowerError::internal("producer lookup returned a non-producer")),
                };
                match box_touched(consume, &stage.name, Access::Reads) {
                    Some(r) => r,
                    None => empty_region(stage.dimensions()),
                }
            }
        };
        require_bounded(&required, stage, "region required by consumers")?;
        debug!(
            "{} required: {}",
            stage.name,
            required.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(" x ")
        );
        let (lets, asserts, computed) = definition_bounds(stage, producer, &required)?;
        regions.insert(stage.name.clone(), if request.is_some() { required } else { computed });
        body = body.replace_producer(&stage.name, &mut |pc| {
            let mut inner = asserts.clone();
            inner.push(pc);
            wrap_lets(&lets, Stmt::block(inner))
        });
    }

    let body = size_realizations(body)?;

    // External buffers
    let touched = boxes_touched(&body, Access::Both);
    let mut asserts = Vec::new();
    for id in &order.order {
        let stage = graph.stage(*id);
        let is_output = outputs.iter().any(|o| o.stage == *id);
        if !stage.is_input() && !is_output {
            continue;
        }
        let Some(region) = touched.get(&stage.name) else {
            if stage.is_input() {
                regions.insert(stage.name.clone(), empty_region(stage.dimensions()));
            }
            continue;
        };
        require_bounded(region, stage, "accessed region")?;
        let kind = if stage.is_input() { "input" } else { "output" };
        for v in 0..stage.values() {
            asserts.extend(coverage_assertions(&stage.buffer_name(v), region, kind));
        }
        if stage.is_input() {
            regions.insert(stage.name.clone(), region.clone());
        }
    }
    asserts.push(body);
    Ok(InferredBounds { body: Stmt::block(asserts), regions })
}
