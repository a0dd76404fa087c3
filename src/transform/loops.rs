//! Loop nest synthesis.
//!
//! Each definition of a stage starts from a list of dimensions, outermost
//! first: the pure dimensions in reverse declaration order and, for
//! updates, the reduction variables innermost. The directives of the
//! definition schedule rewrite that list one after another. The rewritten
//! list is then emitted as a loop nest around a single `Provide`.
//!
//! ```text
//! f(x, y) = g(x, y) + 1
//! split(x, xo, xi, 4)
//!
//! for (f.s0.y, f.s0.y.min, ...) {
//!   for (f.s0.xo, 0, (f.s0.x.extent + 3) / 4) {
//!     for (f.s0.xi, 0, 4) {
//!       let f.s0.x = min(f.s0.xo * 4, extent - 4) + f.s0.xi + f.s0.x.min
//!       f(f.s0.x, f.s0.y) = g(f.s0.x, f.s0.y) + 1
//! ```
//!
//! Loop variables are named `<stage>.s<definition>.<var>`. The bounds of the
//! original dimensions are read from `<stage>.s<definition>.<var>.min` and
//! `.max`, which bounds inference defines.

use crate::analysis::simplify::{const_value, simplify};
use crate::ir::expr::Expr;
use crate::ir::schedule::{Directive, TailStrategy};
use crate::ir::stage::{Definition, Stage};
use crate::ir::stmt::{ForKind, Range, Stmt};
use crate::ir::target::Target;
use crate::utils::errors::{ScheduleError, ScheduleErrorKind};
use log::{debug, trace};
use std::collections::HashMap;

/// `<stage>.s<definition>`
pub fn loop_prefix(stage: &str, definition: usize) -> String {
    format!("{}.s{}", stage, definition)
}

/// Name of the loop (or reconstructed variable) `var` of a definition.
pub fn loop_name(stage: &str, definition: usize, var: &str) -> String {
    format!("{}.s{}.{}", stage, definition, var)
}

/// Name of the let holding the first coordinate of `var`.
pub fn min_name(stage: &str, definition: usize, var: &str) -> String {
    format!("{}.min", loop_name(stage, definition, var))
}

/// Name of the let holding the last coordinate of `var`.
pub fn max_name(stage: &str, definition: usize, var: &str) -> String {
    format!("{}.max", loop_name(stage, definition, var))
}

/// Pure variables an update iterates: those used verbatim at their own
/// position on its left-hand side.
pub fn iterated_pure_vars<'a>(stage: &'a Stage, def: &Definition) -> Vec<&'a str> {
    stage
        .args
        .iter()
        .zip(def.args.iter())
        .filter(|(a, e)| e.as_var() == Some(a.as_str()))
        .map(|(a, _)| a.as_str())
        .collect()
}

/// True if the definition reads its own stage at a coordinate other than
/// `pure_var` in the position of `pure_var`.
pub fn reads_self_elsewhere(stage: &Stage, def: &Definition, pure_var: &str) -> bool {
    let Some(pos) = stage.dim_index(pure_var) else {
        return false;
    };
    def.values
        .iter()
        .flat_map(|v| {
            let mut calls = Vec::new();
            v.visit(&mut |e| {
                if let Expr::Call { name, args, .. } = e {
                    if name == &stage.name {
                        calls.push(args.clone());
                    }
                }
            });
            calls
        })
        .any(|args| args.get(pos).and_then(|a| a.as_var()) != Some(pure_var))
}

/// One loop of a definition's nest.
#[derive(Debug, Clone, PartialEq)]
pub struct Dim {
    pub var: String,
    pub kind: ForKind,
    pub is_rvar: bool,
    /// Original dimensions this loop was derived from
    pub origins: Vec<String>,
    pub min: Expr,
    pub extent: Expr,
}

impl Dim {
    pub fn const_extent(&self) -> Option<i64> {
        const_value(&self.extent)
    }
}

/// Options that affect how loops are emitted.
#[derive(Debug, Clone, Copy)]
pub struct NestOptions<'a> {
    pub target: &'a Target,
    pub no_vectorize: bool,
}

/// The dimension list of one definition while its directives are applied.
#[derive(Debug, Clone)]
pub struct DefinitionNest<'a> {
    stage: &'a Stage,
    index: usize,
    dims: Vec<Dim>,
    /// Reconstruction lets in application order; the first is innermost
    lets: Vec<(String, Expr)>,
    guards: Vec<Expr>,
}

impl<'a> DefinitionNest<'a> {
    /// The initial dimension list of definition `index` of `stage`.
    pub fn new(stage: &'a Stage, index: usize) -> Self {
        let def = &stage.definitions[index];
        let mut dims = Vec::new();
        let pure: Vec<&str> = if index == 0 {
            stage.args.iter().map(|a| a.as_str()).collect()
        } else {
            iterated_pure_vars(stage, def)
        };
        for var in pure.iter().rev() {
            let min = Expr::var(min_name(&stage.name, index, var));
            let extent = match stage.schedule.bound_for(var) {
                Some(b) if b.extent.as_int().is_some() => b.extent.clone(),
                _ => Expr::var(max_name(&stage.name, index, var)) - min.clone() + 1,
            };
            dims.push(Dim {
                var: var.to_string(),
                kind: ForKind::Serial,
                is_rvar: false,
                origins: vec![var.to_string()],
                min,
                extent,
            });
        }
        if let Some(rdom) = &def.rdom {
            for rv in rdom.vars.iter().rev() {
                let min = Expr::var(min_name(&stage.name, index, &rv.name));
                let extent = if rv.extent.as_int().is_some() {
                    rv.extent.clone()
                } else {
                    Expr::var(max_name(&stage.name, index, &rv.name)) - min.clone() + 1
                };
                dims.push(Dim {
                    var: rv.name.clone(),
                    kind: ForKind::Serial,
                    is_rvar: true,
                    origins: vec![rv.name.clone()],
                    min,
                    extent,
                });
            }
        }
        Self { stage, index, dims, lets: Vec::new(), guards: Vec::new() }
    }

    /// Give pure loops the constant extents of `region` where it has them.
    fn assume_extents(&mut self, region: &[Range]) {
        let stage = self.stage;
        for dim in self.dims.iter_mut().filter(|d| !d.is_rvar) {
            let known = stage
                .dim_index(&dim.var)
                .and_then(|d| region.get(d))
                .and_then(|r| const_value(&r.extent));
            if let Some(extent) = known {
                dim.extent = Expr::int(extent);
            }
        }
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    fn definition(&self) -> &'a Definition {
        &self.stage.definitions[self.index]
    }

    fn name(&self, var: &str) -> String {
        loop_name(&self.stage.name, self.index, var)
    }

    fn error(&self, kind: ScheduleErrorKind, message: impl Into<String>) -> ScheduleError {
        ScheduleError::new(kind, &self.stage.name, message)
    }

    fn position(&self, var: &str) -> Result<usize, ScheduleError> {
        self.dims.iter().position(|d| d.var == var).ok_or_else(|| {
            self.error(
                ScheduleErrorKind::UnknownDimension,
                format!("no loop `{}` in definition {} of `{}`", var, self.index, self.stage.name),
            )
        })
    }

    fn check_fresh(&self, var: &str, replaced: &[&str]) -> Result<(), ScheduleError> {
        if self.dims.iter().any(|d| d.var == var && !replaced.contains(&d.var.as_str())) {
            return Err(self.error(
                ScheduleErrorKind::DuplicateDimension,
                format!("loop `{}` already exists", var),
            ));
        }
        Ok(())
    }

    /// Apply every directive of the definition schedule in order.
    pub fn apply_schedule(&mut self, options: NestOptions<'_>) -> Result<(), ScheduleError> {
        for directive in &self.definition().schedule.directives {
            trace!("{}.s{}: {}", self.stage.name, self.index, directive);
            self.apply(directive, options).map_err(|e| e.with_directive(directive))?;
        }
        Ok(())
    }

    /// Apply one directive.
    pub fn apply(&mut self, directive: &Directive, options: NestOptions<'_>) -> Result<(), ScheduleError> {
        match directive {
            Directive::Split { old, outer, inner, factor, tail } => {
                self.split(old, outer, inner, *factor, *tail)
            }
            Directive::Fuse { inner, outer, fused } => self.fuse(inner, outer, fused),
            Directive::Reorder(vars) => self.reorder(vars),
            Directive::Vectorize { var, width } => {
                if !options.target.has_vector_unit() {
                    return Err(self.error(
                        ScheduleErrorKind::UnsupportedByTarget,
                        format!("target `{}` has no vector unit", options.target),
                    ));
                }
                let kind = if options.no_vectorize { ForKind::Serial } else { ForKind::Vectorized };
                self.mark_with_width(var, *width, "v", kind)
            }
            Directive::Unroll { var, factor } => self.mark_with_width(var, *factor, "u", ForKind::Unrolled),
            Directive::Parallel(var) => self.set_kind(var, ForKind::Parallel),
            Directive::Tile { x, y, xo, yo, xi, yi, x_factor, y_factor, tail } => {
                self.split(x, xo, xi, *x_factor, *tail)?;
                self.split(y, yo, yi, *y_factor, *tail)?;
                self.reorder(&[yo.clone(), xo.clone(), yi.clone(), xi.clone()])
            }
            Directive::GpuBlocks(var) => {
                self.require_gpu(options.target)?;
                self.set_kind(var, ForKind::GpuBlock)
            }
            Directive::GpuThreads(var) => {
                self.require_gpu(options.target)?;
                self.set_kind(var, ForKind::GpuThread)
            }
            Directive::GpuTile { var, block, thread, size, tail } => {
                self.require_gpu(options.target)?;
                self.split(var, block, thread, *size, *tail)?;
                self.set_kind(block, ForKind::GpuBlock)?;
                self.set_kind(thread, ForKind::GpuThread)
            }
        }
    }

    fn require_gpu(&self, target: &Target) -> Result<(), ScheduleError> {
        if target.has_gpu_feature() {
            Ok(())
        } else {
            Err(self.error(
                ScheduleErrorKind::UnsupportedByTarget,
                format!("target `{}` has no device API", target),
            ))
        }
    }

    /// `old = outer * factor + inner + old_min`
    pub fn split(
        &mut self,
        old: &str,
        outer: &str,
        inner: &str,
        factor: i64,
        tail: TailStrategy,
    ) -> Result<(), ScheduleError> {
        if factor < 1 {
            return Err(self.error(
                ScheduleErrorKind::InvalidFactor,
                format!("split factor {} is not positive", factor),
            ));
        }
        let pos = self.position(old)?;
        if outer == inner || inner == old {
            return Err(self.error(
                ScheduleErrorKind::DuplicateDimension,
                format!("split of `{}` must introduce two new names", old),
            ));
        }
        self.check_fresh(outer, &[old])?;
        self.check_fresh(inner, &[])?;

        let dim = self.dims[pos].clone();
        let is_update = self.index > 0;
        let tail = match tail {
            TailStrategy::Auto if is_update => TailStrategy::GuardWithIf,
            TailStrategy::Auto => TailStrategy::ShiftInwards,
            TailStrategy::ShiftInwards if is_update => {
                return Err(self.error(
                    ScheduleErrorKind::IllegalTail,
                    format!("cannot shift the tail of `{}` inwards in an update", old),
                ))
            }
            TailStrategy::RoundUp if is_update || dim.is_rvar => {
                return Err(self.error(
                    ScheduleErrorKind::IllegalTail,
                    format!("cannot round up `{}` in an update", old),
                ))
            }
            other => other,
        };
        if tail == TailStrategy::ShiftInwards {
            if let Some(extent) = dim.const_extent().filter(|e| *e < factor) {
                return Err(self.error(
                    ScheduleErrorKind::InvalidFactor,
                    format!("cannot split `{}` of extent {} by {}", old, extent, factor),
                ));
            }
        }
        // A constant extent that the factor divides needs no tail handling.
        let exact = dim.const_extent().map_or(false, |e| e % factor == 0);

        let outer_var = Expr::var(self.name(outer));
        let inner_var = Expr::var(self.name(inner));
        let base = if tail == TailStrategy::ShiftInwards && !exact {
            Expr::min(outer_var * factor, dim.extent.clone() - factor)
        } else {
            outer_var * factor
        };
        self.lets.push((self.name(old), simplify(&(base + inner_var + dim.min.clone()))));
        if tail == TailStrategy::GuardWithIf && !exact {
            let last = dim.min.clone() + dim.extent.clone() - 1;
            self.guards.push(Expr::le(Expr::var(self.name(old)), simplify(&last)));
        }

        let outer_dim = Dim {
            var: outer.to_string(),
            kind: dim.kind,
            is_rvar: dim.is_rvar,
            origins: dim.origins.clone(),
            min: Expr::Int(0),
            extent: simplify(&Expr::div(dim.extent.clone() + (factor - 1), Expr::Int(factor))),
        };
        let inner_dim = Dim {
            var: inner.to_string(),
            kind: ForKind::Serial,
            is_rvar: dim.is_rvar,
            origins: dim.origins,
            min: Expr::Int(0),
            extent: Expr::Int(factor),
        };
        self.dims[pos] = inner_dim;
        self.dims.insert(pos, outer_dim);
        Ok(())
    }

    /// Inverse of split: `fused = outer_index * inner_extent + inner_index`.
    pub fn fuse(&mut self, inner: &str, outer: &str, fused: &str) -> Result<(), ScheduleError> {
        let pi = self.position(inner)?;
        let po = self.position(outer)?;
        if po + 1 != pi {
            return Err(self.error(
                ScheduleErrorKind::IllegalReorder,
                format!("`{}` is not directly outside `{}`", outer, inner),
            ));
        }
        self.check_fresh(fused, &[inner, outer])?;
        let (di, d_o) = (self.dims[pi].clone(), self.dims[po].clone());
        if di.is_rvar != d_o.is_rvar {
            return Err(self.error(
                ScheduleErrorKind::IllegalReorder,
                format!("cannot fuse pure and reduction loops `{}` and `{}`", inner, outer),
            ));
        }
        let fused_var = Expr::var(self.name(fused));
        self.lets.push((
            self.name(inner),
            simplify(&(Expr::modulo(fused_var.clone(), di.extent.clone()) + di.min.clone())),
        ));
        self.lets.push((
            self.name(outer),
            simplify(&(Expr::div(fused_var, di.extent.clone()) + d_o.min.clone())),
        ));
        let mut origins = d_o.origins.clone();
        origins.extend(di.origins.iter().cloned());
        let dim = Dim {
            var: fused.to_string(),
            kind: d_o.kind,
            is_rvar: di.is_rvar,
            origins,
            min: Expr::Int(0),
            extent: simplify(&(di.extent * d_o.extent)),
        };
        self.dims.remove(pi);
        self.dims[po] = dim;
        Ok(())
    }

    /// Re-place the listed loops (outermost first) into the positions they
    /// currently occupy.
    pub fn reorder(&mut self, vars: &[String]) -> Result<(), ScheduleError> {
        let mut positions = Vec::with_capacity(vars.len());
        for (i, v) in vars.iter().enumerate() {
            if vars[..i].contains(v) {
                return Err(self.error(
                    ScheduleErrorKind::DuplicateDimension,
                    format!("`{}` is listed twice", v),
                ));
            }
            positions.push(self.position(v)?);
        }
        let mut slots = positions.clone();
        slots.sort_unstable();
        let old = self.dims.clone();
        for (slot, pos) in slots.iter().zip(positions.iter()) {
            self.dims[*slot] = old[*pos].clone();
        }
        self.check_reorder_legal(&old)
    }

    fn check_reorder_legal(&self, old: &[Dim]) -> Result<(), ScheduleError> {
        let before = |dims: &[Dim], a: &str, b: &str| {
            let pa = dims.iter().position(|d| d.var == a);
            let pb = dims.iter().position(|d| d.var == b);
            pa < pb
        };
        let def = self.definition();
        for (i, a) in old.iter().enumerate() {
            for b in &old[i + 1..] {
                if before(&self.dims, &a.var, &b.var) {
                    continue;
                }
                if a.is_rvar && b.is_rvar {
                    return Err(self.error(
                        ScheduleErrorKind::IllegalReorder,
                        format!("reduction loops `{}` and `{}` cannot be reordered", a.var, b.var),
                    ));
                }
                if a.is_rvar != b.is_rvar {
                    let pure = if a.is_rvar { b } else { a };
                    if pure.origins.iter().any(|o| reads_self_elsewhere(self.stage, def, o)) {
                        return Err(self.error(
                            ScheduleErrorKind::IllegalReorder,
                            format!(
                                "`{}` cannot cross a reduction loop: the update reads `{}` at other values of it",
                                pure.var, self.stage.name
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Set the kind of `var`, splitting off an inner loop of `width` first
    /// if one is given.
    fn mark_with_width(
        &mut self,
        var: &str,
        width: Option<i64>,
        suffix: &str,
        kind: ForKind,
    ) -> Result<(), ScheduleError> {
        let pos = self.position(var)?;
        if kind == ForKind::Vectorized && self.dims[pos].is_rvar {
            return Err(self.error(
                ScheduleErrorKind::IllegalLoopKind,
                format!("reduction loop `{}` cannot be vectorized", var),
            ));
        }
        match width {
            Some(w) => {
                let inner = format!("{}.{}{}", var, suffix, w);
                self.split(var, var, &inner, w, TailStrategy::Auto)?;
                self.set_kind_unchecked(&inner, kind)
            }
            None => {
                if self.dims[pos].const_extent().is_none() {
                    return Err(self.error(
                        ScheduleErrorKind::InvalidFactor,
                        format!("loop `{}` needs a constant extent; add a bound or a width", var),
                    ));
                }
                self.set_kind_unchecked(var, kind)
            }
        }
    }

    fn set_kind(&mut self, var: &str, kind: ForKind) -> Result<(), ScheduleError> {
        let pos = self.position(var)?;
        let dim = &self.dims[pos];
        if kind.is_parallel() {
            if dim.is_rvar {
                return Err(self.error(
                    ScheduleErrorKind::IllegalLoopKind,
                    format!("reduction loop `{}` cannot run in parallel", var),
                ));
            }
            let def = self.definition();
            if self.index > 0 && dim.origins.iter().any(|o| reads_self_elsewhere(self.stage, def, o)) {
                return Err(self.error(
                    ScheduleErrorKind::IllegalLoopKind,
                    format!("`{}` reads `{}` at other values of `{}`", var, self.stage.name, var),
                ));
            }
        }
        self.set_kind_unchecked(var, kind)
    }

    fn set_kind_unchecked(&mut self, var: &str, kind: ForKind) -> Result<(), ScheduleError> {
        let pos = self.position(var)?;
        self.dims[pos].kind = kind;
        Ok(())
    }

    /// Emit the loop nest.
    pub fn build(self) -> Stmt {
        let def = self.definition();
        let stage = self.stage;
        let mut rename: HashMap<String, Expr> = HashMap::new();
        for a in &stage.args {
            rename.insert(a.clone(), Expr::var(self.name(a)));
        }
        for r in def.rvars() {
            rename.insert(r.to_string(), Expr::var(self.name(r)));
        }
        let mut body = Stmt::Provide {
            name: stage.name.clone(),
            values: def.values.iter().map(|v| v.substitute_all(&rename)).collect(),
            args: def.args.iter().map(|a| a.substitute_all(&rename)).collect(),
        };
        if let Some(p) = def.rdom.as_ref().and_then(|r| r.predicate.as_ref()) {
            body = Stmt::if_then(p.substitute_all(&rename), body);
        }
        if let Some(cond) = self.guards.iter().cloned().reduce(Expr::and) {
            body = Stmt::if_then(cond, body);
        }
        for (name, value) in self.lets {
            body = Stmt::let_stmt(name, value, body);
        }
        for dim in self.dims.into_iter().rev() {
            let name = loop_name(&stage.name, self.index, &dim.var);
            body = Stmt::for_loop(name, dim.min, dim.extent, dim.kind, body);
        }
        body
    }
}

/// Build the loop nest of definition `index` of `stage`.
pub fn definition_nest(stage: &Stage, index: usize, options: NestOptions<'_>) -> Result<Stmt, ScheduleError> {
    let mut nest = DefinitionNest::new(stage, index);
    nest.apply_schedule(options)?;
    debug!(
        "{}: loops {}",
        loop_prefix(&stage.name, index),
        nest.dims().iter().map(|d| d.var.as_str()).collect::<Vec<_>>().join(", ")
    );
    Ok(nest.build())
}

/// Replay the directives of every definition of `stage` over the constant
/// extents of `region`, rejecting widths wider than the region.
pub fn check_region_widths(stage: &Stage, region: &[Range], options: NestOptions<'_>) -> Result<(), ScheduleError> {
    for index in 0..stage.definitions.len() {
        let mut nest = DefinitionNest::new(stage, index);
        nest.assume_extents(region);
        nest.apply_schedule(options)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::schedule::DefinitionSchedule;
    use crate::ir::stage::{ReductionDomain, StageGraph, StageId};

    fn two_d() -> (StageGraph, StageId) {
        let mut g = StageGraph::new();
        g.add_input("in", &["x", "y"]);
        let f = g.add_stage(
            "f",
            &["x", "y"],
            Expr::call("in", vec![Expr::var("x"), Expr::var("y")]) + 1,
        );
        (g, f)
    }

    fn host() -> Target {
        Target::host()
    }

    fn options(target: &Target) -> NestOptions<'_> {
        NestOptions { target, no_vectorize: false }
    }

    fn vars(nest: &DefinitionNest<'_>) -> Vec<String> {
        nest.dims().iter().map(|d| d.var.clone()).collect()
    }

    #[test]
    fn test_default_order_is_reverse_declaration() {
        let (g, f) = two_d();
        let nest = DefinitionNest::new(g.stage(f), 0);
        assert_eq!(vars(&nest), vec!["y", "x"]);
        let text = nest.build().to_string();
        assert!(text.starts_with("for (f.s0.y, f.s0.y.min, "));
        assert!(text.contains("f(f.s0.x, f.s0.y) = (in(f.s0.x, f.s0.y) + 1)"));
    }

    #[test]
    fn test_split_and_reorder() {
        let (mut g, f) = two_d();
        g.definition_schedule(f, 0).split("x", "xo", "xi", 4).reorder(&["xi", "y"]);
        let target = host();
        let mut nest = DefinitionNest::new(g.stage(f), 0);
        nest.apply_schedule(options(&target)).unwrap();
        // y and xi trade places
        assert_eq!(vars(&nest), vec!["xi", "xo", "y"]);
        let text = nest.build().to_string();
        assert!(text.contains("for (f.s0.xi, 0, 4)"));
        assert!(text.contains("let f.s0.x = "));
    }

    #[test]
    fn test_tile_order() {
        let (mut g, f) = two_d();
        g.definition_schedule(f, 0).tile("x", "y", "xo", "yo", "xi", "yi", 8, 8);
        let target = host();
        let mut nest = DefinitionNest::new(g.stage(f), 0);
        nest.apply_schedule(options(&target)).unwrap();
        assert_eq!(vars(&nest), vec!["yo", "xo", "yi", "xi"]);
    }

    #[test]
    fn test_fuse_requires_adjacent() {
        let (mut g, f) = two_d();
        g.definition_schedule(f, 0).fuse("x", "y", "xy");
        let target = host();
        let mut nest = DefinitionNest::new(g.stage(f), 0);
        nest.apply_schedule(options(&target)).unwrap();
        assert_eq!(vars(&nest), vec!["xy"]);

        let (mut g, f) = two_d();
        g.definition_schedule(f, 0).fuse("y", "x", "xy");
        let mut nest = DefinitionNest::new(g.stage(f), 0);
        let err = nest.apply_schedule(options(&target)).unwrap_err();
        assert_eq!(err.kind, ScheduleErrorKind::IllegalReorder);
        assert_eq!(err.directive.as_deref(), Some("fuse(y, x, xy)"));
    }

    fn expect_error(kind: ScheduleErrorKind, schedule: impl FnOnce(&mut DefinitionSchedule)) {
        let target = host();
        let (mut g, f) = two_d();
        schedule(g.definition_schedule(f, 0));
        let mut nest = DefinitionNest::new(g.stage(f), 0);
        assert_eq!(nest.apply_schedule(options(&target)).unwrap_err().kind, kind);
    }

    #[test]
    fn test_directive_errors() {
        expect_error(ScheduleErrorKind::UnknownDimension, |s| {
            s.split("z", "zo", "zi", 2);
        });
        expect_error(ScheduleErrorKind::DuplicateDimension, |s| {
            s.split("x", "y", "xi", 2);
        });
        expect_error(ScheduleErrorKind::InvalidFactor, |s| {
            s.split("x", "xo", "xi", 0);
        });
        expect_error(ScheduleErrorKind::InvalidFactor, |s| {
            s.vectorize("x", None);
        });
        expect_error(ScheduleErrorKind::UnsupportedByTarget, |s| {
            s.gpu_blocks("y");
        });
    }

    #[test]
    fn test_vectorize_needs_vector_unit() {
        let (mut g, f) = two_d();
        g.definition_schedule(f, 0).vectorize("x", Some(4));
        let target = Target::host_no_simd();
        let mut nest = DefinitionNest::new(g.stage(f), 0);
        let err = nest.apply_schedule(options(&target)).unwrap_err();
        assert_eq!(err.kind, ScheduleErrorKind::UnsupportedByTarget);

        let target = host();
        let mut nest = DefinitionNest::new(g.stage(f), 0);
        nest.apply_schedule(NestOptions { target: &target, no_vectorize: true }).unwrap();
        assert!(nest.dims().iter().all(|d| d.kind == ForKind::Serial));
    }

    #[test]
    fn test_width_wider_than_constant_extent() {
        let target = host();
        let (mut g, f) = two_d();
        g.definition_schedule(f, 0).vectorize("x", Some(8));
        let region = [Range::new(0, 5), Range::new(0, 5)];
        let err = check_region_widths(g.stage(f), &region, options(&target)).unwrap_err();
        assert_eq!(err.kind, ScheduleErrorKind::InvalidFactor);
        assert_eq!(err.directive.as_deref(), Some("vectorize(x, 8)"));

        check_region_widths(g.stage(f), &[Range::new(0, 8), Range::new(0, 5)], options(&target)).unwrap();
        check_region_widths(g.stage(f), &[Range::new(0, Expr::var("n")), Range::new(0, 5)], options(&target))
            .unwrap();

        let (mut g, f) = two_d();
        g.schedule(f).bound("x", 0, 3);
        g.definition_schedule(f, 0).split("x", "xo", "xi", 4);
        let mut nest = DefinitionNest::new(g.stage(f), 0);
        assert_eq!(nest.apply_schedule(options(&target)).unwrap_err().kind, ScheduleErrorKind::InvalidFactor);
    }

    #[test]
    fn test_update_rules() {
        let mut g = StageGraph::new();
        let f = g.add_stage("f", &["x"], Expr::int(0));
        // f(x) = f(x) + r, over r in [0, 4)
        g.add_update(
            f,
            vec![Expr::var("x")],
            vec![Expr::call("f", vec![Expr::var("x")]) + Expr::var("r")],
            Some(ReductionDomain::new(&[("r", 0, 4)])),
        );
        let target = host();
        let nest = DefinitionNest::new(g.stage(f), 1);
        assert_eq!(vars(&nest), vec!["x", "r"]);

        g.definition_schedule(f, 1).parallel("r");
        let mut nest = DefinitionNest::new(g.stage(f), 1);
        assert_eq!(
            nest.apply_schedule(options(&target)).unwrap_err().kind,
            ScheduleErrorKind::IllegalLoopKind
        );

        g.definition_schedule(f, 1).directives.clear();
        g.definition_schedule(f, 1).split_with_tail("x", "xo", "xi", 4, TailStrategy::ShiftInwards);
        let mut nest = DefinitionNest::new(g.stage(f), 1);
        assert_eq!(nest.apply_schedule(options(&target)).unwrap_err().kind, ScheduleErrorKind::IllegalTail);

        // crossing is fine when the update only reads f(x)
        g.definition_schedule(f, 1).directives.clear();
        g.definition_schedule(f, 1).reorder(&["r", "x"]);
        let mut nest = DefinitionNest::new(g.stage(f), 1);
        nest.apply_schedule(options(&target)).unwrap();
        assert_eq!(vars(&nest), vec!["r", "x"]);
    }

    #[test]
    fn test_reorder_across_self_read_is_rejected() {
        let mut g = StageGraph::new();
        let f = g.add_stage("f", &["x"], Expr::var("x"));
        // f(x) = f(x - 1) + r
        g.add_update(
            f,
            vec![Expr::var("x")],
            vec![Expr::call("f", vec![Expr::var("x") - 1]) + Expr::var("r")],
            Some(ReductionDomain::new(&[("r", 0, 2)])),
        );
        g.definition_schedule(f, 1).reorder(&["r", "x"]);
        let target = host();
        let mut nest = DefinitionNest::new(g.stage(f), 1);
        assert_eq!(nest.apply_schedule(options(&target)).unwrap_err().kind, ScheduleErrorKind::IllegalReorder);
    }

    #[test]
    fn test_guard_for_update_split() {
        let mut g = StageGraph::new();
        let f = g.add_stage("f", &["x"], Expr::int(0));
        g.add_update(f, vec![Expr::var("x")], vec![Expr::call("f", vec![Expr::var("x")]) * 2], None);
        g.definition_schedule(f, 1).split("x", "xo", "xi", 3);
        let target = host();
        let stmt = definition_nest(g.stage(f), 1, options(&target)).unwrap();
        let text = stmt.to_string();
        assert!(text.contains("if ((f.s1.x <= "));
        assert!(!text.contains("min("));
    }
}
