//! Sliding window.
//!
//! When a stage is stored outside the loop it is computed in, consecutive
//! iterations of that loop often need overlapping regions of it. If the
//! region moves monotonically along a single dimension, every iteration
//! after the first only computes the part past what the previous iteration
//! already computed:
//!
//! ```text
//! let f.s0.y.min = select(out.s0.y > out.s0.y.min, f.s0.y.max(prev) + 1, f.s0.y.min)
//! ```
//!
//! The analysis result ([`SlideInfo`]) also feeds storage folding and
//! synchronization.

use crate::analysis::monotonic::{is_monotonic, Monotonic};
use crate::analysis::simplify::{const_value, constant_difference, simplify};
use crate::ir::expr::Expr;
use crate::ir::stage::{Stage, StageGraph};
use crate::ir::stmt::{ForKind, Stmt};
use crate::transform::loops::{max_name, min_name};
use crate::utils::errors::FoldErrorKind;
use log::{debug, trace};
use serde::Serialize;
use std::collections::BTreeMap;

/// A stage whose region slides along a loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlideInfo {
    pub stage: String,
    /// The loop the region slides along
    pub loop_name: String,
    pub loop_kind: ForKind,
    pub loop_min: Expr,
    /// Dimension of the stage that moves with the loop
    pub dim: usize,
    /// False if the region does not move at all and is only computed on
    /// the first iteration
    pub moving: bool,
    /// Region extent per iteration, if constant
    pub window: Option<i64>,
    /// Advance of the region per iteration, if constant
    pub growth: Option<i64>,
    /// Bounds of the region along `dim` as functions of the loop variable
    pub region_min: Expr,
    pub region_max: Expr,
}

/// Why a stage was not slid.
#[derive(Debug, Clone, PartialEq)]
pub struct SlideRefusal {
    pub kind: FoldErrorKind,
    pub dim: Option<usize>,
    pub reason: String,
}

/// Per-stage outcome of the analysis.
#[derive(Debug, Clone, PartialEq)]
pub enum SlideOutcome {
    Slid(SlideInfo),
    Refused(SlideRefusal),
}

fn refuse(kind: FoldErrorKind, dim: Option<usize>, reason: impl Into<String>) -> SlideOutcome {
    SlideOutcome::Refused(SlideRefusal { kind, dim, reason: reason.into() })
}

fn find_realize<'a>(s: &'a Stmt, stage: &str) -> Option<&'a Stmt> {
    if matches!(s, Stmt::Realize { name, .. } if name == stage) {
        return Some(s);
    }
    s.children().into_iter().find_map(|c| find_realize(c, stage))
}

/// Nodes from `s` down to (excluding) the producer of `stage`.
fn path_to_producer<'a>(s: &'a Stmt, stage: &str, path: &mut Vec<&'a Stmt>) -> bool {
    if matches!(s, Stmt::ProducerConsumer { name, .. } if name == stage) {
        return true;
    }
    for c in s.children() {
        if c.contains_producer(stage) {
            path.push(s);
            return path_to_producer(c, stage, path);
        }
    }
    false
}

fn replace_let_value(s: Stmt, let_name: &str, value: &Expr) -> Stmt {
    match s {
        Stmt::LetStmt { name, body, .. } if name == let_name => {
            Stmt::LetStmt { name, value: value.clone(), body }
        }
        other => other.map_children(|c| replace_let_value(c, let_name, value)),
    }
}

fn analyze(tree: &Stmt, stage: &Stage) -> SlideOutcome {
    if stage.has_updates() {
        return refuse(FoldErrorKind::Unsupported, None, "stage has update definitions");
    }
    let Some(Stmt::Realize { body, .. }) = find_realize(tree, &stage.name) else {
        return refuse(FoldErrorKind::NoSlidingLoop, None, "stage is not realized");
    };
    let mut path = Vec::new();
    if !path_to_producer(body, &stage.name, &mut path) {
        return refuse(FoldErrorKind::NoSlidingLoop, None, "producer not found under its storage");
    }
    let Some(loop_pos) = path.iter().rposition(|s| matches!(s, Stmt::For { .. })) else {
        return refuse(
            FoldErrorKind::NoSlidingLoop,
            None,
            "stage is computed at the same level it is stored",
        );
    };
    for s in &path[..loop_pos] {
        if let Stmt::For { name, kind, .. } = s {
            if kind.is_parallel() || *kind == ForKind::Vectorized {
                return refuse(
                    FoldErrorKind::NoSlidingLoop,
                    None,
                    format!("{:?} loop `{}` lies between storage and computation", kind, name),
                );
            }
        }
    }
    let Stmt::For { name: loop_name, kind, min: loop_min, .. } = path[loop_pos] else {
        return refuse(FoldErrorKind::NoSlidingLoop, None, "no loop");
    };
    if !matches!(kind, ForKind::Serial | ForKind::Parallel) {
        return refuse(
            FoldErrorKind::NoSlidingLoop,
            None,
            format!("{:?} loop `{}` cannot carry values between iterations", kind, loop_name),
        );
    }

    // Lets between the loop and the producer, innermost first.
    let mut lets: Vec<(&str, &Expr)> = Vec::new();
    for s in &path[loop_pos + 1..] {
        match s {
            Stmt::LetStmt { name, value, .. } => lets.push((name.as_str(), value)),
            Stmt::IfThenElse { .. } | Stmt::For { .. } => {
                return refuse(FoldErrorKind::NoSlidingLoop, None, "producer is computed conditionally");
            }
            _ => {}
        }
    }
    lets.reverse();
    let lookup = |name: &str| -> Option<Expr> {
        let (pos, value) = lets.iter().enumerate().find(|(_, (n, _))| *n == name).map(|(i, (_, v))| (i, *v))?;
        // Only lets outside this one can appear in its value.
        let mut e = value.clone();
        for (n, v) in &lets[pos + 1..] {
            e = e.substitute(n, v);
        }
        Some(simplify(&e))
    };

    let mut moving = Vec::new();
    let mut bounds = Vec::new();
    for (d, arg) in stage.args.iter().enumerate() {
        let (Some(lo), Some(hi)) = (lookup(&min_name(&stage.name, 0, arg)), lookup(&max_name(&stage.name, 0, arg))) else {
            return refuse(FoldErrorKind::NoSlidingLoop, Some(d), "region lets not found");
        };
        let (m_lo, m_hi) = (is_monotonic(&lo, loop_name), is_monotonic(&hi, loop_name));
        trace!("{} dim {}: min {} ({}), max {} ({})", stage.name, d, lo, m_lo, hi, m_hi);
        if m_lo != Monotonic::Constant || m_hi != Monotonic::Constant {
            if !m_lo.is_non_decreasing() || !m_hi.is_non_decreasing() {
                return refuse(
                    FoldErrorKind::NonMonotonic,
                    Some(d),
                    format!("region of `{}` does not grow monotonically with `{}`", arg, loop_name),
                );
            }
            moving.push(d);
        }
        bounds.push((lo, hi));
    }
    if bounds.is_empty() {
        return refuse(FoldErrorKind::Unsupported, None, "stage has no dimensions");
    }
    let dim = match moving.as_slice() {
        [] => 0,
        [d] => *d,
        _ => {
            return refuse(
                FoldErrorKind::Unsupported,
                None,
                format!("region moves along {} dimensions", moving.len()),
            )
        }
    };
    if stage.definitions[0].schedule.splits(&stage.args[dim]) {
        return refuse(
            FoldErrorKind::Unsupported,
            Some(dim),
            format!("loop over `{}` is split", stage.args[dim]),
        );
    }
    let (lo, hi) = &bounds[dim];
    let prev_hi = hi.substitute(loop_name, &(Expr::var(loop_name.clone()) - 1));
    SlideOutcome::Slid(SlideInfo {
        stage: stage.name.clone(),
        loop_name: loop_name.clone(),
        loop_kind: *kind,
        loop_min: loop_min.clone(),
        dim,
        moving: !moving.is_empty(),
        window: const_value(&(hi.clone() - lo.clone() + 1)),
        growth: constant_difference(hi, &prev_hi),
        region_min: lo.clone(),
        region_max: hi.clone(),
    })
}

fn apply_slide(tree: Stmt, stage: &Stage, info: &SlideInfo) -> Stmt {
    let min_let = min_name(&stage.name, 0, &stage.args[info.dim]);
    let v = Expr::var(info.loop_name.clone());
    let prev_hi = simplify(&info.region_max.substitute(&info.loop_name, &(v.clone() - 1)));
    let slid = Expr::select(Expr::gt(v, info.loop_min.clone()), prev_hi + 1, info.region_min.clone());
    debug!("sliding `{}` along `{}` in dimension {}", stage.name, info.loop_name, info.dim);
    replace_let_value(tree, &min_let, &slid)
}

/// Result of the sliding window pass.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindows {
    pub outcomes: BTreeMap<String, SlideOutcome>,
}

impl SlidingWindows {
    pub fn slid(&self, stage: &str) -> Option<&SlideInfo> {
        match self.outcomes.get(stage) {
            Some(SlideOutcome::Slid(info)) => Some(info),
            _ => None,
        }
    }

    pub fn slides(&self) -> impl Iterator<Item = &SlideInfo> {
        self.outcomes.values().filter_map(|o| match o {
            SlideOutcome::Slid(info) => Some(info),
            SlideOutcome::Refused(_) => None,
        })
    }
}

/// Slide every eligible stage of `graph` realized in `tree`.
pub fn slide_windows(tree: Stmt, graph: &StageGraph, enabled: bool) -> (Stmt, SlidingWindows) {
    let mut result = SlidingWindows::default();
    let mut tree = tree;
    for stage in &graph.stages {
        if stage.is_input() || !tree.contains_producer(&stage.name) {
            continue;
        }
        if !enabled {
            result.outcomes.insert(
                stage.name.clone(),
                refuse(FoldErrorKind::NoSlidingLoop, None, "sliding window is disabled"),
            );
            continue;
        }
        let outcome = analyze(&tree, stage);
        if let SlideOutcome::Slid(info) = &outcome {
            tree = apply_slide(tree, stage, info);
        } else if let SlideOutcome::Refused(r) = &outcome {
            trace!("not sliding `{}`: {}", stage.name, r.reason);
        }
        result.outcomes.insert(stage.name.clone(), outcome);
    }
    (tree, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::stmt::Range;

    /// realize f { for y { let f.s0.x.min/max; let f.s0.y.min/max; produce f; consume } }
    fn tree(y_min: Expr, y_max: Expr, kind: ForKind) -> Stmt {
        let pc = Stmt::ProducerConsumer {
            name: "f".into(),
            produce: Box::new(Stmt::NoOp),
            updates: vec![],
            consume: Box::new(Stmt::NoOp),
        };
        let lets = [
            ("f.s0.x.min", Expr::int(0)),
            ("f.s0.x.max", Expr::int(7)),
            ("f.s0.y.min", y_min),
            ("f.s0.y.max", y_max),
        ];
        let body = lets
            .into_iter()
            .rev()
            .fold(pc, |b, (n, v)| Stmt::let_stmt(n, v, b));
        Stmt::Realize {
            name: "f".into(),
            values: 1,
            bounds: vec![Range::new(0, 8), Range::new(-1, 10)],
            folds: vec![],
            body: Box::new(Stmt::for_loop("out.s0.y", Expr::int(0), Expr::int(8), kind, body)),
        }
    }

    fn stage() -> StageGraph {
        let mut g = StageGraph::new();
        g.add_stage("f", &["x", "y"], Expr::var("x") + Expr::var("y"));
        g
    }

    fn y() -> Expr {
        Expr::var("out.s0.y")
    }

    #[test]
    fn test_stencil_slides() {
        let g = stage();
        let t = tree(y() - 1, y() + 1, ForKind::Serial);
        let (t, result) = slide_windows(t, &g, true);
        let info = result.slid("f").unwrap();
        assert_eq!(info.dim, 1);
        assert_eq!(info.window, Some(3));
        assert_eq!(info.growth, Some(1));
        assert!(info.moving);
        let text = t.to_string();
        assert!(text.contains("let f.s0.y.min = select((0 < out.s0.y), (out.s0.y + 1), (out.s0.y - 1))"));
    }

    #[test]
    fn test_non_monotonic_is_refused() {
        let g = stage();
        let t = tree(Expr::int(0) - y(), Expr::int(0) - y(), ForKind::Serial);
        let (_, result) = slide_windows(t, &g, true);
        match result.outcomes.get("f") {
            Some(SlideOutcome::Refused(r)) => assert_eq!(r.kind, FoldErrorKind::NonMonotonic),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_vector_loop_prevents_sliding() {
        let g = stage();
        let t = tree(y() - 1, y() + 1, ForKind::Vectorized);
        let (_, result) = slide_windows(t, &g, true);
        assert!(result.slid("f").is_none());
    }

    #[test]
    fn test_constant_region_computed_once() {
        let g = stage();
        let t = tree(Expr::int(0), Expr::int(3), ForKind::Serial);
        let (_, result) = slide_windows(t, &g, true);
        let info = result.slid("f").unwrap();
        assert!(!info.moving);
        assert_eq!(info.dim, 0);
        assert_eq!(info.growth, Some(0));
    }
}
