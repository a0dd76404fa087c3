//! Storage folding.
//!
//! A slid stage only ever needs the last few rows of its region along the
//! sliding dimension, so that dimension of its storage can become a
//! circular buffer of `factor` rows: coordinate `c` is stored at `c mod
//! factor`. Folds are either requested explicitly (`fold_storage`) and
//! then verified, or chosen automatically for stages with a constant
//! window and growth.

use crate::analysis::simplify::const_value;
use crate::ir::stage::{Stage, StageGraph};
use crate::ir::stmt::{ForKind, Stmt, StorageFold};
use crate::transform::sliding_window::{SlideInfo, SlideOutcome, SlidingWindows};
use crate::utils::errors::{FoldError, FoldErrorKind, LowerResult};
use log::{debug, warn};
use serde::Serialize;

/// A fold applied to a realization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FoldPlan {
    pub stage: String,
    pub dim: usize,
    pub factor: i64,
    /// Requested by the schedule rather than chosen automatically
    pub explicit: bool,
}

fn fold_error(kind: FoldErrorKind, stage: &Stage, dim: &str, message: impl Into<String>) -> FoldError {
    FoldError::new(kind, &stage.name, dim, message)
}

/// Check an explicit request against the sliding analysis.
fn verify_request(stage: &Stage, var: &str, factor: i64, outcome: Option<&SlideOutcome>) -> LowerResult<FoldPlan> {
    let Some(dim) = stage.dim_index(var) else {
        return Err(fold_error(
            FoldErrorKind::Unsupported,
            stage,
            var,
            format!("`{}` has no dimension `{}`", stage.name, var),
        )
        .into());
    };
    let info: &SlideInfo = match outcome {
        Some(SlideOutcome::Slid(info)) => info,
        Some(SlideOutcome::Refused(r)) => {
            return Err(fold_error(r.kind, stage, var, format!("cannot fold storage: {}", r.reason)).into())
        }
        None => {
            return Err(fold_error(FoldErrorKind::NoSlidingLoop, stage, var, "stage is not realized").into())
        }
    };
    if info.dim != dim {
        return Err(fold_error(
            FoldErrorKind::Unsupported,
            stage,
            var,
            format!(
                "region of `{}` slides along `{}`, not `{}`",
                stage.name, stage.args[info.dim], var
            ),
        )
        .into());
    }
    let Some(window) = info.window else {
        return Err(fold_error(
            FoldErrorKind::UnboundedWindow,
            stage,
            var,
            format!("window of `{}` along `{}` is not constant", stage.name, info.loop_name),
        )
        .into());
    };
    if factor < window {
        return Err(fold_error(
            FoldErrorKind::FactorTooSmall,
            stage,
            var,
            format!("fold factor {} is smaller than the window {}", factor, window),
        )
        .into());
    }
    if info.loop_kind == ForKind::Parallel && info.moving && !matches!(info.growth, Some(g) if g > 0) {
        return Err(fold_error(
            FoldErrorKind::UnboundedWindow,
            stage,
            var,
            format!("growth of `{}` along parallel loop `{}` is not constant", stage.name, info.loop_name),
        )
        .into());
    }
    Ok(FoldPlan { stage: stage.name.clone(), dim, factor, explicit: true })
}

fn realized_extent(tree: &Stmt, stage: &str, dim: usize) -> Option<i64> {
    let mut extent = None;
    tree.visit(&mut |s| {
        if let Stmt::Realize { name, bounds, .. } = s {
            if name == stage {
                extent = bounds.get(dim).and_then(|r| const_value(&r.extent));
            }
        }
    });
    extent
}

fn automatic(tree: &Stmt, info: &SlideInfo) -> Option<FoldPlan> {
    if !info.moving {
        return None;
    }
    let (window, growth) = (info.window?, info.growth?);
    if growth <= 0 {
        return None;
    }
    let factor = window + growth;
    if matches!(realized_extent(tree, &info.stage, info.dim), Some(e) if e <= factor) {
        return None;
    }
    Some(FoldPlan { stage: info.stage.clone(), dim: info.dim, factor, explicit: false })
}

fn apply_fold(tree: Stmt, plan: &FoldPlan) -> Stmt {
    match tree {
        Stmt::Realize { name, values, bounds, mut folds, body } if name == plan.stage => {
            folds.retain(|f| f.dim != plan.dim);
            folds.push(StorageFold { dim: plan.dim, factor: plan.factor });
            Stmt::Realize { name, values, bounds, folds, body }
        }
        other => other.map_children(|c| apply_fold(c, plan)),
    }
}

/// Verify explicit fold requests and choose automatic folds.
///
/// Explicit requests are checked even when `automatic_folds` is false.
pub fn fold_storage(
    tree: Stmt,
    graph: &StageGraph,
    windows: &SlidingWindows,
    automatic_folds: bool,
) -> LowerResult<(Stmt, Vec<FoldPlan>)> {
    let mut plans = Vec::new();
    for stage in &graph.stages {
        if stage.is_input() {
            continue;
        }
        let realized = tree.contains_producer(&stage.name);
        match stage.schedule.folds.as_slice() {
            [] => {
                if let (true, Some(info)) = (automatic_folds, windows.slid(&stage.name)) {
                    plans.extend(automatic(&tree, info));
                }
            }
            _ if !realized => {
                warn!("fold requests of `{}` are ignored: it is not realized", stage.name);
            }
            [request] => {
                plans.push(verify_request(stage, &request.var, request.factor, windows.outcomes.get(&stage.name))?);
            }
            [first, ..] => {
                return Err(fold_error(
                    FoldErrorKind::Unsupported,
                    stage,
                    &first.var,
                    format!("`{}` requests folds in more than one dimension", stage.name),
                )
                .into());
            }
        }
    }
    let mut tree = tree;
    for plan in &plans {
        debug!(
            "folding `{}` dimension {} by {}{}",
            plan.stage,
            plan.dim,
            plan.factor,
            if plan.explicit { "" } else { " (automatic)" }
        );
        tree = apply_fold(tree, plan);
    }
    Ok((tree, plans))
}

/// Semaphore lag of a fold: before producing iteration `i`, iterations up
/// to `i + lag - 1` must have finished reading.
pub fn consumer_lag(window: i64, growth: i64, factor: i64) -> Option<i64> {
    use num_integer::Integer;
    if growth <= 0 {
        return None;
    }
    Some(Integer::div_floor(&(window - 1 - factor), &growth) + 1)
}
