//! Schedules: where a stage is computed and stored, and how each of its
//! definitions is iterated.
//!
//! A stage schedule fixes the compute and store levels, explicit bounds and
//! storage folds. A definition schedule is an ordered list of loop
//! directives applied one after another to the definition's dimension list.
//!
//! ```text
//! let mut s = DefinitionSchedule::default();
//! s.split("x", "xo", "xi", 8).vectorize("xi", None).parallel("y");
//! ```

use crate::ir::expr::Expr;
use crate::ir::stage::StageId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A loop level in the schedule of another stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoopLevel {
    /// Substituted into every caller
    #[default]
    Inlined,
    /// Outside all loops
    Root,
    /// Inside loop `var` of definition `definition` of `stage`
    At {
        stage: StageId,
        definition: usize,
        var: String,
    },
}

impl LoopLevel {
    pub fn at(stage: StageId, var: impl Into<String>) -> Self {
        LoopLevel::At { stage, definition: 0, var: var.into() }
    }

    pub fn is_inlined(&self) -> bool {
        matches!(self, LoopLevel::Inlined)
    }

    pub fn is_root(&self) -> bool {
        matches!(self, LoopLevel::Root)
    }

    /// The host stage for `At` levels.
    pub fn stage(&self) -> Option<StageId> {
        match self {
            LoopLevel::At { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// How a split handles an extent that is not a multiple of the factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TailStrategy {
    /// `ShiftInwards` for pure definitions, `GuardWithIf` for updates
    #[default]
    Auto,
    /// Skip iterations past the end
    GuardWithIf,
    /// Move the last block back so it ends at the last coordinate
    ShiftInwards,
    /// Compute the region rounded up to a multiple of the factor
    RoundUp,
}

/// A loop directive of a definition schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Directive {
    Split {
        old: String,
        outer: String,
        inner: String,
        factor: i64,
        #[serde(default)]
        tail: TailStrategy,
    },
    Fuse {
        inner: String,
        outer: String,
        fused: String,
    },
    /// Variables listed outermost first
    Reorder(Vec<String>),
    Vectorize {
        var: String,
        width: Option<i64>,
    },
    Unroll {
        var: String,
        factor: Option<i64>,
    },
    Parallel(String),
    Tile {
        x: String,
        y: String,
        xo: String,
        yo: String,
        xi: String,
        yi: String,
        x_factor: i64,
        y_factor: i64,
        #[serde(default)]
        tail: TailStrategy,
    },
    GpuBlocks(String),
    GpuThreads(String),
    GpuTile {
        var: String,
        block: String,
        thread: String,
        size: i64,
        #[serde(default)]
        tail: TailStrategy,
    },
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Split { old, outer, inner, factor, tail } => {
                write!(f, "split({}, {}, {}, {}", old, outer, inner, factor)?;
                if *tail != TailStrategy::Auto {
                    write!(f, ", {:?}", tail)?;
                }
                write!(f, ")")
            }
            Directive::Fuse { inner, outer, fused } => write!(f, "fuse({}, {}, {})", inner, outer, fused),
            Directive::Reorder(vars) => write!(f, "reorder({})", vars.join(", ")),
            Directive::Vectorize { var, width: Some(w) } => write!(f, "vectorize({}, {})", var, w),
            Directive::Vectorize { var, width: None } => write!(f, "vectorize({})", var),
            Directive::Unroll { var, factor: Some(k) } => write!(f, "unroll({}, {})", var, k),
            Directive::Unroll { var, factor: None } => write!(f, "unroll({})", var),
            Directive::Parallel(v) => write!(f, "parallel({})", v),
            Directive::Tile { x, y, xo, yo, xi, yi, x_factor, y_factor, .. } => write!(
                f,
                "tile({}, {}, {}, {}, {}, {}, {}, {})",
                x, y, xo, yo, xi, yi, x_factor, y_factor
            ),
            Directive::GpuBlocks(v) => write!(f, "gpu_blocks({})", v),
            Directive::GpuThreads(v) => write!(f, "gpu_threads({})", v),
            Directive::GpuTile { var, block, thread, size, .. } => {
                write!(f, "gpu_tile({}, {}, {}, {})", var, block, thread, size)
            }
        }
    }
}

/// Ordered loop directives for one definition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DefinitionSchedule {
    pub directives: Vec<Directive>,
}

impl DefinitionSchedule {
    pub fn split(&mut self, old: &str, outer: &str, inner: &str, factor: i64) -> &mut Self {
        self.split_with_tail(old, outer, inner, factor, TailStrategy::Auto)
    }

    pub fn split_with_tail(
        &mut self,
        old: &str,
        outer: &str,
        inner: &str,
        factor: i64,
        tail: TailStrategy,
    ) -> &mut Self {
        self.directives.push(Directive::Split {
            old: old.into(),
            outer: outer.into(),
            inner: inner.into(),
            factor,
            tail,
        });
        self
    }

    pub fn fuse(&mut self, inner: &str, outer: &str, fused: &str) -> &mut Self {
        self.directives.push(Directive::Fuse {
            inner: inner.into(),
            outer: outer.into(),
            fused: fused.into(),
        });
        self
    }

    /// Reorder the listed loops; `vars[0]` becomes the outermost.
    pub fn reorder(&mut self, vars: &[&str]) -> &mut Self {
        self.directives
            .push(Directive::Reorder(vars.iter().map(|v| v.to_string()).collect()));
        self
    }

    pub fn vectorize(&mut self, var: &str, width: Option<i64>) -> &mut Self {
        self.directives.push(Directive::Vectorize { var: var.into(), width });
        self
    }

    pub fn unroll(&mut self, var: &str, factor: Option<i64>) -> &mut Self {
        self.directives.push(Directive::Unroll { var: var.into(), factor });
        self
    }

    pub fn parallel(&mut self, var: &str) -> &mut Self {
        self.directives.push(Directive::Parallel(var.into()));
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn tile(
        &mut self,
        x: &str,
        y: &str,
        xo: &str,
        yo: &str,
        xi: &str,
        yi: &str,
        x_factor: i64,
        y_factor: i64,
    ) -> &mut Self {
        self.directives.push(Directive::Tile {
            x: x.into(),
            y: y.into(),
            xo: xo.into(),
            yo: yo.into(),
            xi: xi.into(),
            yi: yi.into(),
            x_factor,
            y_factor,
            tail: TailStrategy::Auto,
        });
        self
    }

    pub fn gpu_blocks(&mut self, var: &str) -> &mut Self {
        self.directives.push(Directive::GpuBlocks(var.into()));
        self
    }

    pub fn gpu_threads(&mut self, var: &str) -> &mut Self {
        self.directives.push(Directive::GpuThreads(var.into()));
        self
    }

    pub fn gpu_tile(&mut self, var: &str, block: &str, thread: &str, size: i64) -> &mut Self {
        self.directives.push(Directive::GpuTile {
            var: var.into(),
            block: block.into(),
            thread: thread.into(),
            size,
            tail: TailStrategy::Auto,
        });
        self
    }

    /// True if some directive splits `var` (directly or via a shorthand).
    pub fn splits(&self, var: &str) -> bool {
        self.directives.iter().any(|d| match d {
            Directive::Split { old, .. } => old == var,
            Directive::Tile { x, y, .. } => x == var || y == var,
            Directive::GpuTile { var: v, .. } => v == var,
            Directive::Vectorize { var: v, width: Some(_) } => v == var,
            Directive::Unroll { var: v, factor: Some(_) } => v == var,
            _ => false,
        })
    }
}

/// An explicit `bound(var, min, extent)` on a pure dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bound {
    pub var: String,
    pub min: Expr,
    pub extent: Expr,
}

/// An explicit `fold_storage(var, factor)` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldRequest {
    pub var: String,
    pub factor: i64,
}

/// Per-stage schedule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSchedule {
    pub compute_level: LoopLevel,
    /// Defaults to the compute level
    pub store_level: Option<LoopLevel>,
    pub bounds: Vec<Bound>,
    pub folds: Vec<FoldRequest>,
}

impl StageSchedule {
    pub fn compute_root(&mut self) -> &mut Self {
        self.compute_level = LoopLevel::Root;
        self
    }

    pub fn compute_inline(&mut self) -> &mut Self {
        self.compute_level = LoopLevel::Inlined;
        self.store_level = None;
        self
    }

    /// Compute inside loop `var` of the pure definition of `stage`.
    pub fn compute_at(&mut self, stage: StageId, var: &str) -> &mut Self {
        self.compute_level = LoopLevel::at(stage, var);
        self
    }

    /// Compute inside loop `var` of definition `definition` of `stage`.
    pub fn compute_at_definition(&mut self, stage: StageId, definition: usize, var: &str) -> &mut Self {
        self.compute_level = LoopLevel::At { stage, definition, var: var.into() };
        self
    }

    pub fn store_root(&mut self) -> &mut Self {
        self.store_level = Some(LoopLevel::Root);
        self
    }

    pub fn store_at(&mut self, stage: StageId, var: &str) -> &mut Self {
        self.store_level = Some(LoopLevel::at(stage, var));
        self
    }

    pub fn bound(&mut self, var: &str, min: impl Into<Expr>, extent: impl Into<Expr>) -> &mut Self {
        self.bounds.push(Bound { var: var.into(), min: min.into(), extent: extent.into() });
        self
    }

    pub fn fold_storage(&mut self, var: &str, factor: i64) -> &mut Self {
        self.folds.push(FoldRequest { var: var.into(), factor });
        self
    }

    /// The effective store level.
    pub fn store_level(&self) -> &LoopLevel {
        self.store_level.as_ref().unwrap_or(&self.compute_level)
    }

    pub fn bound_for(&self, var: &str) -> Option<&Bound> {
        self.bounds.iter().find(|b| b.var == var)
    }
}
