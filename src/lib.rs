//! # pipelower - lowering for scheduled stage pipelines
//!
//! Turns a graph of pure integer stages plus a schedule into an imperative
//! statement tree:
//! - realization order and inlining
//! - bounds inference
//! - loop synthesis (split, fuse, reorder, loop kinds)
//! - sliding window and storage folding
//! - synchronization for parallel producer/consumer loops
//! - host/device transfer markers
//! - flattening to one-dimensional storage
//!
//! A reference interpreter executes lowered statements, and a direct
//! evaluator computes stage values from definitions alone, so any schedule
//! can be checked against the unscheduled meaning of the pipeline.
//!
//! ## Architecture
//!
//! ```text
//! StageGraph → order → realize → bounds → slide → fold → device → sync → flatten → Stmt
//! ```
//!
//! ## Example
//!
//! ```rust
//! use pipelower::prelude::*;
//!
//! let mut g = StageGraph::new();
//! g.add_input("in", &["x"]);
//! let x = Expr::var("x");
//! let f = g.add_stage("f", &["x"], Expr::call("in", vec![x.clone() - 1]) + Expr::call("in", vec![x.clone() + 1]));
//! let out = g.add_stage("out", &["x"], Expr::call("f", vec![x]));
//! g.schedule(f).compute_root();
//!
//! let lowered = pipelower::lower("blur", &g, &[OutputRequest::constant(out, &[(0, 8)])], &LowerConfig::default()).unwrap();
//! assert_eq!(lowered.order, vec!["in", "f", "out"]);
//! ```

#![warn(clippy::all)]

pub mod analysis;
pub mod interp;
pub mod ir;
pub mod transform;
pub mod utils;

pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::interp::{evaluate, run_pipeline, Buffer, ExecStats, Machine};
    pub use crate::ir::{
        Definition, Expr, ForKind, LoopLevel, OutputRequest, Range, ReductionDomain, Stage, StageGraph, StageId, Stmt,
        TailStrategy, Target,
    };
    pub use crate::transform::{LowerConfig, LoweredPipeline, Lowering, Transform};
    pub use crate::utils::errors::*;
}

pub use transform::pipeline::print_loop_nest;

use ir::{OutputRequest, StageGraph};
use transform::{LowerConfig, LoweredPipeline, Lowering};
use utils::errors::LowerResult;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lower `graph` for the requested outputs.
pub fn lower(
    name: &str,
    graph: &StageGraph,
    outputs: &[OutputRequest],
    config: &LowerConfig,
) -> LowerResult<LoweredPipeline> {
    Lowering::new(config).lower(name, graph, outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
