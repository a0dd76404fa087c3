//! Lowering passes over the stage graph and the statement tree.

pub mod device;
pub mod flatten;
pub mod inline;
pub mod loops;
pub mod pipeline;
pub mod realize;
pub mod simplify;
pub mod sliding_window;
pub mod storage_folding;
pub mod sync;

pub use pipeline::{BufferRole, ExternalBuffer, LowerConfig, LoweredPipeline, Lowering};
pub use simplify::SimplifyStmt;

use crate::ir::stmt::Stmt;
use crate::utils::errors::LowerResult;

/// A statement-to-statement pass.
pub trait Transform {
    /// Get the pass name.
    fn name(&self) -> &str;

    /// Rewrite `stmt` in place. Returns true if anything changed.
    fn apply(&self, stmt: &mut Stmt) -> LowerResult<bool>;
}
