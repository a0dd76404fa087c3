//! Intermediate representations.
//!
//! - [`expr`]: integer expressions
//! - [`stage`]: the stage graph (input to lowering)
//! - [`schedule`]: compute/store levels and loop directives
//! - [`stmt`]: the statement tree (output of lowering)
//! - [`target`]: target descriptors

pub mod expr;
pub mod schedule;
pub mod stage;
pub mod stmt;
pub mod target;

pub use expr::{BinOp, Expr};
pub use schedule::{
    Bound, DefinitionSchedule, Directive, FoldRequest, LoopLevel, StageSchedule, TailStrategy,
};
pub use stage::{buffer_name, Definition, OutputRequest, ReductionDomain, ReductionVariable, Stage, StageGraph, StageId};
pub use stmt::{ForKind, Range, Stmt, StorageFold, TransferDirection};
pub use target::{Feature, Target};
