//! Analyses over stage graphs and statement trees.

pub mod bounds;
pub mod interval;
pub mod monotonic;
pub mod order;
pub mod simplify;

pub use bounds::{box_touched, boxes_touched, infer_bounds, Access, InferredBounds};
pub use interval::{bounds_of_expr, Interval, Region, Scope};
pub use monotonic::{is_monotonic, Monotonic};
pub use order::{realization_order, RealizationOrder};
pub use simplify::{can_prove, const_value, overflows, simplify};
