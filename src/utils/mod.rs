//! Shared utilities: error types and text layout.

pub mod errors;
pub mod pretty;

pub use errors::*;
pub use pretty::{format_list, CodeFormatter};
