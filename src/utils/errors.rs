//! Error types for the lowering pipeline.
//!
//! Every lowering failure is one of four kinds, matching the pass that
//! detects it: graph errors (realization order), bounds errors (bounds
//! inference), schedule conflicts (loop synthesis and realization) and
//! fold-safety violations (storage planning). None of them is recoverable;
//! the first one aborts the run.

use std::fmt;
use thiserror::Error;

/// Top-level error type for lowering.
#[derive(Error, Debug, Clone)]
pub enum LowerError {
    /// Error in the shape of the stage graph or its nesting
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// A required region could not be computed
    #[error("Bounds error: {0}")]
    Bounds(#[from] BoundsError),

    /// A schedule directive is invalid or contradicts another constraint
    #[error("Schedule conflict: {0}")]
    Schedule(#[from] ScheduleError),

    /// A requested storage fold is unsound
    #[error("Fold-safety violation: {0}")]
    FoldSafety(#[from] FoldError),

    /// Internal compiler error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LowerError {
    /// The stage the error is attributed to, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            LowerError::Graph(e) => e.stages.first().map(|s| s.as_str()),
            LowerError::Bounds(e) => Some(&e.stage),
            LowerError::Schedule(e) => Some(&e.stage),
            LowerError::FoldSafety(e) => Some(&e.stage),
            LowerError::Internal(_) => None,
        }
    }

    /// Build an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        LowerError::Internal(message.into())
    }
}

/// Error in the stage graph: cycles, bad nesting, unknown stages.
#[derive(Error, Debug, Clone)]
pub struct GraphError {
    /// The error message
    pub message: String,
    /// Stages involved (for a cycle, every stage on it)
    pub stages: Vec<String>,
    /// The kind of graph error
    pub kind: GraphErrorKind,
}

impl GraphError {
    pub fn new(kind: GraphErrorKind, message: impl Into<String>, stages: Vec<String>) -> Self {
        Self { message: message.into(), stages, kind }
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.stages.is_empty() {
            write!(f, " (stages: {})", self.stages.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Cycle among realization constraints
    Cycle,
    /// A stage nested inside itself
    SelfNesting,
    /// Reference to a stage that does not exist
    UnknownStage,
    /// Two stages with the same name
    DuplicateStage,
    /// Nesting that crosses a device boundary or targets an input
    InvalidNesting,
    /// A pure definition that calls its own stage
    RecursiveDefinition,
    /// Wrong number of arguments in a call or definition
    ArityMismatch,
    /// An output stage consumed by another stage
    OutputConsumed,
    /// An update refers to a pure variable it does not iterate
    FreeVariable,
}

/// Error during bounds inference.
#[derive(Error, Debug, Clone)]
pub struct BoundsError {
    /// The error message
    pub message: String,
    /// Stage whose region could not be computed
    pub stage: String,
    /// Offending dimension, if known
    pub dim: Option<String>,
    /// The kind of bounds error
    pub kind: BoundsErrorKind,
}

impl BoundsError {
    pub fn new(kind: BoundsErrorKind, stage: &str, dim: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stage: stage.to_string(),
            dim: dim.map(|d| d.to_string()),
            kind,
        }
    }
}

impl fmt::Display for BoundsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (stage `{}`", self.message, self.stage)?;
        if let Some(ref dim) = self.dim {
            write!(f, ", dimension `{}`", dim)?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundsErrorKind {
    /// An access expression has no finite bound
    Unbounded,
    /// A bound does not fit in a 64-bit integer
    Overflow,
    /// Requested output region has the wrong dimensionality
    RegionMismatch,
}

/// A schedule directive is invalid, illegal for the target, or conflicts
/// with a bound.
#[derive(Error, Debug, Clone)]
pub struct ScheduleError {
    /// The error message
    pub message: String,
    /// Stage carrying the schedule
    pub stage: String,
    /// The responsible directive, rendered
    pub directive: Option<String>,
    /// The kind of schedule error
    pub kind: ScheduleErrorKind,
}

impl ScheduleError {
    pub fn new(kind: ScheduleErrorKind, stage: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stage: stage.to_string(),
            directive: None,
            kind,
        }
    }

    /// Attach the responsible directive.
    pub fn with_directive(mut self, directive: impl fmt::Display) -> Self {
        self.directive = Some(directive.to_string());
        self
    }
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (stage `{}`", self.message, self.stage)?;
        if let Some(ref d) = self.directive {
            write!(f, ", directive `{}`", d)?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleErrorKind {
    /// Directive names a dimension the definition does not have
    UnknownDimension,
    /// Directive introduces a name that already exists
    DuplicateDimension,
    /// Split/vectorize/unroll factor is not positive
    InvalidFactor,
    /// Explicit bound contradicts a required or requested region
    BoundConflict,
    /// Directive not supported by the target
    UnsupportedByTarget,
    /// Compute or store level cannot be honoured
    InvalidLevel,
    /// Reorder or fuse would change update semantics or is malformed
    IllegalReorder,
    /// Tail strategy not allowed here
    IllegalTail,
    /// Loop kind not allowed for this variable
    IllegalLoopKind,
}

/// A storage fold request that is not provably safe.
#[derive(Error, Debug, Clone)]
pub struct FoldError {
    /// The error message
    pub message: String,
    /// Stage whose storage was to be folded
    pub stage: String,
    /// Dimension of the fold
    pub dim: String,
    /// The kind of fold violation
    pub kind: FoldErrorKind,
}

impl FoldError {
    pub fn new(kind: FoldErrorKind, stage: &str, dim: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stage: stage.to_string(),
            dim: dim.to_string(),
            kind,
        }
    }
}

impl fmt::Display for FoldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (stage `{}`, dimension `{}`)", self.message, self.stage, self.dim)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldErrorKind {
    /// Region is not monotonically non-decreasing in the loop variable
    NonMonotonic,
    /// Window size or growth is not a compile-time constant
    UnboundedWindow,
    /// Requested factor is smaller than the window
    FactorTooSmall,
    /// No loop over which the region could slide
    NoSlidingLoop,
    /// Stage shape or schedule excludes folding
    Unsupported,
}

/// Error raised by the reference executor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    #[error("access to `{buffer}` at index {index} outside allocation of size {size}")]
    OutOfBounds { buffer: String, index: i64, size: usize },

    #[error("unknown buffer `{0}`")]
    UnknownBuffer(String),

    #[error("unbound variable `{0}`")]
    UnboundVariable(String),

    #[error("assertion failed: {0}")]
    AssertionFailed(String),

    #[error("wait on semaphore `{0}` timed out")]
    Deadlock(String),

    #[error("cannot execute: {0}")]
    Unsupported(String),
}

/// A diagnostic message with severity level.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Severity level
    pub severity: DiagnosticSeverity,
    /// Message
    pub message: String,
    /// Additional notes
    pub notes: Vec<String>,
    /// Suggested fix (if any)
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSeverity {
    /// Error - lowering cannot continue
    Error,
    /// Warning - lowering continues but the schedule was adjusted
    Warning,
    /// Note - informational message
    Note,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            message: message.into(),
            notes: Vec::new(),
            suggestion: None,
        }
    }

    /// Create a new warning diagnostic.
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Warning,
            message: message.into(),
            notes: Vec::new(),
            suggestion: None,
        }
    }

    /// Add a note to the diagnostic.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Add a suggestion to the diagnostic.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl From<&LowerError> for Diagnostic {
    fn from(err: &LowerError) -> Self {
        match err {
            LowerError::Graph(e) => {
                let mut d = Diagnostic::error(e.message.clone());
                for s in &e.stages {
                    d = d.with_note(format!("involves stage `{}`", s));
                }
                if e.kind == GraphErrorKind::Cycle {
                    d = d.with_suggestion("break the cycle by changing a compute_at/store_at level");
                }
                d
            }
            LowerError::Bounds(e) => {
                let mut d = Diagnostic::error(e.message.clone())
                    .with_note(format!("while inferring the region of `{}`", e.stage));
                if let Some(ref dim) = e.dim {
                    d = d.with_note(format!("dimension `{}`", dim));
                }
                d.with_suggestion("clamp the access or add an explicit bound")
            }
            LowerError::Schedule(e) => {
                let mut d = Diagnostic::error(e.message.clone())
                    .with_note(format!("in the schedule of `{}`", e.stage));
                if let Some(ref directive) = e.directive {
                    d = d.with_note(format!("caused by `{}`", directive));
                }
                d
            }
            LowerError::FoldSafety(e) => Diagnostic::error(e.message.clone())
                .with_note(format!("storage of `{}` along `{}`", e.stage, e.dim))
                .with_suggestion("remove the fold_storage request or change the store level"),
            LowerError::Internal(msg) => Diagnostic::error(msg.clone()),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            DiagnosticSeverity::Error => "error",
            DiagnosticSeverity::Warning => "warning",
            DiagnosticSeverity::Note => "note",
        };
        writeln!(f, "{}: {}", tag, self.message)?;
        for note in &self.notes {
            writeln!(f, "  = note: {}", note)?;
        }
        if let Some(ref s) = self.suggestion {
            writeln!(f, "  = help: {}", s)?;
        }
        Ok(())
    }
}

/// Result type using LowerError.
pub type LowerResult<T> = Result<T, LowerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScheduleError::new(ScheduleErrorKind::UnknownDimension, "blur", "no dimension `z`")
            .with_directive("split(z, zo, zi, 8)");
        let s = format!("{}", err);
        assert!(s.contains("no dimension `z`"));
        assert!(s.contains("blur"));
        assert!(s.contains("split(z, zo, zi, 8)"));
    }

    #[test]
    fn test_diagnostic_from_cycle() {
        let err = LowerError::from(GraphError::new(
            GraphErrorKind::Cycle,
            "cycle in realization order",
            vec!["f".to_string(), "g".to_string()],
        ));
        assert_eq!(err.stage(), Some("f"));
        let d = Diagnostic::from(&err);
        assert_eq!(d.notes.len(), 2);
        assert!(d.suggestion.is_some());
        assert!(d.to_string().starts_with("error: cycle"));
    }
}
