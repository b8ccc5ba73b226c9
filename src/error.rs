//! Error types for arbiter.
//!
//! Subsystems raise their own `thiserror` enums ([`StorageError`],
//! [`EvalError`], [`WatchError`], ...). Everything a caller can act on is
//! rolled into [`ArbiterError`], whose [`ArbiterError::code`] gives the
//! stable category string used in responses.
//!
//! Conditions that leave the controller unable to serve consistent decisions
//! are [`FatalError`]s. They are never returned; the controller halts on them.

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::eval::EvalError;
use crate::policy::compiler::Diagnostic;
use crate::storage::{Path, StorageError};
use crate::watch::WatchError;

/// A module id is already in use.
pub const ENTRY_EXISTS_ERR: &str = "entry_exists";
/// A policy module failed to parse.
pub const MODULE_PARSE_ERR: &str = "module_parse_error";

/// Stable response categories returned by [`ArbiterError::code`].
pub mod codes {
    /// Unexpected failure inside arbiter or its store.
    pub const INTERNAL: &str = "internal_error";
    /// The request, query or policy was malformed.
    pub const INVALID_PARAMETER: &str = "invalid_parameter";
    /// The query was well formed but evaluation failed.
    pub const EVALUATION: &str = "evaluation_error";
    /// The named resource does not exist.
    pub const RESOURCE_NOT_FOUND: &str = "resource_not_found";
    /// The operation conflicts with current state.
    pub const RESOURCE_CONFLICT: &str = "resource_conflict";
    /// The call context was cancelled or timed out.
    pub const CANCELLED: &str = "cancelled";
}

const MSG_COMPILE_MODULE_ERROR: &str = "error(s) occurred while compiling module(s)";

/// An error with a machine-readable code and a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ClassifiedError {
    /// Category code, e.g. [`ENTRY_EXISTS_ERR`].
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ClassifiedError {
    /// Classify `message` under `code`.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// A code attached to an underlying error. Displays as the underlying error.
#[derive(Debug)]
pub struct WrappedError {
    /// Category code, e.g. [`MODULE_PARSE_ERR`].
    pub code: String,
    /// The underlying error.
    pub nested: Box<dyn StdError + Send + Sync + 'static>,
}

impl WrappedError {
    /// Attach `code` to `nested`.
    pub fn new(code: impl Into<String>, nested: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self {
            code: code.into(),
            nested: nested.into(),
        }
    }
}

impl fmt::Display for WrappedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.nested, f)
    }
}

impl StdError for WrappedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.nested.as_ref())
    }
}

/// Policy compilation failed with one or more diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    /// Diagnostics in report order.
    pub errors: Vec<Diagnostic>,
}

impl CompileError {
    /// Wrap compiler diagnostics.
    #[must_use]
    pub fn new(errors: Vec<Diagnostic>) -> Self {
        Self { errors }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MSG_COMPILE_MODULE_ERROR)?;
        if !self.errors.is_empty() {
            f.write_str(":")?;
        }
        for err in &self.errors {
            write!(f, "\n  {err}")?;
        }
        Ok(())
    }
}

impl StdError for CompileError {}

/// Caller-supplied configuration or arguments were rejected.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing")]
    MissingField { field: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Top-level error type for arbiter.
#[derive(Debug, Error)]
pub enum ArbiterError {
    /// Error with an explicit code, such as [`ENTRY_EXISTS_ERR`].
    #[error(transparent)]
    Classified(#[from] ClassifiedError),

    /// Underlying error tagged with a code.
    #[error(transparent)]
    Wrapped(#[from] WrappedError),

    /// Policy failed to compile.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Bad configuration or arguments.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Store operation failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Query evaluation failed.
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// Watch subsystem failed.
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Invariant violation inside arbiter.
    #[error("Internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl ArbiterError {
    /// Build an [`ArbiterError::Internal`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Response category for this error.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Classified(e) => e.code.as_str(),
            Self::Wrapped(e) => e.code.as_str(),
            Self::Compile(_) | Self::Validation(_) => codes::INVALID_PARAMETER,
            Self::Storage(e) => storage_code(e),
            Self::Eval(e) => eval_code(e),
            Self::Watch(WatchError::Closed { .. }) => codes::RESOURCE_CONFLICT,
            Self::Watch(WatchError::Eval(e)) => eval_code(e),
            Self::Watch(WatchError::Storage(e)) => storage_code(e),
            Self::Watch(_) | Self::Internal { .. } => codes::INTERNAL,
        }
    }

    /// True if a policy id was already taken.
    #[must_use]
    pub fn is_entry_exists(&self) -> bool {
        matches!(self, Self::Classified(e) if e.code == ENTRY_EXISTS_ERR)
    }

    /// True if a policy module failed to parse.
    #[must_use]
    pub fn is_module_parse(&self) -> bool {
        matches!(self, Self::Wrapped(e) if e.code == MODULE_PARSE_ERR)
    }

    /// True for compile failures.
    #[must_use]
    pub const fn is_compile(&self) -> bool {
        matches!(self, Self::Compile(_))
    }

    /// True for rejected configuration or arguments.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// True if the call context was cancelled or timed out.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        match self {
            Self::Storage(e) => matches!(e, StorageError::Cancelled(_)),
            Self::Eval(e) => e.is_cancelled(),
            _ => false,
        }
    }

    /// True for [`ArbiterError::Internal`].
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

const fn storage_code(e: &StorageError) -> &'static str {
    match e {
        StorageError::NotFound { .. } => codes::RESOURCE_NOT_FOUND,
        StorageError::Cancelled(_) => codes::CANCELLED,
        StorageError::InvalidPath(_) | StorageError::InvalidPatch(_) => codes::INVALID_PARAMETER,
        _ => codes::INTERNAL,
    }
}

const fn eval_code(e: &EvalError) -> &'static str {
    match e {
        EvalError::Parse(_) | EvalError::UnsafeQuery(_) => codes::INVALID_PARAMETER,
        EvalError::Cancelled(_) => codes::CANCELLED,
        EvalError::Storage(s) => storage_code(s),
        EvalError::SnapshotMiss { .. } => codes::INTERNAL,
        EvalError::Conflict { .. } | EvalError::Recursion { .. } => codes::EVALUATION,
    }
}

/// True only for a [`ClassifiedError`] (bare or as [`ArbiterError::Classified`])
/// carrying [`ENTRY_EXISTS_ERR`].
#[must_use]
pub fn is_entry_exists_error(err: &(dyn StdError + 'static)) -> bool {
    if let Some(e) = err.downcast_ref::<ClassifiedError>() {
        return e.code == ENTRY_EXISTS_ERR;
    }
    err.downcast_ref::<ArbiterError>()
        .is_some_and(ArbiterError::is_entry_exists)
}

/// True only for a [`WrappedError`] (bare or as [`ArbiterError::Wrapped`])
/// carrying [`MODULE_PARSE_ERR`].
#[must_use]
pub fn is_module_parse_error(err: &(dyn StdError + 'static)) -> bool {
    if let Some(e) = err.downcast_ref::<WrappedError>() {
        return e.code == MODULE_PARSE_ERR;
    }
    err.downcast_ref::<ArbiterError>()
        .is_some_and(ArbiterError::is_module_parse)
}

/// Result type alias for arbiter operations.
pub type ArbiterResult<T> = Result<T, ArbiterError>;

/// Conditions under which the controller must stop serving decisions.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum FatalError {
    /// The bundle revision exists but is not a string.
    #[error("corrupt manifest revision at {path}: expected string, found {found}")]
    BadRevision { path: Path, found: String },

    /// The bundle revision could not be read for a reason other than absence.
    #[error("failed to read manifest revision at {path}: {source}")]
    RevisionRead {
        path: Path,
        #[source]
        source: StorageError,
    },

    /// The change watcher could not be moved to a new compiled policy.
    #[error("failed to migrate watcher: {source}")]
    WatcherMigration {
        #[source]
        source: WatchError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::policy::parser::parse_module;

    #[test]
    fn classified_error_predicates() {
        let err = ClassifiedError::new(ENTRY_EXISTS_ERR, "module a already exists");
        assert_eq!(err.to_string(), "module a already exists");
        assert!(is_entry_exists_error(&err));
        assert!(!is_module_parse_error(&err));

        let other = ClassifiedError::new(codes::INTERNAL, "boom");
        assert!(!is_entry_exists_error(&other));

        let top = ArbiterError::from(err);
        assert!(is_entry_exists_error(&top));
        assert_eq!(top.code(), ENTRY_EXISTS_ERR);
    }

    #[test]
    fn wrapped_error_delegates_to_nested() {
        let parse = parse_module("m", "package").unwrap_err();
        let rendered = parse.to_string();
        let wrapped = WrappedError::new(MODULE_PARSE_ERR, parse);
        assert_eq!(wrapped.to_string(), rendered);
        assert!(wrapped.source().is_some());
        assert!(is_module_parse_error(&wrapped));
        assert!(!is_entry_exists_error(&wrapped));

        // A classified error with the parse code is not a wrapped parse error.
        assert!(!is_module_parse_error(&ClassifiedError::new(MODULE_PARSE_ERR, "x")));
    }

    #[test]
    fn compile_error_renders_template_and_diagnostics() {
        let err = CompileError::new(vec![
            Diagnostic::new(Diagnostic::UNSAFE_VAR_ERR, "var x is unsafe", None),
            Diagnostic::new(Diagnostic::TYPE_ERR, "bad default", None),
        ]);
        let msg = err.to_string();
        let mut lines = msg.lines();
        assert_eq!(lines.next(), Some("error(s) occurred while compiling module(s):"));
        assert_eq!(lines.next(), Some("  unsafe_var_error: var x is unsafe"));
        assert_eq!(lines.next(), Some("  type_error: bad default"));
        assert_eq!(ArbiterError::from(err).code(), codes::INVALID_PARAMETER);
    }

    #[test]
    fn codes_follow_the_error_kind() {
        let nf = ArbiterError::from(StorageError::NotFound {
            path: Path::parse("/a").unwrap(),
        });
        assert_eq!(nf.code(), codes::RESOURCE_NOT_FOUND);

        let cancelled = ArbiterError::from(EvalError::Cancelled(
            crate::context::ContextError::Cancelled,
        ));
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.code(), codes::CANCELLED);

        let conflict = ArbiterError::from(EvalError::Conflict { rule: "data.a.p".into() });
        assert_eq!(conflict.code(), codes::EVALUATION);

        assert_eq!(ArbiterError::internal("x").code(), codes::INTERNAL);
    }
}
