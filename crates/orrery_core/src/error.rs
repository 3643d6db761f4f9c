use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Broad category of a compilation failure. Numeric anomalies (NaN,
/// infinities) are not errors anywhere in this crate; they propagate
/// through evaluation as ordinary floating-point values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed syntax: bad tokens, unbalanced parentheses, missing `=`.
    Lexical,
    /// Unknown identifiers, reserved words, cross-namespace collisions.
    Namespace,
    /// Definitions out of declared order, wrong equation counts.
    Ordering,
    /// Operators or functions missing operands on the parse stack.
    Arity,
    /// Declared properties the model does not actually have.
    Semantic,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Lexical => "lexical",
            ErrorKind::Namespace => "namespace",
            ErrorKind::Ordering => "ordering",
            ErrorKind::Arity => "arity",
            ErrorKind::Semantic => "semantic",
        };
        f.write_str(name)
    }
}

/// A compilation failure: a category plus a human-readable message.
/// The first error encountered aborts the compilation; diagnostics are
/// not accumulated.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct CompileError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CompileError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn lexical(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Lexical, message)
    }

    pub fn namespace(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Namespace, message)
    }

    pub fn ordering(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Ordering, message)
    }

    pub fn arity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Arity, message)
    }

    pub fn semantic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Semantic, message)
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = CompileError::namespace("Name x is in use as a variable name.");
        assert_eq!(
            format!("{err}"),
            "namespace error: Name x is in use as a variable name."
        );
    }
}
