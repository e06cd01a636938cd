//! Error types for the operation algebra.

use thiserror::Error;

use crate::operation::OpKind;

/// Why an operation could not be applied to a piece of text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("{kind} operation requires text")]
    MissingText { kind: OpKind },

    #[error("{kind} operation requires a positive length")]
    MissingLength { kind: OpKind },

    #[error("inverted {kind} operation requires prevText")]
    MissingPrevText { kind: OpKind },

    #[error("operation span {start}..{end} exceeds content length {len}")]
    OutOfBounds { start: usize, end: usize, len: usize },
}
