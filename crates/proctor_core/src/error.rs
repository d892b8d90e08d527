//! Error types for proctor_core operations.

use crate::test_plan::TestPlanNodeKey;
use crate::types::Identifier;
use thiserror::Error;

/// Core error type for proctor_core operations.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// An operation was attempted in a lifecycle phase that forbids it.
    ///
    /// This signals a caller sequencing error, not a data problem. State is
    /// left exactly as it was before the call.
    #[error("{operation} not allowed: {reason}")]
    InvalidCandidateState {
        /// The operation that was rejected.
        operation: &'static str,
        /// Why the current phase forbids it.
        reason: String,
    },

    /// A response identifier does not match any declared response variable
    /// or interaction of the item.
    #[error("unknown response identifier: {0}")]
    UnknownResponseIdentifier(Identifier),

    /// A variable reference could not be resolved against any declaration.
    #[error("unknown variable: {0}")]
    UnknownVariable(Identifier),

    /// A test plan node key does not exist in the plan.
    #[error("unknown test plan node: {0}")]
    UnknownNode(TestPlanNodeKey),

    /// An item reference points at an item the document does not carry.
    #[error("unknown item document: {0}")]
    UnknownItem(Identifier),

    /// A branch rule names a target that does not appear later in the plan.
    #[error("branch rule target not found: {0}")]
    BranchTargetNotFound(Identifier),

    /// An identifier string failed validation.
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// Expression evaluation failed.
    #[error("expression error: {0}")]
    Expression(String),

    /// Serialization error during snapshot operations.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error during snapshot operations.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Settings file error (loading, parsing, invalid values).
    #[error("settings error: {0}")]
    Settings(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeliveryError {
    /// Shorthand for an [`DeliveryError::InvalidCandidateState`] error.
    pub(crate) fn state(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidCandidateState {
            operation,
            reason: reason.into(),
        }
    }
}

/// Convenience Result type for proctor_core operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;
