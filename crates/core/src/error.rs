//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid commit graph: {0}")]
    InvalidCommitGraph(String),

    #[error("invalid ref description: {0}")]
    InvalidRef(String),

    #[error("invalid upload state: {0}")]
    InvalidUploadState(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("visibility invariant violated: {0}")]
    InvariantViolation(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
