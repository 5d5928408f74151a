//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// The visibility tables would violate one-row-per-commit.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The recompute was cancelled before its transaction committed.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

impl From<lodestar_core::Error> for MetadataError {
    fn from(e: lodestar_core::Error) -> Self {
        use lodestar_core::Error;
        match e {
            Error::InvalidStateTransition { from, to } => {
                MetadataError::InvalidStateTransition { from, to }
            }
            Error::InvariantViolation(msg) => MetadataError::InvariantViolation(msg),
            other => MetadataError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for MetadataError {
    fn from(e: serde_json::Error) -> Self {
        MetadataError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for MetadataError {
    fn from(e: std::io::Error) -> Self {
        MetadataError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_transition_error_keeps_states() {
        let err: MetadataError = lodestar_core::UploadState::Deleted
            .transition_to(lodestar_core::UploadState::Completed)
            .unwrap_err()
            .into();
        match err {
            MetadataError::InvalidStateTransition { from, to } => {
                assert_eq!(from, "deleted");
                assert_eq!(to, "completed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invariant_violation_display() {
        let err = MetadataError::InvariantViolation("commit c1 staged twice".to_string());
        assert_eq!(err.to_string(), "invariant violation: commit c1 staged twice");
    }
}
