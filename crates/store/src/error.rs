//! Store error types.

use thiserror::Error;

/// Store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The bounded database timeout elapsed.
    #[error("database operation timed out")]
    Timeout,

    /// Referenced row does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Write conflicts with current row state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A persisted value failed to parse back into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<common::model::UnknownVariant> for StoreError {
    fn from(err: common::model::UnknownVariant) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
