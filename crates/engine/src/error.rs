//! Engine error types.

use thiserror::Error;

/// Engine error type. Client-visible rejections are not errors; they travel
/// as [`common::model::Rejection`] values in command replies.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage failure surfaced from the persistence seam.
    #[error(transparent)]
    Store(#[from] store::StoreError),

    /// The lane's command channel is gone (auction evicted mid-flight).
    #[error("auction lane unavailable")]
    LaneClosed,

    /// Malformed engine-level input.
    #[error("invalid input: {0}")]
    Invalid(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
