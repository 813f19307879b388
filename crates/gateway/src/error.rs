//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Outbound channel to a connection is gone.
    #[error("channel send error")]
    ChannelSend,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<tokio::sync::mpsc::error::SendError<axum::extract::ws::Message>> for GatewayError {
    fn from(_: tokio::sync::mpsc::error::SendError<axum::extract::ws::Message>) -> Self {
        GatewayError::ChannelSend
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
