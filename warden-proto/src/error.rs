//! Error types for the control protocol

use thiserror::Error;

/// Result type alias for wire protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding, decoding or validating messages
#[derive(Debug, Error)]
pub enum Error {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("value out of range for {kind}: {value}")]
    OutOfRange { kind: &'static str, value: i64 },

    #[error("validation error: {0}")]
    Validation(String),
}
