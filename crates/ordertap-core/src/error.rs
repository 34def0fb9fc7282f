//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid redaction pattern.
    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    /// Order submission failed.
    #[error("Uplink error: {0}")]
    Uplink(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
