//! Common error types for the gateway

use thiserror::Error;

/// Common result type for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by the pipeline and the HTTP surface
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed mapping file or missing required settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bitrix24 or Tilda returned an error envelope or a failing status
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Invalid inbound submission
    #[error("Validation error: {0}")]
    Validation(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error (wraps serde_json::Error)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
