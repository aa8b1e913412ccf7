//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("invalid cache version: {0}")]
    InvalidVersion(String),

    #[error("invalid upload id: {0}")]
    InvalidUploadId(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
