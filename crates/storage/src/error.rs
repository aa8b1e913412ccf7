//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("stream aborted: {0}")]
    Aborted(String),
}

/// Coarse classification of a storage failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The object or folder does not exist.
    NotFound,
    /// Network or backend hiccup; retrying later may succeed.
    Transient,
    /// Credentials or ACLs reject the operation.
    Permission,
    /// Retrying will not help.
    Fatal,
}

impl StorageError {
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            StorageError::NotFound(_) => StorageErrorKind::NotFound,
            StorageError::PermissionDenied(_) => StorageErrorKind::Permission,
            StorageError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => StorageErrorKind::Permission,
                _ => StorageErrorKind::Transient,
            },
            StorageError::Backend(_) | StorageError::Aborted(_) => StorageErrorKind::Transient,
            StorageError::InvalidKey(_) | StorageError::Config(_) => StorageErrorKind::Fatal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == StorageErrorKind::NotFound
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
