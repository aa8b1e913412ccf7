//! Engine error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hoard_core::UploadId;
use hoard_metadata::MetadataError;
use hoard_storage::{StorageError, StorageErrorKind};
use serde::Serialize;
use uuid::Uuid;

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// Errors surfaced by the cache engine.
///
/// Negative results (cache miss, unknown upload, missing entry) are not
/// errors; engine operations return `Option` for those.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no parts uploaded for upload {upload_id}")]
    NoPartsUploaded { upload_id: UploadId },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage location {location_id} is inconsistent: {detail}")]
    Inconsistent { location_id: Uuid, detail: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("{0}")]
    Core(#[from] hoard_core::Error),
}

impl EngineError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoPartsUploaded { .. } => "no_parts_uploaded",
            Self::InvalidInput(_) => "invalid_input",
            Self::Inconsistent { .. } => "inconsistent_state",
            Self::Storage(_) => "storage_error",
            Self::Metadata(_) => "metadata_error",
            Self::Core(_) => "invalid_input",
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(e) => e.kind() == StorageErrorKind::Transient,
            Self::Metadata(MetadataError::Database(_)) => true,
            _ => false,
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoPartsUploaded { .. } | Self::InvalidInput(_) | Self::Core(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Inconsistent { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(e) => match e.kind() {
                StorageErrorKind::NotFound => StatusCode::NOT_FOUND,
                StorageErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
                StorageErrorKind::Permission | StorageErrorKind::Fatal => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
                MetadataError::Conflict(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
