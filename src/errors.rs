//! HTTP-edge error type.
//!
//! Wraps the storage engine's typed [`EngineError`] discriminants (spec §7)
//! and maps each to an HTTP status code. Handlers return `Result<_, AppError>`
//! and axum converts the `Err` arm via `IntoResponse`.

use crate::engine::EngineError;
use crate::metastore::MetaStoreError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self { status, code, message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION", msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.code,
            "message": self.message,
            "status": self.status.as_u16(),
        }));
        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<MetaStoreError> for AppError {
    fn from(err: MetaStoreError) -> Self {
        EngineError::from(err).into()
    }
}

/// `EXPIRED` is externally indistinguishable from `NOT_FOUND` (spec §7):
/// callers outside the engine never learn that a record technically still
/// exists past its TTL.
impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(msg) => AppError::new(StatusCode::BAD_REQUEST, "VALIDATION", msg),
            EngineError::NotFound => AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "file not found"),
            EngineError::Expired => AppError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "file not found"),
            EngineError::SizeExceeded => {
                AppError::new(StatusCode::PAYLOAD_TOO_LARGE, "SIZE_EXCEEDED", "upload exceeded maximum file size")
            }
            // Spec §6.2 restricts `POST /files` to {400, 401, 413} — 415
            // isn't a documented status for this endpoint, so this stays a
            // 400 like other validation failures.
            EngineError::MimeNotAllowed(mime) => AppError::new(
                StatusCode::BAD_REQUEST,
                "MIME_NOT_ALLOWED",
                format!("content type `{mime}` is not allowed"),
            ),
            EngineError::BackendWriteFailed(msg) => {
                AppError::new(StatusCode::BAD_GATEWAY, "BACKEND_WRITE_FAILED", msg)
            }
            EngineError::BackendReadFailed(msg) => {
                AppError::new(StatusCode::BAD_GATEWAY, "BACKEND_READ_FAILED", msg)
            }
            EngineError::BackendMissing => {
                AppError::new(StatusCode::NOT_FOUND, "BACKEND_MISSING", "object missing on backend")
            }
            EngineError::MetadataWriteFailed(msg) => {
                AppError::new(StatusCode::BAD_GATEWAY, "METADATA_WRITE_FAILED", msg)
            }
            EngineError::MetadataReadFailed(msg) => {
                AppError::new(StatusCode::BAD_GATEWAY, "METADATA_READ_FAILED", msg)
            }
            EngineError::Internal(msg) => AppError::internal(msg),
        }
    }
}
