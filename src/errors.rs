//! Service error taxonomy for Keywarden.
//!
//! Every operation returns `ServiceResult<T>`; the single error enum maps
//! onto the HTTP surface in one place via `IntoResponse`. Storage and
//! configuration failures are logged server-side and rendered to callers
//! as a generic message.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed or missing input fields (400).
    #[error("{0}")]
    InvalidInput(String),

    /// Bad credentials, missing or invalid session/token (401).
    #[error("{0}")]
    Unauthorized(String),

    /// License policy rejection: not active, expired, revoked, or
    /// over the activation limit (403).
    #[error("{0}")]
    Forbidden(String),

    /// Unknown license, activation, or other resource (404).
    #[error("{0}")]
    NotFound(String),

    /// Operation conflicts with current state, e.g. revoking an
    /// already-revoked license (400).
    #[error("{0}")]
    Conflict(String),

    /// Configuration problem (500).
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying persistence failure (500).
    #[error("database error: {0}")]
    Storage(String),

    /// Anything else that should never leak detail to a caller (500).
    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Standard error response body, `{"success": false, "error": "..."}`.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServiceError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ServiceError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            ServiceError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            ServiceError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ServiceError::Conflict(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ServiceError::Config(msg) => {
                tracing::error!("configuration error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
            ServiceError::Storage(msg) => {
                tracing::error!("storage error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
            ServiceError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            success: false,
            error: message,
        };

        (status, Json(body)).into_response()
    }
}
