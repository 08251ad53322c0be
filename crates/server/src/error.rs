//! Handler-facing error kinds and their transport mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;

use medpulse_core::ApiResponse;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Validated domain rejection; the code travels in the body envelope.
    #[error("{message}")]
    Business { code: u16, message: String },

    /// An idempotent request is still being processed elsewhere.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Cache follower timeout or upstream overload.
    #[error("service busy: {0}")]
    ServiceBusy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn business(code: u16, message: impl Into<String>) -> Self {
        Self::Business {
            code,
            message: message.into(),
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, 401, msg),
            // Business rejections ride a 200 transport with the code in the
            // body, matching the envelope contract.
            AppError::Business { code, message } => (StatusCode::OK, code, message),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, 409, msg),
            AppError::ServiceBusy(msg) => (StatusCode::SERVICE_UNAVAILABLE, 503, msg),
            AppError::NotFound(msg) => (StatusCode::OK, 404, msg),
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, 422, msg),
            AppError::Internal(msg) => {
                error!(error = %msg, "unhandled internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    500,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(ApiResponse::<()>::err(code, message))).into_response()
    }
}

impl From<medpulse_kv::KvError> for AppError {
    fn from(err: medpulse_kv::KvError) -> Self {
        AppError::internal(err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::internal(err)
    }
}

impl From<medpulse_cache::CacheError> for AppError {
    fn from(err: medpulse_cache::CacheError) -> Self {
        match err {
            medpulse_cache::CacheError::Busy => {
                AppError::ServiceBusy("cache is being rebuilt, try again later".into())
            }
            other => AppError::internal(other),
        }
    }
}

impl From<medpulse_queue::QueueError> for AppError {
    fn from(err: medpulse_queue::QueueError) -> Self {
        AppError::internal(err)
    }
}

impl From<medpulse_core::auth::AuthError> for AppError {
    fn from(err: medpulse_core::auth::AuthError) -> Self {
        AppError::Unauthorized(err.to_string())
    }
}
