//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Unavailable(String),
    Upstream(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<monobuild_core::Error> for ApiError {
    fn from(err: monobuild_core::Error) -> Self {
        use monobuild_core::Error;
        match err {
            Error::Validation(msg) => ApiError::BadRequest(msg),
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::Conflict(msg) => ApiError::Conflict(msg),
            Error::Auth(msg) => ApiError::Forbidden(msg),
            Error::Transient(msg) => ApiError::Unavailable(msg),
            Error::Upstream { .. } => ApiError::Upstream(err.to_string()),
            Error::Fatal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<monobuild_db::DbError> for ApiError {
    fn from(err: monobuild_db::DbError) -> Self {
        ApiError::from(monobuild_core::Error::from(err))
    }
}

impl From<monobuild_storage::StorageError> for ApiError {
    fn from(err: monobuild_storage::StorageError) -> Self {
        ApiError::from(monobuild_core::Error::from(err))
    }
}
