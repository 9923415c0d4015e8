//! Top-level error taxonomy (spec §7) and its HTTP surface mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::store::LockStoreError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Business-layer error kind, distinct from the HTTP status it surfaces as.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limit exceeded for operation {operation}")]
    RateLimitExceeded { operation: String },

    #[error("another task for this tenant+operation is in progress")]
    LockConflict,

    #[error("platform login missing")]
    ContextNotFound,

    #[error("platform login required")]
    NotLoggedIn {
        platform: String,
        context_id: String,
        resource_url: Option<String>,
    },

    #[error("failed to create remote browser session: {0}")]
    SessionCreation(String),

    #[error("failed to initialize remote browser: {0}")]
    BrowserInit(String),

    #[error("{platform} does not support {operation}")]
    NotImplemented { platform: String, operation: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<LockStoreError> for ApiError {
    fn from(err: LockStoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    code: i32,
    message: String,
    data: Option<T>,
}

impl ApiError {
    fn envelope_code(&self) -> i32 {
        match self {
            ApiError::Validation(_) => 422,
            ApiError::Unauthorized => 401,
            ApiError::RateLimitExceeded { .. } => 400,
            ApiError::LockConflict => 400,
            ApiError::ContextNotFound => 400,
            ApiError::NotLoggedIn { .. } => 604,
            ApiError::SessionCreation(_) => 500,
            ApiError::BrowserInit(_) => 500,
            ApiError::NotImplemented { .. } => 400,
            ApiError::Internal(_) => 500,
        }
    }

    fn http_status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::LockConflict => StatusCode::CONFLICT,
            ApiError::ContextNotFound => StatusCode::UNAUTHORIZED,
            ApiError::NotLoggedIn { .. } => StatusCode::OK,
            ApiError::SessionCreation(_) | ApiError::BrowserInit(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::NotImplemented { .. } => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let code = self.envelope_code();
        let data = match &self {
            ApiError::NotLoggedIn {
                platform,
                context_id,
                resource_url,
            } => Some(serde_json::json!({
                "error_type": "not_logged_in",
                "platform": platform,
                "context_id": context_id,
                "resource_url": resource_url,
                "requires_login": true,
            })),
            ApiError::ContextNotFound => Some(serde_json::json!({
                "error_type": "context_not_found",
            })),
            ApiError::RateLimitExceeded { operation } => Some(serde_json::json!({
                "error_type": "rate_limit_exceeded",
                "operation": operation,
            })),
            ApiError::LockConflict => Some(serde_json::json!({
                "error_type": "operation_in_progress",
            })),
            _ => None,
        };
        let body = Envelope {
            code,
            message: self.to_string(),
            data,
        };
        (status, Json(body)).into_response()
    }
}
