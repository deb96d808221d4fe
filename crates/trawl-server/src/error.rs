use axum::http::StatusCode;
use axum::http::header::RETRY_AFTER;
use axum::response::{IntoResponse, Response};
use trawl_core::error::AppError;
use trawl_core::models::FailureKind;

use crate::dto::ErrorResponse;

/// Wrapper so we can implement `IntoResponse` for `AppError`.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

/// HTTP status for a failed job result.
pub fn failure_status(kind: FailureKind) -> StatusCode {
    match kind {
        FailureKind::InvalidJob | FailureKind::PluginLoad => StatusCode::BAD_REQUEST,
        FailureKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        FailureKind::PoolExhausted | FailureKind::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
        FailureKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        FailureKind::InstanceCrashed | FailureKind::PluginExecution => StatusCode::BAD_GATEWAY,
        FailureKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self.0 {
            AppError::InvalidJob(_) => (StatusCode::BAD_REQUEST, "invalid_job"),
            AppError::SerializationError(_) => (StatusCode::BAD_REQUEST, "serialization_error"),
            AppError::PluginLoad(_) => (StatusCode::BAD_REQUEST, "plugin_load"),
            AppError::RateLimitExceeded { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded")
            }
            AppError::PoolExhausted { .. } => (StatusCode::SERVICE_UNAVAILABLE, "pool_exhausted"),
            AppError::PoolClosed => (StatusCode::SERVICE_UNAVAILABLE, "pool_closed"),
            AppError::CircuitOpen { .. } => (StatusCode::SERVICE_UNAVAILABLE, "circuit_open"),
            AppError::DatabaseError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            AppError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::WorkerTimeout(_) | AppError::Timeout(_) => {
                (StatusCode::GATEWAY_TIMEOUT, "timeout")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.0.to_string(),
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let AppError::RateLimitExceeded { retry_after_secs } = self.0 {
            response
                .headers_mut()
                .insert(RETRY_AFTER, retry_after_secs.into());
        }
        response
    }
}
