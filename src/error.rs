// =============================================================================
// ERROR MODULE
// =============================================================================
// HTTP-facing error type. Domain errors (adjustment, validation, cache) are
// defined next to the code that raises them and folded in here through
// `#[from]`, so handlers can use `?` throughout.
//
// STATUS MAPPING:
//   validation       -> 400 (details = offending field)
//   unauthenticated  -> 401
//   not found        -> 404
//   in flight        -> 409
//   procedure        -> 422 (backend message passed through verbatim)
//                             same statuses for transfers, with their own notice
//   transport        -> 502
//   database/cache   -> 500 (internal detail stays in the logs)
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::adjustment::{AdjustmentError, ValidationError};
use crate::cache::CacheError;
use crate::feedback::{self, Notice};
use crate::models::ErrorResponse;

#[derive(Debug, Error)]
pub enum AppError {
    /// Query against the read side failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// A stock adjustment attempt ended without being applied
    #[error(transparent)]
    Adjustment(#[from] AdjustmentError),

    /// A transfer to holding ended without being applied
    #[error(transparent)]
    Transfer(AdjustmentError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::Adjustment(AdjustmentError::Validation(err))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        self.status_and_code().0
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Adjustment(err) | AppError::Transfer(err) => match err {
                AdjustmentError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                AdjustmentError::Unauthenticated => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
                AdjustmentError::InFlight => (StatusCode::CONFLICT, "ADJUSTMENT_IN_FLIGHT"),
                AdjustmentError::Procedure(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "ADJUSTMENT_REJECTED")
                }
                AdjustmentError::Transport(_) => (StatusCode::BAD_GATEWAY, "BACKEND_UNAVAILABLE"),
            },
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            AppError::Cache(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CACHE_ERROR"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    fn body(&self, code: &'static str) -> ErrorResponse {
        match self {
            AppError::Adjustment(err) => failure_body(code, err, feedback::adjustment_failed(err)),
            AppError::Transfer(err) => failure_body(code, err, feedback::transfer_failed(err)),
            AppError::NotFound(msg) => ErrorResponse::new(code, msg.clone()),
            AppError::Database(_) => ErrorResponse::new(code, "A database error occurred"),
            AppError::Cache(_) => ErrorResponse::new(code, "A cache error occurred"),
            AppError::Internal(msg) => ErrorResponse::new(code, msg.clone()),
        }
    }
}

fn failure_body(code: &'static str, err: &AdjustmentError, notice: Notice) -> ErrorResponse {
    let body = match err {
        AdjustmentError::Validation(validation) => {
            ErrorResponse::with_details(code, notice.description, validation.field)
        }
        _ => ErrorResponse::new(code, notice.description),
    };
    body.titled(notice.title)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        if status.is_server_error() {
            tracing::error!(error_code = code, error = %self, "Request failed");
        } else {
            tracing::warn!(error_code = code, error = %self, "Request rejected");
        }

        (status, Json(self.body(code))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
