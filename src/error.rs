// src/error.rs

use std::future::Future;
use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::tokens::TokenError;

/// Failures of the shared stores (graph, idempotency, dead letters).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("stored data is invalid: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Transient failures are worth retrying; the rest will fail the same way
    /// on every attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Timeout { .. } | StoreError::Unavailable(_) => true,
            StoreError::Corrupt(_) => false,
            StoreError::Database(e) => match e {
                sqlx::Error::Database(db) => {
                    // serialization_failure / deadlock_detected are retryable,
                    // constraint violations are not
                    matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
                }
                sqlx::Error::ColumnDecode { .. }
                | sqlx::Error::ColumnNotFound(_)
                | sqlx::Error::TypeNotFound { .. }
                | sqlx::Error::Decode(_)
                | sqlx::Error::RowNotFound => false,
                _ => true,
            },
        }
    }
}

/// Runs a store call with an upper bound on its duration. An elapsed bound is
/// reported as [`StoreError::Timeout`], which the orchestrator retries.
pub async fn bounded<T, F>(operation: &'static str, after: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { operation, after }),
    }
}

/// JSON error body returned by every endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::Validation(_) => "validation_error",
            AppError::NotFound(_) => "not_found",
            AppError::Store(StoreError::Timeout { .. }) => "store_timeout",
            AppError::Store(_) => "store_error",
            AppError::Token(TokenError::Expired) => "token_expired",
            AppError::Token(TokenError::Invalid(_)) => "token_invalid",
            AppError::Token(TokenError::Encoding(_)) => "token_error",
            AppError::Internal(_) => "internal_error",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Store(StoreError::Timeout { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Token(TokenError::Expired) | AppError::Token(TokenError::Invalid(_)) => {
                StatusCode::UNAUTHORIZED
            }
            AppError::Token(TokenError::Encoding(_)) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("request failed kind={} error={}", self.kind(), self);
        }
        HttpResponse::build(status).json(ErrorResponse {
            error: self.kind().to_string(),
            message: self.to_string(),
            status: status.as_u16(),
        })
    }
}

pub type ApiResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_reports_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, StoreError>(1)
        };
        let err = bounded("slow_call", Duration::from_millis(5), slow)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout { operation: "slow_call", .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn bounded_passes_result_through() {
        let value = bounded("fast", Duration::from_secs(1), async { Ok::<_, StoreError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn corrupt_and_decode_errors_are_permanent() {
        assert!(!StoreError::Corrupt("bad status".into()).is_transient());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            AppError::Unauthorized("sig".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::Validation("email".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Token(TokenError::Expired).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::Store(StoreError::Unavailable("down".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
