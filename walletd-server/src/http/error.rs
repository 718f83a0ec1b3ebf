//! API error types with IntoResponse
//!
//! Errors are converted to JSON responses with appropriate status codes.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use walletd_core::WalletError;

/// API error type with automatic HTTP status mapping
#[derive(Debug)]
pub enum ApiError {
    /// Engine or façade error, status depends on the kind
    Wallet(WalletError),

    /// Request body could not be decoded (400)
    BadRequest { message: String },

    /// Mutation pool refused the job (503)
    QueueFull,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Wallet(err) => match err {
                WalletError::InvalidIdentifier { .. } | WalletError::InvalidAmount { .. } => {
                    StatusCode::BAD_REQUEST
                }
                WalletError::WalletNotFound { .. } => StatusCode::NOT_FOUND,
                WalletError::InsufficientFunds { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                WalletError::TransientConflict { .. } => StatusCode::SERVICE_UNAVAILABLE,
                WalletError::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
                WalletError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Wallet(WalletError::Fatal(e)) => {
                // Log the actual error, return generic message
                tracing::error!(error = %e, "Storage failure");
                json!({
                    "error": "internal_error",
                    "message": "an internal error occurred"
                })
            }
            Self::Wallet(e) => {
                if let WalletError::TransientConflict { .. } = e {
                    tracing::warn!(error = %e, "Giving up after repeated conflicts");
                }
                json!({
                    "error": e.kind(),
                    "message": e.to_string()
                })
            }
            Self::BadRequest { message } => json!({
                "error": "invalid_request",
                "message": message
            }),
            Self::QueueFull => json!({
                "error": "queue_full",
                "message": "job queue is full or shutting down, retry later"
            }),
        };

        (status, Json(body)).into_response()
    }
}

impl From<WalletError> for ApiError {
    fn from(e: WalletError) -> Self {
        Self::Wallet(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::BadRequest {
            message: e.body_text(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use rust_decimal_macros::dec;
    use walletd_core::{CancelReason, StoreError, WalletId};

    #[tokio::test]
    async fn invalid_identifier_is_400() {
        let err = ApiError::from(WalletError::invalid_identifier("nope"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn insufficient_funds_is_422() {
        let err = ApiError::from(WalletError::InsufficientFunds {
            wallet_id: WalletId::new_v4().as_uuid(),
            balance: dec!(1),
            requested: dec!(5),
        });
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn transient_conflict_is_503() {
        let err = ApiError::from(WalletError::TransientConflict {
            attempts: 5,
            source: StoreError::SerializationFailure("40001".into()),
        });
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ApiError::QueueFull.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn cancelled_is_504() {
        let err = ApiError::from(WalletError::Cancelled(CancelReason::DeadlineExceeded));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn fatal_hides_details() {
        let err = ApiError::from(WalletError::Fatal(StoreError::Unavailable(
            "secret connection string".into(),
        )));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("internal_error"));
        assert!(!text.contains("secret"));
    }
}
