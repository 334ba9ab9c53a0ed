//! API error mapping
//!
//! Translates the payment error taxonomy into HTTP responses with JSON
//! bodies. Retryable errors map to gateway statuses so upstream callers
//! (the payment provider's webhook redelivery in particular) try again.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use quotapay_payments::PaymentError;

/// HTTP-facing wrapper around `PaymentError`.
#[derive(Debug)]
pub struct ApiError(pub PaymentError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            PaymentError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PaymentError::NotFound(_) => StatusCode::NOT_FOUND,
            PaymentError::InsufficientQuota { .. } => StatusCode::PAYMENT_REQUIRED,
            PaymentError::ProviderUnavailable(_) | PaymentError::Timeout(_) => {
                StatusCode::BAD_GATEWAY
            }
            PaymentError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            PaymentError::Config(_) | PaymentError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self.0, status = %status, "Request failed");
        } else {
            tracing::debug!(error = %self.0, status = %status, "Request rejected");
        }

        // Internal details stay in the logs; clients get the category.
        let message = match &self.0 {
            PaymentError::Database(_) | PaymentError::Internal(_) | PaymentError::Config(_) => {
                "internal error".to_string()
            }
            PaymentError::InsufficientQuota { balance } => {
                format!("insufficient quota: balance is {}", balance)
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}
