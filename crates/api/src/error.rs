//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use learnhub_billing::{BillingError, ErrorClass};
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized,
    #[error("Invalid webhook signature")]
    InvalidSignature,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Conflict: {0}")]
    Conflict(String),

    // Billing errors
    #[error("Payment failed")]
    PaymentFailed,
    #[error("Payment is being confirmed")]
    PaymentPending,

    // Internal errors
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::InvalidSignature => (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Billing
            ApiError::PaymentFailed => (StatusCode::PAYMENT_REQUIRED, "PAYMENT_FAILED", "Payment could not be completed. Please try another card.".to_string()),
            ApiError::PaymentPending => (StatusCode::ACCEPTED, "PAYMENT_PENDING", "Payment is being confirmed. Check back shortly.".to_string()),

            // Internal
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err.class() {
            ErrorClass::Validation => match err {
                BillingError::CheckoutInProgress(_) => ApiError::Conflict(
                    "Another subscription checkout is in progress".to_string(),
                ),
                _ => ApiError::Validation(err.to_string()),
            },
            ErrorClass::NotFound => ApiError::NotFound,
            ErrorClass::Gateway => match err {
                BillingError::GatewayIndeterminate(_) => ApiError::PaymentPending,
                _ => {
                    tracing::info!(error = %err, "Payment declined");
                    ApiError::PaymentFailed
                }
            },
            ErrorClass::Integrity => match err {
                BillingError::ActiveSubscriptionExists(_) => {
                    ApiError::Conflict("An active subscription already exists".to_string())
                }
                BillingError::DuplicateOrder(_) => {
                    ApiError::Conflict("Order already exists".to_string())
                }
                // details are in the audit trail, never in the response
                _ => ApiError::PaymentFailed,
            },
            ErrorClass::Credential | ErrorClass::Infrastructure => {
                tracing::error!(error = %err, "Billing operation failed");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
