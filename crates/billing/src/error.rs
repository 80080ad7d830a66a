//! Billing error types

use thiserror::Error;

use crate::payment::PaymentStatus;

/// Broad error categories used for propagation decisions.
///
/// Validation and integrity errors fail the caller immediately, gateway errors
/// are shown to users as a generic failure, and credential errors only abort
/// the single renewal that hit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Gateway,
    Integrity,
    Credential,
    NotFound,
    Infrastructure,
}

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    // Validation
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid coupon configuration: {0}")]
    InvalidCoupon(String),

    #[error("Coupon cannot be used: {0}")]
    CouponUnavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Another subscription checkout is open: {0}")]
    CheckoutInProgress(String),

    // Gateway
    #[error("Payment declined by gateway ({code}): {message}")]
    GatewayDeclined { code: String, message: String },

    #[error("Payment gateway transport error: {0}")]
    GatewayTransport(String),

    #[error("Payment outcome unknown, awaiting reconciliation: {0}")]
    GatewayIndeterminate(String),

    // Integrity
    #[error("Amount mismatch for order {order_id}: expected {expected}, got {actual}")]
    AmountMismatch {
        order_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("Order already exists: {0}")]
    DuplicateOrder(String),

    #[error("Illegal payment transition {from} -> {to}")]
    IllegalTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("User already has an active subscription: {0}")]
    ActiveSubscriptionExists(String),

    // Credential
    #[error("Charge credential unusable: {0}")]
    Credential(String),

    // Lookup / infrastructure
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BillingError::InvalidAmount(_)
            | BillingError::InvalidCoupon(_)
            | BillingError::CouponUnavailable(_)
            | BillingError::InvalidInput(_)
            | BillingError::CheckoutInProgress(_) => ErrorClass::Validation,
            BillingError::GatewayDeclined { .. }
            | BillingError::GatewayTransport(_)
            | BillingError::GatewayIndeterminate(_) => ErrorClass::Gateway,
            BillingError::AmountMismatch { .. }
            | BillingError::DuplicateOrder(_)
            | BillingError::IllegalTransition { .. }
            | BillingError::ConcurrentModification(_)
            | BillingError::ActiveSubscriptionExists(_) => ErrorClass::Integrity,
            BillingError::Credential(_) => ErrorClass::Credential,
            BillingError::NotFound(_) => ErrorClass::NotFound,
            BillingError::Database(_) | BillingError::Config(_) | BillingError::Internal(_) => {
                ErrorClass::Infrastructure
            }
        }
    }

    /// Integrity failures may indicate tampering or a bug and must page someone.
    pub fn is_alert_worthy(&self) -> bool {
        self.class() == ErrorClass::Integrity
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Internal(format!("JSON error: {}", err))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
