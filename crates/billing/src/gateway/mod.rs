//! Payment gateway port
//!
//! The engine talks to the gateway only through [`PaymentGateway`]. Wire
//! formats are translated into the typed results below at the adapter
//! boundary; nothing past this module sees gateway JSON.

mod http;

pub use http::HttpGateway;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Card details returned with a freshly issued billing key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardInfo {
    pub issuer_code: Option<String>,
    pub masked_number: Option<String>,
    pub card_type: Option<String>,
}

/// A newly issued reusable charge credential
#[derive(Clone)]
pub struct BillingKeyIssue {
    /// Plaintext billing key. Must be encrypted before it is stored.
    pub billing_key: String,
    pub card: CardInfo,
}

impl std::fmt::Debug for BillingKeyIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingKeyIssue")
            .field("billing_key", &"[REDACTED]")
            .field("card", &self.card)
            .finish()
    }
}

/// Gateway confirmation of a captured charge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedCharge {
    pub payment_key: String,
    pub order_id: String,
    /// Amount the gateway says it captured, in minor units
    pub amount: i64,
    pub approved_at: OffsetDateTime,
    pub method: Option<String>,
}

/// Gateway refusal, or a non-2xx response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclinedCharge {
    pub code: String,
    pub message: String,
    pub http_status: Option<u16>,
}

/// Outcome of a charge request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeResult {
    Approved(ApprovedCharge),
    Declined(DeclinedCharge),
    /// Timed out or the response was lost; the charge may or may not have
    /// been captured. Never treated as a failure without a re-query.
    Indeterminate { reason: String },
}

impl ChargeResult {
    pub fn declined(code: impl Into<String>, message: impl Into<String>) -> Self {
        ChargeResult::Declined(DeclinedCharge {
            code: code.into(),
            message: message.into(),
            http_status: None,
        })
    }

    pub fn is_indeterminate(&self) -> bool {
        matches!(self, ChargeResult::Indeterminate { .. })
    }
}

/// Gateway evidence persisted on a payment record for audit and replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayResponse {
    Approved {
        payment_key: String,
        amount: i64,
        #[serde(with = "time::serde::rfc3339")]
        approved_at: OffsetDateTime,
        method: Option<String>,
    },
    Declined {
        code: String,
        message: String,
        http_status: Option<u16>,
    },
    /// Zero-amount cycle settled without contacting the gateway
    Waived {
        #[serde(with = "time::serde::rfc3339")]
        waived_at: OffsetDateTime,
    },
    WebhookConfirmed {
        event_id: String,
        payment_key: String,
        amount: i64,
    },
    WebhookFailed {
        event_id: String,
        code: String,
        message: String,
    },
    Refunded {
        event_id: String,
    },
    Cancelled {
        reason: String,
    },
}

impl From<&ApprovedCharge> for GatewayResponse {
    fn from(charge: &ApprovedCharge) -> Self {
        GatewayResponse::Approved {
            payment_key: charge.payment_key.clone(),
            amount: charge.amount,
            approved_at: charge.approved_at,
            method: charge.method.clone(),
        }
    }
}

impl From<&DeclinedCharge> for GatewayResponse {
    fn from(charge: &DeclinedCharge) -> Self {
        GatewayResponse::Declined {
            code: charge.code.clone(),
            message: charge.message.clone(),
            http_status: charge.http_status,
        }
    }
}

/// Narrow interface to the third-party payment gateway
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Exchange a one-time card authorization for a reusable billing key
    async fn issue_billing_key(&self, auth_key: &str, customer_key: &str)
        -> BillingResult<BillingKeyIssue>;

    /// Confirm a client-side authorized one-off charge
    async fn confirm_charge(&self, payment_key: &str, order_id: &str, amount: i64) -> ChargeResult;

    /// Charge a stored billing key off-session
    async fn charge_with_key(
        &self,
        billing_key: &str,
        customer_key: &str,
        amount: i64,
        order_id: &str,
        order_name: &str,
    ) -> ChargeResult;

    /// Re-query the gateway's own record of an order after an indeterminate outcome
    async fn lookup_charge(&self, order_id: &str) -> ChargeResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_response_is_tagged() {
        let response = GatewayResponse::Declined {
            code: "REJECT_CARD_COMPANY".to_string(),
            message: "limit exceeded".to_string(),
            http_status: Some(403),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["kind"], "declined");
        assert_eq!(json["code"], "REJECT_CARD_COMPANY");

        let back: GatewayResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn test_billing_key_debug_is_redacted() {
        let issue = BillingKeyIssue {
            billing_key: "bk_secret_material".to_string(),
            card: CardInfo::default(),
        };
        assert!(!format!("{:?}", issue).contains("bk_secret_material"));
    }
}
