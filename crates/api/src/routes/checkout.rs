//! Checkout endpoints
//!
//! The client creates a pending order, then settles it either by registering
//! a card (subscriptions) or by confirming a one-time payment key.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use learnhub_billing::{CheckoutOutcome, CheckoutRequest, PaymentRecord, Subscription};
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub id: String,
    pub order_id: String,
    pub kind: String,
    pub status: String,
    pub original_amount: i64,
    pub discount_amount: i64,
    pub final_amount: i64,
    pub currency: String,
    pub approved_at: Option<String>,
}

impl From<&PaymentRecord> for PaymentResponse {
    fn from(payment: &PaymentRecord) -> Self {
        Self {
            id: payment.id.to_string(),
            order_id: payment.order_id.clone(),
            kind: payment.payment_kind.as_str().to_string(),
            status: payment.status.to_string(),
            original_amount: payment.original_amount,
            discount_amount: payment.discount_amount,
            final_amount: payment.final_amount,
            currency: payment.currency.to_string(),
            approved_at: payment.approved_at.map(format_timestamp),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub id: String,
    pub plan_id: String,
    pub status: String,
    pub start_date: String,
    pub end_date: String,
    pub auto_renew: bool,
    pub next_billing_date: Option<String>,
}

impl From<&Subscription> for SubscriptionResponse {
    fn from(sub: &Subscription) -> Self {
        Self {
            id: sub.id.to_string(),
            plan_id: sub.plan_id.to_string(),
            status: sub.status.to_string(),
            start_date: format_timestamp(sub.start_date),
            end_date: format_timestamp(sub.end_date),
            auto_renew: sub.auto_renew,
            next_billing_date: sub.next_billing_date.map(format_timestamp),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub payment: PaymentResponse,
    pub subscription: Option<SubscriptionResponse>,
}

impl From<CheckoutOutcome> for CheckoutResponse {
    fn from(outcome: CheckoutOutcome) -> Self {
        Self {
            payment: PaymentResponse::from(&outcome.payment),
            subscription: outcome.subscription.as_ref().map(SubscriptionResponse::from),
        }
    }
}

pub(crate) fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

#[derive(Debug, Deserialize)]
pub struct BillingKeyRequest {
    pub auth_key: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub payment_key: String,
    /// Amount the client believes it is paying
    pub amount: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelCheckoutRequest {
    pub reason: Option<String>,
}

/// Create a pending order with the server-side quote
pub async fn start_checkout(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<(StatusCode, Json<PaymentResponse>)> {
    let payment = state.billing.checkout.start_checkout(req).await?;

    tracing::info!(
        user_id = %payment.user_id,
        order_id = %payment.order_id,
        final_amount = payment.final_amount,
        "Checkout started"
    );

    Ok((StatusCode::CREATED, Json(PaymentResponse::from(&payment))))
}

/// Register a card for a subscription order and take the first payment
pub async fn register_billing_key(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(req): Json<BillingKeyRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let outcome = state
        .billing
        .checkout
        .register_billing_key(&order_id, &req.auth_key)
        .await?;

    Ok(Json(outcome.into()))
}

/// Confirm a one-time (or card-less subscription) payment
pub async fn confirm_checkout(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(req): Json<ConfirmRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let outcome = state
        .billing
        .checkout
        .confirm_checkout(&order_id, &req.payment_key, req.amount)
        .await?;

    Ok(Json(outcome.into()))
}

/// Abandon a pending order
pub async fn cancel_checkout(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    req: Option<Json<CancelCheckoutRequest>>,
) -> ApiResult<Json<PaymentResponse>> {
    let req = req.map(|Json(req)| req).unwrap_or_default();
    let reason = req.reason.as_deref().unwrap_or("USER_CANCELLED");

    let payment = state.billing.checkout.cancel_pending(&order_id, reason).await?;

    Ok(Json(PaymentResponse::from(&payment)))
}
