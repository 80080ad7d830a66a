//! Gateway webhook queue and reconciler
//!
//! Verified deliveries are stored first (`ingest`) and applied later
//! (`handle`, `sweep`). Applying an event is idempotent: a processed event is
//! never applied again, and every payment write is conditional on the status
//! observed when the event was read.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::checkout::CheckoutService;
use crate::config::WebhookPolicy;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{ApprovedCharge, ChargeResult, DeclinedCharge, GatewayResponse};
use crate::payment::{PaymentKind, PaymentRecord, PaymentService, PaymentStatus};
use crate::settlement::SettlementJob;
use crate::store::BillingStore;

pub const CHARGE_SUCCEEDED: &str = "charge.succeeded";
pub const CHARGE_FAILED: &str = "charge.failed";
pub const CHARGE_REFUNDED: &str = "charge.refunded";
pub const CHARGE_CANCELLED: &str = "charge.cancelled";

/// A stored gateway delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    /// Gateway-assigned event id, unique across deliveries
    pub external_event_id: String,
    pub event_type: String,
    /// Full delivery body as received
    pub payload: serde_json::Value,
    pub processed: bool,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub received_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

/// Outer shape of every delivery
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope {
    pub event_id: String,
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl WebhookEnvelope {
    pub fn parse(payload: &serde_json::Value) -> BillingResult<Self> {
        let envelope: Self = serde_json::from_value(payload.clone())
            .map_err(|e| BillingError::InvalidInput(format!("malformed webhook: {}", e)))?;
        if envelope.event_id.trim().is_empty() {
            return Err(BillingError::InvalidInput(
                "webhook is missing its event id".to_string(),
            ));
        }
        Ok(envelope)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SucceededData {
    order_id: String,
    payment_key: String,
    amount: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    approved_at: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailedData {
    order_id: String,
    #[serde(default = "unknown_code")]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderData {
    order_id: String,
    #[serde(default)]
    reason: Option<String>,
}

fn unknown_code() -> String {
    "UNKNOWN".to_string()
}

/// Typed gateway notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    ChargeSucceeded {
        order_id: String,
        payment_key: String,
        amount: i64,
        approved_at: Option<OffsetDateTime>,
    },
    ChargeFailed {
        order_id: String,
        code: String,
        message: String,
    },
    ChargeRefunded {
        order_id: String,
    },
    ChargeCancelled {
        order_id: String,
        reason: String,
    },
    Unknown(String),
}

impl GatewayEvent {
    pub fn parse(event_type: &str, data: &serde_json::Value) -> BillingResult<Self> {
        let malformed =
            |e: serde_json::Error| BillingError::InvalidInput(format!("malformed {}: {}", event_type, e));

        Ok(match event_type {
            CHARGE_SUCCEEDED => {
                let d: SucceededData = serde_json::from_value(data.clone()).map_err(malformed)?;
                GatewayEvent::ChargeSucceeded {
                    order_id: d.order_id,
                    payment_key: d.payment_key,
                    amount: d.amount,
                    approved_at: d.approved_at,
                }
            }
            CHARGE_FAILED => {
                let d: FailedData = serde_json::from_value(data.clone()).map_err(malformed)?;
                GatewayEvent::ChargeFailed {
                    order_id: d.order_id,
                    code: d.code,
                    message: d.message,
                }
            }
            CHARGE_REFUNDED => {
                let d: OrderData = serde_json::from_value(data.clone()).map_err(malformed)?;
                GatewayEvent::ChargeRefunded {
                    order_id: d.order_id,
                }
            }
            CHARGE_CANCELLED => {
                let d: OrderData = serde_json::from_value(data.clone()).map_err(malformed)?;
                GatewayEvent::ChargeCancelled {
                    order_id: d.order_id,
                    reason: d.reason.unwrap_or_else(|| "cancelled at gateway".to_string()),
                }
            }
            other => GatewayEvent::Unknown(other.to_string()),
        })
    }

    pub fn order_id(&self) -> Option<&str> {
        match self {
            GatewayEvent::ChargeSucceeded { order_id, .. }
            | GatewayEvent::ChargeFailed { order_id, .. }
            | GatewayEvent::ChargeRefunded { order_id }
            | GatewayEvent::ChargeCancelled { order_id, .. } => Some(order_id),
            GatewayEvent::Unknown(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    AlreadyProcessed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub handled: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct WebhookReconciler {
    store: Arc<dyn BillingStore>,
    payments: PaymentService,
    checkout: CheckoutService,
    settlement: SettlementJob,
    policy: WebhookPolicy,
}

impl WebhookReconciler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        payments: PaymentService,
        checkout: CheckoutService,
        settlement: SettlementJob,
        policy: WebhookPolicy,
    ) -> Self {
        Self {
            store,
            payments,
            checkout,
            settlement,
            policy,
        }
    }

    /// Store a verified delivery. Returns the stored event and whether it was
    /// new; redeliveries of a known event id are not stored twice.
    pub async fn ingest(&self, payload: &serde_json::Value) -> BillingResult<(WebhookEvent, bool)> {
        let envelope = WebhookEnvelope::parse(payload)?;
        let (event, inserted) = self
            .store
            .record_webhook_event(
                &envelope.event_id,
                &envelope.event_type,
                payload,
                OffsetDateTime::now_utc(),
            )
            .await?;

        if inserted {
            tracing::info!(
                event_id = %event.external_event_id,
                event_type = %event.event_type,
                "Webhook queued"
            );
        } else {
            tracing::debug!(
                event_id = %event.external_event_id,
                "Duplicate webhook delivery ignored"
            );
        }
        Ok((event, inserted))
    }

    /// Apply a stored event once
    pub async fn handle(&self, external_event_id: &str) -> BillingResult<WebhookOutcome> {
        let event = self
            .store
            .webhook_event(external_event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("webhook {}", external_event_id)))?;
        if event.processed {
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        match self.dispatch(&event).await {
            Ok(()) => {
                self.store
                    .mark_webhook_processed(event.id, OffsetDateTime::now_utc())
                    .await?;
                tracing::info!(
                    event_id = %event.external_event_id,
                    event_type = %event.event_type,
                    "Webhook processed"
                );
                Ok(WebhookOutcome::Applied)
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %event.external_event_id,
                    event_type = %event.event_type,
                    attempts = event.attempts + 1,
                    error = %e,
                    "Webhook processing failed; will retry"
                );
                self.store
                    .record_webhook_failure(event.id, &e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    /// Retry unprocessed events still inside the retry window
    pub async fn sweep(&self) -> BillingResult<SweepSummary> {
        let since = OffsetDateTime::now_utc() - self.policy.retry_window;
        let pending = self
            .store
            .unprocessed_webhook_events(since, self.policy.sweep_batch)
            .await?;

        let mut summary = SweepSummary::default();
        for event in pending {
            match self.handle(&event.external_event_id).await {
                Ok(_) => summary.handled += 1,
                Err(_) => summary.failed += 1,
            }
        }

        if summary.handled + summary.failed > 0 {
            tracing::info!(
                handled = summary.handled,
                failed = summary.failed,
                "Webhook sweep finished"
            );
        }
        Ok(summary)
    }

    /// Drop events older than the retention period
    pub async fn purge(&self) -> BillingResult<u64> {
        let before = OffsetDateTime::now_utc() - self.policy.retention;
        let removed = self.store.purge_webhook_events(before).await?;
        if removed > 0 {
            tracing::info!(removed, "Purged old webhook events");
        }
        Ok(removed)
    }

    async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<()> {
        let data = event
            .payload
            .get("data")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let gateway_event = GatewayEvent::parse(&event.event_type, &data)?;

        let Some(order_id) = gateway_event.order_id() else {
            tracing::warn!(
                event_id = %event.external_event_id,
                event_type = %event.event_type,
                "Unhandled webhook type"
            );
            return Ok(());
        };
        let payment = self
            .store
            .payment_by_order(order_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("order {}", order_id)))?;

        let result = match gateway_event {
            GatewayEvent::ChargeSucceeded {
                order_id,
                payment_key,
                amount,
                approved_at,
            } => {
                let charge = ApprovedCharge {
                    payment_key,
                    order_id,
                    amount,
                    approved_at: approved_at.unwrap_or(event.received_at),
                    method: None,
                };
                self.on_succeeded(event, &payment, charge).await
            }
            GatewayEvent::ChargeFailed { code, message, .. } => {
                self.on_failed(event, &payment, code, message).await
            }
            GatewayEvent::ChargeRefunded { .. } => self.on_refunded(event, &payment).await,
            GatewayEvent::ChargeCancelled { reason, .. } => {
                self.on_cancelled(&payment, &reason).await
            }
            GatewayEvent::Unknown(_) => Ok(()),
        };

        match result {
            // already logged and audited; retrying cannot change the outcome
            Err(e) if e.is_alert_worthy() => {
                tracing::warn!(
                    event_id = %event.external_event_id,
                    order_id = %payment.order_id,
                    error = %e,
                    "Webhook applied with integrity failure"
                );
                Ok(())
            }
            other => other,
        }
    }

    async fn on_succeeded(
        &self,
        event: &WebhookEvent,
        payment: &PaymentRecord,
        charge: ApprovedCharge,
    ) -> BillingResult<()> {
        match payment.status {
            PaymentStatus::Pending => {
                let evidence = GatewayResponse::WebhookConfirmed {
                    event_id: event.external_event_id.clone(),
                    payment_key: charge.payment_key.clone(),
                    amount: charge.amount,
                };
                let verdict = payment
                    .judge(&ChargeResult::Approved(charge))
                    .with_evidence(evidence);

                if payment.payment_kind == PaymentKind::Recurring {
                    self.settlement.apply_renewal_verdict(payment, verdict).await?;
                    return Ok(());
                }
                let settled = self.payments.settle_verdict(payment, verdict).await?;
                if settled.status.is_settled() {
                    self.checkout.complete(&settled).await?;
                }
                Ok(())
            }
            // redelivery, or a crash between PAID and activation
            PaymentStatus::Paid | PaymentStatus::Waived => {
                if payment.payment_kind != PaymentKind::Recurring {
                    self.checkout.complete(payment).await?;
                }
                Ok(())
            }
            PaymentStatus::Refunded => Ok(()),
            PaymentStatus::Failed | PaymentStatus::Cancelled => {
                let violation = BillingError::IllegalTransition {
                    from: payment.status,
                    to: PaymentStatus::Paid,
                };
                self.payments.report_violation(payment, &violation).await;
                Ok(())
            }
        }
    }

    async fn on_failed(
        &self,
        event: &WebhookEvent,
        payment: &PaymentRecord,
        code: String,
        message: String,
    ) -> BillingResult<()> {
        if payment.status != PaymentStatus::Pending {
            tracing::info!(
                order_id = %payment.order_id,
                status = %payment.status,
                "Ignoring failure notice for settled payment"
            );
            return Ok(());
        }

        let evidence = GatewayResponse::WebhookFailed {
            event_id: event.external_event_id.clone(),
            code: code.clone(),
            message: message.clone(),
        };
        let verdict = payment
            .judge(&ChargeResult::Declined(DeclinedCharge {
                code,
                message,
                http_status: None,
            }))
            .with_evidence(evidence);

        if payment.payment_kind == PaymentKind::Recurring {
            self.settlement.apply_renewal_verdict(payment, verdict).await?;
        } else {
            self.payments.settle_verdict(payment, verdict).await?;
        }
        Ok(())
    }

    async fn on_refunded(&self, event: &WebhookEvent, payment: &PaymentRecord) -> BillingResult<()> {
        match payment.status {
            PaymentStatus::Paid => {
                self.payments
                    .mark_refunded(payment, &event.external_event_id)
                    .await?;
                Ok(())
            }
            PaymentStatus::Refunded => Ok(()),
            status => {
                tracing::warn!(
                    order_id = %payment.order_id,
                    status = %status,
                    "Refund notice for payment that was never paid"
                );
                Ok(())
            }
        }
    }

    async fn on_cancelled(&self, payment: &PaymentRecord, reason: &str) -> BillingResult<()> {
        match payment.status {
            PaymentStatus::Pending => {
                self.payments.cancel_pending(payment, reason).await?;
                Ok(())
            }
            PaymentStatus::Cancelled => Ok(()),
            status => {
                tracing::warn!(
                    order_id = %payment.order_id,
                    status = %status,
                    "Cancellation notice for payment that already settled"
                );
                Ok(())
            }
        }
    }
}
