//! Payment records
//!
//! One record per charge attempt. Status moves along
//! `PENDING -> {PAID, FAILED, CANCELLED, WAIVED}` and `PAID -> REFUNDED`;
//! every write is conditional on the status the caller last observed.

use std::sync::Arc;

use learnhub_shared::{CouponId, Currency, PaymentId, PlanId, SubscriptionId, UserId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::audit::{ActorType, AuditLog, BillingEventBuilder, BillingEventType};
use crate::coupon::DiscountTerms;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeResult, GatewayResponse, PaymentGateway};
use crate::store::BillingStore;

/// Longest order id the gateway accepts
const MAX_ORDER_ID_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Waived,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Failed => "FAILED",
            Self::Waived => "WAIVED",
            Self::Cancelled => "CANCELLED",
            Self::Refunded => "REFUNDED",
        }
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Paid) | (Pending, Failed) | (Pending, Cancelled) | (Pending, Waived) | (Paid, Refunded)
        )
    }

    /// PAID and WAIVED both entitle the payer to what they bought
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Paid | Self::Waived)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PAID" => Ok(Self::Paid),
            "FAILED" => Ok(Self::Failed),
            "WAIVED" => Ok(Self::Waived),
            "CANCELLED" => Ok(Self::Cancelled),
            "REFUNDED" => Ok(Self::Refunded),
            _ => Err(BillingError::Internal(format!("Unknown payment status: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentKind {
    OneTime,
    InitialSubscription,
    Recurring,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneTime => "ONE_TIME",
            Self::InitialSubscription => "INITIAL_SUBSCRIPTION",
            Self::Recurring => "RECURRING",
        }
    }
}

impl std::str::FromStr for PaymentKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONE_TIME" => Ok(Self::OneTime),
            "INITIAL_SUBSCRIPTION" => Ok(Self::InitialSubscription),
            "RECURRING" => Ok(Self::Recurring),
            _ => Err(BillingError::Internal(format!("Unknown payment kind: {}", s))),
        }
    }
}

/// `max(0, original - discount)`, rejecting negative inputs
pub fn final_amount(original_amount: i64, discount_amount: i64) -> BillingResult<i64> {
    if original_amount < 0 || discount_amount < 0 {
        return Err(BillingError::InvalidAmount(format!(
            "amounts must not be negative (original {}, discount {})",
            original_amount, discount_amount
        )));
    }
    Ok((original_amount - discount_amount).max(0))
}

/// Input for a new PENDING record
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub subscription_id: Option<SubscriptionId>,
    pub order_id: String,
    pub original_amount: i64,
    pub discount_amount: i64,
    pub currency: Currency,
    pub kind: PaymentKind,
    pub applied_coupon_id: Option<CouponId>,
    /// Terms `discount_amount` was quoted from
    pub coupon_terms: Option<DiscountTerms>,
    pub billing_cycle_due: Option<OffsetDateTime>,
    pub attempt_number: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: PaymentId,
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub subscription_id: Option<SubscriptionId>,
    pub order_id: String,
    pub external_charge_key: Option<String>,
    pub original_amount: i64,
    pub discount_amount: i64,
    pub final_amount: i64,
    pub currency: Currency,
    pub status: PaymentStatus,
    pub payment_kind: PaymentKind,
    pub applied_coupon_id: Option<CouponId>,
    pub coupon_terms: Option<DiscountTerms>,
    /// Vault envelope of the billing key registered during checkout
    #[serde(skip_serializing, default)]
    pub encrypted_credential: Option<String>,
    /// The `next_billing_date` a RECURRING record was created for
    pub billing_cycle_due: Option<OffsetDateTime>,
    pub attempt_number: i32,
    pub failure_reason: Option<String>,
    pub raw_gateway_response: Option<GatewayResponse>,
    pub approved_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl PaymentRecord {
    /// Build a validated PENDING record. Nothing invalid is ever persisted.
    pub fn new_pending(new: NewPayment, now: OffsetDateTime) -> BillingResult<Self> {
        let order_id = new.order_id.trim().to_string();
        if order_id.is_empty() || order_id.len() > MAX_ORDER_ID_LEN {
            return Err(BillingError::InvalidInput(format!(
                "order id must be 1..={} characters",
                MAX_ORDER_ID_LEN
            )));
        }
        if new.attempt_number < 1 {
            return Err(BillingError::InvalidInput(
                "attempt number starts at 1".to_string(),
            ));
        }
        if new.kind == PaymentKind::Recurring
            && (new.subscription_id.is_none() || new.billing_cycle_due.is_none())
        {
            return Err(BillingError::InvalidInput(
                "recurring payments must reference a subscription cycle".to_string(),
            ));
        }

        let final_amount = final_amount(new.original_amount, new.discount_amount)?;

        Ok(Self {
            id: PaymentId::new(),
            user_id: new.user_id,
            plan_id: new.plan_id,
            subscription_id: new.subscription_id,
            order_id,
            external_charge_key: None,
            original_amount: new.original_amount,
            discount_amount: new.discount_amount,
            final_amount,
            currency: new.currency,
            status: PaymentStatus::Pending,
            payment_kind: new.kind,
            applied_coupon_id: new.applied_coupon_id,
            coupon_terms: new.coupon_terms,
            encrypted_credential: None,
            billing_cycle_due: new.billing_cycle_due,
            attempt_number: new.attempt_number,
            failure_reason: None,
            raw_gateway_response: None,
            approved_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Holds the amount invariant
    pub fn amounts_consistent(&self) -> bool {
        final_amount(self.original_amount, self.discount_amount).ok() == Some(self.final_amount)
    }

    /// Apply a transition in memory after checking it is legal
    pub fn apply(&self, transition: &PaymentTransition, now: OffsetDateTime) -> BillingResult<Self> {
        if !self.status.can_transition_to(transition.to) {
            return Err(BillingError::IllegalTransition {
                from: self.status,
                to: transition.to,
            });
        }

        let mut next = self.clone();
        next.status = transition.to;
        if transition.external_charge_key.is_some() {
            next.external_charge_key = transition.external_charge_key.clone();
        }
        if transition.raw_gateway_response.is_some() {
            next.raw_gateway_response = transition.raw_gateway_response.clone();
        }
        if transition.approved_at.is_some() {
            next.approved_at = transition.approved_at;
        }
        if transition.failure_reason.is_some() {
            next.failure_reason = transition.failure_reason.clone();
        }
        next.updated_at = now;
        Ok(next)
    }

    /// Decide what a gateway result means for this record.
    ///
    /// An approval whose amount or order id disagrees with the record is a
    /// rejection carrying an integrity violation, whatever the gateway said.
    pub fn judge(&self, result: &ChargeResult) -> ChargeVerdict {
        match result {
            ChargeResult::Approved(charge) => {
                if charge.amount != self.final_amount || charge.order_id != self.order_id {
                    return ChargeVerdict::Rejected {
                        transition: PaymentTransition::failed(
                            "AMOUNT_MISMATCH",
                            Some(GatewayResponse::from(charge)),
                        ),
                        violation: Some(BillingError::AmountMismatch {
                            order_id: self.order_id.clone(),
                            expected: self.final_amount,
                            actual: charge.amount,
                        }),
                    };
                }
                ChargeVerdict::Approved {
                    transition: PaymentTransition {
                        to: PaymentStatus::Paid,
                        external_charge_key: Some(charge.payment_key.clone()),
                        raw_gateway_response: Some(GatewayResponse::from(charge)),
                        approved_at: Some(charge.approved_at),
                        failure_reason: None,
                    },
                }
            }
            ChargeResult::Declined(decline) => ChargeVerdict::Rejected {
                transition: PaymentTransition::failed(
                    format!("{}: {}", decline.code, decline.message),
                    Some(GatewayResponse::from(decline)),
                ),
                violation: None,
            },
            ChargeResult::Indeterminate { reason } => ChargeVerdict::Unresolved {
                reason: reason.clone(),
            },
        }
    }
}

/// Fields written together with a status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTransition {
    pub to: PaymentStatus,
    pub external_charge_key: Option<String>,
    pub raw_gateway_response: Option<GatewayResponse>,
    pub approved_at: Option<OffsetDateTime>,
    pub failure_reason: Option<String>,
}

impl PaymentTransition {
    pub fn failed(reason: impl Into<String>, raw: Option<GatewayResponse>) -> Self {
        Self {
            to: PaymentStatus::Failed,
            external_charge_key: None,
            raw_gateway_response: raw,
            approved_at: None,
            failure_reason: Some(reason.into()),
        }
    }

    pub fn waived(now: OffsetDateTime) -> Self {
        Self {
            to: PaymentStatus::Waived,
            external_charge_key: None,
            raw_gateway_response: Some(GatewayResponse::Waived { waived_at: now }),
            approved_at: Some(now),
            failure_reason: None,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            to: PaymentStatus::Cancelled,
            external_charge_key: None,
            raw_gateway_response: Some(GatewayResponse::Cancelled {
                reason: reason.clone(),
            }),
            approved_at: None,
            failure_reason: Some(reason),
        }
    }

    pub fn refunded(event_id: impl Into<String>) -> Self {
        Self {
            to: PaymentStatus::Refunded,
            external_charge_key: None,
            raw_gateway_response: Some(GatewayResponse::Refunded {
                event_id: event_id.into(),
            }),
            approved_at: None,
            failure_reason: None,
        }
    }
}

/// What a gateway result means for a PENDING record
#[derive(Debug)]
pub enum ChargeVerdict {
    Approved {
        transition: PaymentTransition,
    },
    Rejected {
        transition: PaymentTransition,
        /// Present when the rejection is an integrity failure
        violation: Option<BillingError>,
    },
    /// Outcome unknown; the record stays PENDING
    Unresolved {
        reason: String,
    },
}

impl ChargeVerdict {
    /// Replace the persisted gateway evidence, e.g. with the webhook that
    /// delivered the outcome
    pub fn with_evidence(self, evidence: GatewayResponse) -> Self {
        match self {
            ChargeVerdict::Approved { mut transition } => {
                transition.raw_gateway_response = Some(evidence);
                ChargeVerdict::Approved { transition }
            }
            ChargeVerdict::Rejected {
                mut transition,
                violation,
            } => {
                transition.raw_gateway_response = Some(evidence);
                ChargeVerdict::Rejected {
                    transition,
                    violation,
                }
            }
            unresolved => unresolved,
        }
    }
}

/// How a charge is authorized at the gateway
#[derive(Clone, Copy)]
pub enum ChargeInstrument<'a> {
    /// Client-side authorized payment being confirmed
    PaymentKey(&'a str),
    /// Off-session charge against a decrypted billing key
    BillingKey {
        billing_key: &'a str,
        customer_key: &'a str,
        order_name: &'a str,
    },
}

/// Drives individual payment records through the state machine
#[derive(Clone)]
pub struct PaymentService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    audit: AuditLog,
    lookup_attempts: usize,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        audit: AuditLog,
        lookup_attempts: usize,
    ) -> Self {
        Self {
            store,
            gateway,
            audit,
            lookup_attempts: lookup_attempts.max(1),
        }
    }

    /// Validate and insert a PENDING record. A reused order id is a conflict.
    pub async fn create_pending(&self, new: NewPayment) -> BillingResult<PaymentRecord> {
        let record = PaymentRecord::new_pending(new, OffsetDateTime::now_utc())?;

        if let Err(e) = self.store.insert_payment(&record).await {
            match e {
                BillingError::DuplicateOrder(ref order_id) => tracing::error!(
                    order_id = %order_id,
                    user_id = %record.user_id,
                    "Duplicate order id rejected"
                ),
                BillingError::CheckoutInProgress(ref open_order) => tracing::info!(
                    open_order = %open_order,
                    user_id = %record.user_id,
                    "Checkout refused: another subscription checkout is open"
                ),
                _ => {}
            }
            return Err(e);
        }

        tracing::info!(
            payment_id = %record.id,
            order_id = %record.order_id,
            user_id = %record.user_id,
            final_amount = record.final_amount,
            kind = record.payment_kind.as_str(),
            "Created pending payment"
        );

        Ok(record)
    }

    /// Charge a PENDING record once and settle it. Never retries on its own.
    ///
    /// Returns the record in its new state: PAID, FAILED, or still PENDING
    /// when the outcome could not be determined even after re-querying.
    pub async fn confirm_with_gateway(
        &self,
        record: &PaymentRecord,
        instrument: ChargeInstrument<'_>,
    ) -> BillingResult<PaymentRecord> {
        if record.status != PaymentStatus::Pending {
            return self.already_transitioned(record, PaymentStatus::Paid);
        }
        let result = self.charge(record, instrument).await?;
        self.settle(record, &result).await
    }

    /// Call the gateway for a PENDING record without writing the outcome.
    ///
    /// An indeterminate answer is re-queried before it is returned.
    pub async fn charge(
        &self,
        record: &PaymentRecord,
        instrument: ChargeInstrument<'_>,
    ) -> BillingResult<ChargeResult> {
        if record.status != PaymentStatus::Pending {
            return Err(BillingError::IllegalTransition {
                from: record.status,
                to: PaymentStatus::Paid,
            });
        }
        if record.final_amount == 0 {
            return Err(BillingError::InvalidAmount(
                "zero-amount payments must be waived, not charged".to_string(),
            ));
        }

        self.audit_payment(record, BillingEventType::PaymentAttempted, serde_json::json!({
            "amount": record.final_amount,
            "attempt": record.attempt_number,
        }))
        .await;

        let result = match instrument {
            ChargeInstrument::PaymentKey(payment_key) => {
                self.gateway
                    .confirm_charge(payment_key, &record.order_id, record.final_amount)
                    .await
            }
            ChargeInstrument::BillingKey {
                billing_key,
                customer_key,
                order_name,
            } => {
                self.gateway
                    .charge_with_key(
                        billing_key,
                        customer_key,
                        record.final_amount,
                        &record.order_id,
                        order_name,
                    )
                    .await
            }
        };

        if result.is_indeterminate() {
            return Ok(self.requery(&record.order_id).await);
        }
        Ok(result)
    }

    /// Re-query the gateway's record of an order with bounded backoff
    pub async fn requery(&self, order_id: &str) -> ChargeResult {
        let strategy = ExponentialBackoff::from_millis(200)
            .max_delay(std::time::Duration::from_secs(5))
            .map(jitter)
            .take(self.lookup_attempts.saturating_sub(1));

        let outcome = Retry::spawn(strategy, || async {
            match self.gateway.lookup_charge(order_id).await {
                ChargeResult::Indeterminate { reason } => Err(reason),
                conclusive => Ok(conclusive),
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(reason) => {
                tracing::warn!(
                    order_id = %order_id,
                    reason = %reason,
                    "Charge outcome still unknown after re-query; leaving pending"
                );
                ChargeResult::Indeterminate { reason }
            }
        }
    }

    /// Apply a gateway result to a non-recurring record
    pub async fn settle(
        &self,
        record: &PaymentRecord,
        result: &ChargeResult,
    ) -> BillingResult<PaymentRecord> {
        self.settle_verdict(record, record.judge(result)).await
    }

    pub async fn settle_verdict(
        &self,
        record: &PaymentRecord,
        verdict: ChargeVerdict,
    ) -> BillingResult<PaymentRecord> {
        match verdict {
            ChargeVerdict::Approved { transition } => {
                let updated = self.apply_transition(record, &transition).await?;
                self.audit_payment(&updated, BillingEventType::PaymentSucceeded, serde_json::json!({
                    "amount": updated.final_amount,
                    "external_charge_key": updated.external_charge_key,
                }))
                .await;
                Ok(updated)
            }
            ChargeVerdict::Rejected {
                transition,
                violation: Some(violation),
            } => {
                self.apply_transition(record, &transition).await?;
                self.report_violation(record, &violation).await;
                Err(violation)
            }
            ChargeVerdict::Rejected {
                transition,
                violation: None,
            } => {
                let updated = self.apply_transition(record, &transition).await?;
                tracing::warn!(
                    payment_id = %updated.id,
                    order_id = %updated.order_id,
                    reason = ?updated.failure_reason,
                    "Payment failed"
                );
                self.audit_payment(&updated, BillingEventType::PaymentFailed, serde_json::json!({
                    "reason": updated.failure_reason,
                    "attempt": updated.attempt_number,
                }))
                .await;
                Ok(updated)
            }
            ChargeVerdict::Unresolved { reason } => {
                tracing::warn!(
                    payment_id = %record.id,
                    order_id = %record.order_id,
                    reason = %reason,
                    "Payment outcome indeterminate; awaiting reconciliation"
                );
                Ok(record.clone())
            }
        }
    }

    /// Settle a zero-amount record without contacting the gateway
    pub async fn mark_waived(&self, record: &PaymentRecord) -> BillingResult<PaymentRecord> {
        if record.final_amount != 0 {
            return Err(BillingError::InvalidAmount(format!(
                "only zero-amount payments can be waived (order {} is {})",
                record.order_id, record.final_amount
            )));
        }
        if record.status == PaymentStatus::Waived {
            return Ok(record.clone());
        }

        let now = OffsetDateTime::now_utc();
        let updated = self
            .apply_transition(record, &PaymentTransition::waived(now))
            .await?;

        self.audit_payment(&updated, BillingEventType::PaymentWaived, serde_json::json!({
            "original_amount": updated.original_amount,
            "discount_amount": updated.discount_amount,
            "coupon_id": updated.applied_coupon_id,
        }))
        .await;

        Ok(updated)
    }

    pub async fn cancel_pending(
        &self,
        record: &PaymentRecord,
        reason: &str,
    ) -> BillingResult<PaymentRecord> {
        let updated = self
            .apply_transition(record, &PaymentTransition::cancelled(reason))
            .await?;
        self.audit_payment(&updated, BillingEventType::PaymentCancelled, serde_json::json!({
            "reason": reason,
        }))
        .await;
        Ok(updated)
    }

    pub async fn mark_refunded(
        &self,
        record: &PaymentRecord,
        event_id: &str,
    ) -> BillingResult<PaymentRecord> {
        let updated = self
            .apply_transition(record, &PaymentTransition::refunded(event_id))
            .await?;
        self.audit_payment(&updated, BillingEventType::PaymentRefunded, serde_json::json!({
            "amount": updated.final_amount,
            "event_id": event_id,
        }))
        .await;
        Ok(updated)
    }

    /// Conditional write: succeeds only while the row still has `record.status`.
    ///
    /// Losing the race to an identical transition is not an error; losing it
    /// to a different one is.
    pub async fn apply_transition(
        &self,
        record: &PaymentRecord,
        transition: &PaymentTransition,
    ) -> BillingResult<PaymentRecord> {
        if !record.status.can_transition_to(transition.to) {
            return self.already_transitioned(record, transition.to);
        }

        let now = OffsetDateTime::now_utc();
        if let Some(updated) = self
            .store
            .transition_payment(record.id, record.status, transition, now)
            .await?
        {
            return Ok(updated);
        }

        let current = self
            .store
            .payment(record.id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", record.id)))?;
        self.already_transitioned(&current, transition.to)
    }

    fn already_transitioned(
        &self,
        current: &PaymentRecord,
        wanted: PaymentStatus,
    ) -> BillingResult<PaymentRecord> {
        if current.status == wanted {
            return Ok(current.clone());
        }
        tracing::error!(
            payment_id = %current.id,
            order_id = %current.order_id,
            from = %current.status,
            to = %wanted,
            "Rejected illegal payment transition"
        );
        Err(BillingError::IllegalTransition {
            from: current.status,
            to: wanted,
        })
    }

    pub(crate) async fn report_violation(&self, record: &PaymentRecord, violation: &BillingError) {
        tracing::error!(
            payment_id = %record.id,
            order_id = %record.order_id,
            user_id = %record.user_id,
            error = %violation,
            "INTEGRITY: payment rejected; manual review required"
        );
        self.audit_payment(record, BillingEventType::IntegrityViolation, serde_json::json!({
            "error": violation.to_string(),
        }))
        .await;
    }

    async fn audit_payment(
        &self,
        record: &PaymentRecord,
        event_type: BillingEventType,
        data: serde_json::Value,
    ) {
        let mut builder = BillingEventBuilder::new(event_type)
            .user(record.user_id)
            .order(&record.order_id)
            .data(data)
            .actor_type(ActorType::System);
        if let Some(subscription_id) = record.subscription_id {
            builder = builder.subscription(subscription_id);
        }
        self.audit.emit(builder).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ApprovedCharge, DeclinedCharge};

    fn pending(original: i64, discount: i64) -> PaymentRecord {
        PaymentRecord::new_pending(
            NewPayment {
                user_id: UserId::new(),
                plan_id: PlanId::new(),
                subscription_id: None,
                order_id: "order-123".to_string(),
                original_amount: original,
                discount_amount: discount,
                currency: Currency::Krw,
                kind: PaymentKind::InitialSubscription,
                applied_coupon_id: None,
                coupon_terms: None,
                billing_cycle_due: None,
                attempt_number: 1,
            },
            OffsetDateTime::now_utc(),
        )
        .unwrap()
    }

    fn approved(order_id: &str, amount: i64) -> ChargeResult {
        ChargeResult::Approved(ApprovedCharge {
            payment_key: "pk_1".to_string(),
            order_id: order_id.to_string(),
            amount,
            approved_at: OffsetDateTime::now_utc(),
            method: None,
        })
    }

    #[test]
    fn test_final_amount_invariant() {
        assert_eq!(final_amount(9_900, 1_000).unwrap(), 8_900);
        assert_eq!(final_amount(9_900, 9_900).unwrap(), 0);
        assert_eq!(final_amount(9_900, 20_000).unwrap(), 0);
        assert!(final_amount(-1, 0).is_err());
        assert!(final_amount(100, -1).is_err());

        for (original, discount) in [(0, 0), (1, 0), (500, 499), (500, 501), (10_000, 2_500)] {
            let record = pending(original, discount);
            assert!(record.final_amount >= 0);
            assert_eq!(record.final_amount, (original - discount).max(0));
            assert!(record.amounts_consistent());
        }
    }

    #[test]
    fn test_new_pending_validation() {
        let base = NewPayment {
            user_id: UserId::new(),
            plan_id: PlanId::new(),
            subscription_id: None,
            order_id: "  ".to_string(),
            original_amount: 100,
            discount_amount: 0,
            currency: Currency::Usd,
            kind: PaymentKind::OneTime,
            applied_coupon_id: None,
            coupon_terms: None,
            billing_cycle_due: None,
            attempt_number: 1,
        };
        let now = OffsetDateTime::now_utc();
        assert!(PaymentRecord::new_pending(base.clone(), now).is_err());

        let recurring_without_cycle = NewPayment {
            order_id: "renew-1".to_string(),
            kind: PaymentKind::Recurring,
            ..base.clone()
        };
        assert!(PaymentRecord::new_pending(recurring_without_cycle, now).is_err());

        let too_long = NewPayment {
            order_id: "x".repeat(65),
            ..base
        };
        assert!(PaymentRecord::new_pending(too_long, now).is_err());
    }

    #[test]
    fn test_state_machine_paths() {
        use PaymentStatus::*;
        let all = [Pending, Paid, Failed, Waived, Cancelled, Refunded];
        for from in all {
            for to in all {
                let expected = matches!(
                    (from, to),
                    (Pending, Paid | Failed | Cancelled | Waived) | (Paid, Refunded)
                );
                assert_eq!(from.can_transition_to(to), expected, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_apply_rejects_illegal_transition() {
        let now = OffsetDateTime::now_utc();
        let record = pending(9_900, 0);
        let failed = record
            .apply(&PaymentTransition::failed("declined", None), now)
            .unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);

        let err = failed
            .apply(&PaymentTransition::refunded("evt_1"), now)
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::IllegalTransition {
                from: PaymentStatus::Failed,
                to: PaymentStatus::Refunded
            }
        ));
    }

    #[test]
    fn test_judge_amount_mismatch_rejects_even_on_approval() {
        let record = pending(9_900, 0);
        match record.judge(&approved("order-123", 100)) {
            ChargeVerdict::Rejected {
                transition,
                violation: Some(BillingError::AmountMismatch { expected, actual, .. }),
            } => {
                assert_eq!(transition.to, PaymentStatus::Failed);
                assert_eq!(expected, 9_900);
                assert_eq!(actual, 100);
            }
            other => panic!("expected integrity rejection, got {:?}", other),
        }

        assert!(matches!(
            record.judge(&approved("someone-elses-order", 9_900)),
            ChargeVerdict::Rejected { violation: Some(_), .. }
        ));
    }

    #[test]
    fn test_judge_outcomes() {
        let record = pending(9_900, 900);
        match record.judge(&approved("order-123", 9_000)) {
            ChargeVerdict::Approved { transition } => {
                assert_eq!(transition.to, PaymentStatus::Paid);
                assert_eq!(transition.external_charge_key.as_deref(), Some("pk_1"));
                assert!(transition.approved_at.is_some());
            }
            other => panic!("expected approval, got {:?}", other),
        }

        let declined = ChargeResult::Declined(DeclinedCharge {
            code: "REJECT_CARD_COMPANY".to_string(),
            message: "limit exceeded".to_string(),
            http_status: Some(403),
        });
        match record.judge(&declined) {
            ChargeVerdict::Rejected {
                transition,
                violation: None,
            } => assert_eq!(
                transition.failure_reason.as_deref(),
                Some("REJECT_CARD_COMPANY: limit exceeded")
            ),
            other => panic!("expected decline, got {:?}", other),
        }

        assert!(matches!(
            record.judge(&ChargeResult::Indeterminate {
                reason: "timeout".to_string()
            }),
            ChargeVerdict::Unresolved { .. }
        ));
    }
}
