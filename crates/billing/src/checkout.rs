//! Checkout: quote, charge and turn the first payment into an entitlement

use std::sync::Arc;

use learnhub_shared::{CouponId, Currency, PlanId, SubscriptionId, UserId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{ActorType, AuditLog, BillingEventBuilder, BillingEventType};
use crate::coupon::{CouponApplication, DiscountCoupon};
use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;
use crate::payment::{
    final_amount, ChargeInstrument, NewPayment, PaymentKind, PaymentRecord, PaymentService,
    PaymentStatus, PaymentTransition,
};
use crate::store::{BillingStore, SubscriptionActivation};
use crate::subscription::Subscription;
use crate::vault::BillingKeyVault;

/// A user's request to buy a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub user_id: UserId,
    pub plan_id: PlanId,
    #[serde(default)]
    pub currency: Currency,
    pub coupon_code: Option<String>,
    /// Client-generated idempotency key
    pub order_id: String,
    /// ONE_TIME or INITIAL_SUBSCRIPTION
    pub kind: PaymentKind,
}

/// Result of a settled checkout
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutOutcome {
    pub payment: PaymentRecord,
    pub subscription: Option<Subscription>,
}

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    payments: PaymentService,
    vault: BillingKeyVault,
    audit: AuditLog,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        payments: PaymentService,
        vault: BillingKeyVault,
        audit: AuditLog,
    ) -> Self {
        Self {
            store,
            gateway,
            payments,
            vault,
            audit,
        }
    }

    /// Price the order and create its PENDING payment
    pub async fn start_checkout(&self, request: CheckoutRequest) -> BillingResult<PaymentRecord> {
        if request.kind == PaymentKind::Recurring {
            return Err(BillingError::InvalidInput(
                "renewals are created by settlement, not checkout".to_string(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let plan = self
            .store
            .plan(request.plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", request.plan_id)))?;
        if !plan.active {
            return Err(BillingError::InvalidInput(format!(
                "plan {} is not on sale",
                plan.name
            )));
        }

        if request.kind == PaymentKind::InitialSubscription {
            if let Some(live) = self.store.live_subscription(request.user_id, now).await? {
                tracing::info!(
                    user_id = %request.user_id,
                    subscription_id = %live.id,
                    "Checkout refused: user already subscribed"
                );
                return Err(BillingError::ActiveSubscriptionExists(
                    request.user_id.to_string(),
                ));
            }
        }

        let coupon = match request.coupon_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => Some(self.redeemable_coupon(code, now).await?),
            _ => None,
        };

        let original_amount = plan.price_for(request.currency);
        let discount_amount = match coupon {
            Some(ref c) => c.quote(original_amount, request.currency)?,
            None => 0,
        };

        let record = self
            .payments
            .create_pending(NewPayment {
                user_id: request.user_id,
                plan_id: plan.id,
                subscription_id: None,
                order_id: request.order_id,
                original_amount,
                discount_amount,
                currency: request.currency,
                kind: request.kind,
                applied_coupon_id: coupon.as_ref().map(|c| c.id),
                coupon_terms: coupon.as_ref().map(|c| c.terms()),
                billing_cycle_due: None,
                attempt_number: 1,
            })
            .await?;

        self.audit
            .emit(
                BillingEventBuilder::new(BillingEventType::CheckoutStarted)
                    .user(record.user_id)
                    .order(&record.order_id)
                    .data(serde_json::json!({
                        "plan_id": plan.id,
                        "kind": record.payment_kind.as_str(),
                        "currency": record.currency.as_str(),
                        "original_amount": record.original_amount,
                        "discount_amount": record.discount_amount,
                        "final_amount": record.final_amount,
                        "coupon_code": coupon.as_ref().map(|c| c.code.as_str()),
                    }))
                    .actor(record.user_id.0, ActorType::User),
            )
            .await;

        Ok(record)
    }

    /// Register a reusable card for a subscription checkout and take the
    /// first payment with it
    pub async fn register_billing_key(
        &self,
        order_id: &str,
        auth_key: &str,
    ) -> BillingResult<CheckoutOutcome> {
        let record = self.pending_payment(order_id).await?;
        if record.status.is_settled() {
            return self.complete(&record).await;
        }
        if record.payment_kind != PaymentKind::InitialSubscription {
            return Err(BillingError::InvalidInput(format!(
                "order {} is not a subscription checkout",
                order_id
            )));
        }

        let customer_key = record.user_id.customer_key();
        let issued = self
            .gateway
            .issue_billing_key(auth_key, &customer_key)
            .await?;
        let envelope = self.vault.encrypt(&issued.billing_key)?;

        let record = self
            .store
            .attach_payment_credential(record.id, &envelope, OffsetDateTime::now_utc())
            .await?
            .ok_or_else(|| {
                BillingError::ConcurrentModification(format!(
                    "order {} settled while registering a billing key",
                    order_id
                ))
            })?;

        self.audit
            .emit(
                BillingEventBuilder::new(BillingEventType::BillingKeyIssued)
                    .user(record.user_id)
                    .order(&record.order_id)
                    .data(serde_json::json!({
                        "card_issuer": issued.card.issuer_code,
                        "card_number": issued.card.masked_number,
                        "card_type": issued.card.card_type,
                    }))
                    .actor(record.user_id.0, ActorType::User),
            )
            .await;

        if record.final_amount == 0 {
            let waived = self.payments.mark_waived(&record).await?;
            return self.complete(&waived).await;
        }

        let plan_name = self
            .store
            .plan(record.plan_id)
            .await?
            .map(|p| p.name)
            .unwrap_or_else(|| "Subscription".to_string());

        let charged = self
            .payments
            .confirm_with_gateway(
                &record,
                ChargeInstrument::BillingKey {
                    billing_key: &issued.billing_key,
                    customer_key: &customer_key,
                    order_name: &plan_name,
                },
            )
            .await?;

        self.finish(charged).await
    }

    /// Confirm a client-authorized payment.
    ///
    /// `client_amount` is what the client claims to be paying. It must match
    /// the amount recomputed from the stored record.
    pub async fn confirm_checkout(
        &self,
        order_id: &str,
        payment_key: &str,
        client_amount: i64,
    ) -> BillingResult<CheckoutOutcome> {
        let record = self.pending_payment(order_id).await?;
        if record.status.is_settled() {
            return self.complete(&record).await;
        }

        let expected = final_amount(record.original_amount, record.discount_amount)?;
        if client_amount != expected || record.final_amount != expected {
            let violation = BillingError::AmountMismatch {
                order_id: record.order_id.clone(),
                expected,
                actual: client_amount,
            };
            self.payments
                .apply_transition(
                    &record,
                    &PaymentTransition::failed("AMOUNT_TAMPERED", None),
                )
                .await?;
            self.payments.report_violation(&record, &violation).await;
            return Err(violation);
        }

        if record.final_amount == 0 {
            let waived = self.payments.mark_waived(&record).await?;
            return self.complete(&waived).await;
        }

        let charged = self
            .payments
            .confirm_with_gateway(&record, ChargeInstrument::PaymentKey(payment_key))
            .await?;

        self.finish(charged).await
    }

    /// Fulfil a settled payment: retire single-use coupons and, for
    /// subscription checkouts, create the subscription and attach a recurring
    /// coupon. Safe to call again for the same payment.
    pub async fn complete(&self, payment: &PaymentRecord) -> BillingResult<CheckoutOutcome> {
        if !payment.status.is_settled() {
            return Err(BillingError::InvalidInput(format!(
                "order {} is {}, not PAID or WAIVED",
                payment.order_id, payment.status
            )));
        }

        let coupon = match payment.applied_coupon_id {
            Some(id) => self.store.coupon(id).await?,
            None => None,
        };
        let retire_coupon = coupon
            .as_ref()
            .filter(|c| c.one_time_use_only)
            .map(|c| c.id);

        match payment.payment_kind {
            PaymentKind::OneTime => {
                if let Some(coupon_id) = retire_coupon {
                    self.store.deactivate_coupon(coupon_id).await?;
                    self.coupon_retired(payment, coupon_id).await;
                }
                Ok(CheckoutOutcome {
                    payment: payment.clone(),
                    subscription: None,
                })
            }
            PaymentKind::InitialSubscription => {
                let subscription = self.activate(payment, coupon.as_ref(), retire_coupon).await?;
                Ok(CheckoutOutcome {
                    payment: payment.clone(),
                    subscription: Some(subscription),
                })
            }
            PaymentKind::Recurring => Err(BillingError::InvalidInput(format!(
                "order {} is a renewal, not a checkout",
                payment.order_id
            ))),
        }
    }

    /// Abandon a checkout that was never charged
    pub async fn cancel_pending(&self, order_id: &str, reason: &str) -> BillingResult<PaymentRecord> {
        let record = self.pending_payment(order_id).await?;
        if record.status == PaymentStatus::Cancelled {
            return Ok(record);
        }
        self.payments.cancel_pending(&record, reason).await
    }

    /// Stop future renewals. The paid period is kept.
    pub async fn cancel_subscription(
        &self,
        subscription_id: SubscriptionId,
        actor_type: ActorType,
        actor_id: Option<Uuid>,
    ) -> BillingResult<Subscription> {
        let now = OffsetDateTime::now_utc();
        let Some(cancelled) = self.store.cancel_subscription(subscription_id, now).await? else {
            return match self.store.subscription(subscription_id).await? {
                None => Err(BillingError::NotFound(format!(
                    "subscription {}",
                    subscription_id
                ))),
                Some(sub) => Err(BillingError::InvalidInput(format!(
                    "subscription {} is {}",
                    sub.id, sub.status
                ))),
            };
        };

        tracing::info!(
            subscription_id = %cancelled.id,
            user_id = %cancelled.user_id,
            end_date = %cancelled.end_date,
            "Subscription cancelled; access continues until end date"
        );

        let mut event = BillingEventBuilder::new(BillingEventType::SubscriptionCancelled)
            .user(cancelled.user_id)
            .subscription(cancelled.id)
            .data(serde_json::json!({
                "end_date": cancelled.end_date.unix_timestamp(),
            }))
            .actor_type(actor_type);
        if let Some(actor_id) = actor_id {
            event = event.actor(actor_id, actor_type);
        }
        self.audit.emit(event).await;

        Ok(cancelled)
    }

    async fn redeemable_coupon(
        &self,
        code: &str,
        now: OffsetDateTime,
    ) -> BillingResult<DiscountCoupon> {
        let coupon = self
            .store
            .coupon_by_code(code)
            .await?
            .ok_or_else(|| BillingError::CouponUnavailable(format!("unknown coupon {}", code)))?;
        coupon.ensure_redeemable(now)?;
        Ok(coupon)
    }

    async fn pending_payment(&self, order_id: &str) -> BillingResult<PaymentRecord> {
        self.store
            .payment_by_order(order_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("order {}", order_id)))
    }

    /// Map a charged record to the checkout result
    async fn finish(&self, charged: PaymentRecord) -> BillingResult<CheckoutOutcome> {
        match charged.status {
            PaymentStatus::Paid => self.complete(&charged).await,
            PaymentStatus::Pending => Err(BillingError::GatewayIndeterminate(format!(
                "order {} is awaiting confirmation",
                charged.order_id
            ))),
            _ => {
                let reason = charged
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "UNKNOWN: payment failed".to_string());
                let (code, message) = reason
                    .split_once(": ")
                    .map(|(c, m)| (c.to_string(), m.to_string()))
                    .unwrap_or_else(|| (reason.clone(), reason.clone()));
                Err(BillingError::GatewayDeclined { code, message })
            }
        }
    }

    async fn activate(
        &self,
        payment: &PaymentRecord,
        coupon: Option<&DiscountCoupon>,
        retire_coupon: Option<CouponId>,
    ) -> BillingResult<Subscription> {
        let now = OffsetDateTime::now_utc();
        let plan = self
            .store
            .plan(payment.plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", payment.plan_id)))?;

        let candidate = Subscription::activate_from_payment(payment, &plan, now)?;
        let coupon_application = coupon
            .and_then(|c| {
                // keep the deal the first charge was priced with
                let terms = payment.coupon_terms.unwrap_or_else(|| c.terms());
                CouponApplication::attach(
                    c,
                    terms,
                    candidate.id,
                    candidate.encrypted_credential.is_some(),
                )
            })
            .map(|app| app.consume_cycle())
            .transpose()?;

        let subscription = match self
            .store
            .activate_subscription(SubscriptionActivation {
                subscription: candidate.clone(),
                coupon_application: coupon_application.clone(),
                deactivate_coupon: retire_coupon,
            })
            .await
        {
            Ok(subscription) => subscription,
            Err(e @ BillingError::ActiveSubscriptionExists(_)) => {
                self.payments.report_violation(payment, &e).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if subscription.id != candidate.id {
            // already activated by an earlier call
            return Ok(subscription);
        }

        tracing::info!(
            subscription_id = %subscription.id,
            user_id = %subscription.user_id,
            order_id = %payment.order_id,
            auto_renew = subscription.auto_renew,
            end_date = %subscription.end_date,
            "Subscription activated"
        );

        self.audit
            .emit(
                BillingEventBuilder::new(BillingEventType::SubscriptionActivated)
                    .user(subscription.user_id)
                    .subscription(subscription.id)
                    .order(&payment.order_id)
                    .data(serde_json::json!({
                        "plan_id": subscription.plan_id,
                        "auto_renew": subscription.auto_renew,
                        "end_date": subscription.end_date.unix_timestamp(),
                        "payment_status": payment.status.as_str(),
                    })),
            )
            .await;

        if let Some(app) = coupon_application {
            self.audit
                .emit(
                    BillingEventBuilder::new(BillingEventType::CouponApplied)
                        .user(subscription.user_id)
                        .subscription(subscription.id)
                        .order(&payment.order_id)
                        .data(serde_json::json!({
                            "coupon_id": app.coupon_id,
                            "remaining_months": app.remaining_months,
                            "applied_count": app.applied_count,
                        })),
                )
                .await;
            if !app.is_active {
                self.audit
                    .emit(
                        BillingEventBuilder::new(BillingEventType::CouponExhausted)
                            .user(subscription.user_id)
                            .subscription(subscription.id)
                            .data(serde_json::json!({ "coupon_id": app.coupon_id })),
                    )
                    .await;
            }
        }
        if let Some(coupon_id) = retire_coupon {
            self.coupon_retired(payment, coupon_id).await;
        }

        Ok(subscription)
    }

    async fn coupon_retired(&self, payment: &PaymentRecord, coupon_id: CouponId) {
        self.audit
            .emit(
                BillingEventBuilder::new(BillingEventType::CouponExhausted)
                    .user(payment.user_id)
                    .order(&payment.order_id)
                    .data(serde_json::json!({
                        "coupon_id": coupon_id,
                        "one_time_use": true,
                    })),
            )
            .await;
    }
}
