//! In-process store with the same conditional-write semantics as Postgres.
//! One mutex guards all tables, so every method is trivially atomic.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use learnhub_shared::{CouponId, PaymentId, PlanId, SubscriptionId, UserId};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    BillingStore, RenewalCommit, RenewalFailure, RenewalOutcome, SubscriptionActivation,
};
use crate::coupon::{CouponApplication, DiscountCoupon};
use crate::error::{BillingError, BillingResult};
use crate::payment::{PaymentKind, PaymentRecord, PaymentStatus, PaymentTransition};
use crate::plan::Plan;
use crate::subscription::{RecurringStatus, Subscription, SubscriptionStatus};
use crate::webhooks::WebhookEvent;

#[derive(Default)]
struct MemoryState {
    plans: HashMap<PlanId, Plan>,
    coupons: HashMap<CouponId, DiscountCoupon>,
    payments: HashMap<PaymentId, PaymentRecord>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    coupon_applications: HashMap<SubscriptionId, CouponApplication>,
    webhook_events: HashMap<String, WebhookEvent>,
}

impl MemoryState {
    fn deactivate_application(&mut self, subscription_id: SubscriptionId) {
        if let Some(app) = self.coupon_applications.get_mut(&subscription_id) {
            app.is_active = false;
        }
    }
}

#[derive(Default)]
pub struct MemoryBillingStore {
    state: Mutex<MemoryState>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> BillingResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| BillingError::Internal("billing store lock poisoned".to_string()))
    }

    pub fn insert_plan(&self, plan: Plan) -> BillingResult<()> {
        self.lock()?.plans.insert(plan.id, plan);
        Ok(())
    }

    /// Catalog edit of an existing coupon
    pub fn update_coupon(&self, coupon: DiscountCoupon) -> BillingResult<()> {
        coupon.validate()?;
        let mut state = self.lock()?;
        if !state.coupons.contains_key(&coupon.id) {
            return Err(BillingError::NotFound(format!("coupon {}", coupon.id)));
        }
        state.coupons.insert(coupon.id, coupon);
        Ok(())
    }

    /// Overwrite a subscription row as-is
    pub fn replace_subscription(&self, subscription: Subscription) -> BillingResult<()> {
        self.lock()?
            .subscriptions
            .insert(subscription.id, subscription);
        Ok(())
    }

    pub fn payments_for_user(&self, user_id: UserId) -> BillingResult<Vec<PaymentRecord>> {
        let mut payments: Vec<_> = self
            .lock()?
            .payments
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    pub fn subscriptions_for_user(&self, user_id: UserId) -> BillingResult<Vec<Subscription>> {
        Ok(self
            .lock()?
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn plan(&self, id: PlanId) -> BillingResult<Option<Plan>> {
        Ok(self.lock()?.plans.get(&id).cloned())
    }

    async fn insert_coupon(&self, coupon: &DiscountCoupon) -> BillingResult<()> {
        coupon.validate()?;
        let mut state = self.lock()?;
        if state.coupons.values().any(|c| c.code == coupon.code) {
            return Err(BillingError::InvalidCoupon(format!(
                "code {} already exists",
                coupon.code
            )));
        }
        state.coupons.insert(coupon.id, coupon.clone());
        Ok(())
    }

    async fn coupon(&self, id: CouponId) -> BillingResult<Option<DiscountCoupon>> {
        Ok(self.lock()?.coupons.get(&id).cloned())
    }

    async fn coupon_by_code(&self, code: &str) -> BillingResult<Option<DiscountCoupon>> {
        Ok(self
            .lock()?
            .coupons
            .values()
            .find(|c| c.code == code)
            .cloned())
    }

    async fn deactivate_coupon(&self, id: CouponId) -> BillingResult<()> {
        if let Some(coupon) = self.lock()?.coupons.get_mut(&id) {
            coupon.active = false;
        }
        Ok(())
    }

    async fn insert_payment(&self, payment: &PaymentRecord) -> BillingResult<()> {
        let mut state = self.lock()?;
        if state
            .payments
            .values()
            .any(|p| p.order_id == payment.order_id)
        {
            return Err(BillingError::DuplicateOrder(payment.order_id.clone()));
        }
        if payment.payment_kind == PaymentKind::InitialSubscription {
            if state.subscriptions.values().any(|s| {
                s.user_id == payment.user_id
                    && s.status == SubscriptionStatus::Active
                    && s.end_date > payment.created_at
            }) {
                return Err(BillingError::ActiveSubscriptionExists(payment.user_id.to_string()));
            }
            if let Some(open) = state.payments.values().find(|p| {
                p.user_id == payment.user_id
                    && p.payment_kind == PaymentKind::InitialSubscription
                    && (p.status == PaymentStatus::Pending
                        || (p.status.is_settled()
                            && !state
                                .subscriptions
                                .values()
                                .any(|s| s.originating_payment_id == p.id)))
            }) {
                return Err(BillingError::CheckoutInProgress(open.order_id.clone()));
            }
        }
        state.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn payment(&self, id: PaymentId) -> BillingResult<Option<PaymentRecord>> {
        Ok(self.lock()?.payments.get(&id).cloned())
    }

    async fn payment_by_order(&self, order_id: &str) -> BillingResult<Option<PaymentRecord>> {
        Ok(self
            .lock()?
            .payments
            .values()
            .find(|p| p.order_id == order_id)
            .cloned())
    }

    async fn transition_payment(
        &self,
        id: PaymentId,
        from: PaymentStatus,
        transition: &PaymentTransition,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PaymentRecord>> {
        let mut state = self.lock()?;
        let Some(current) = state.payments.get_mut(&id) else {
            return Ok(None);
        };
        if current.status != from {
            return Ok(None);
        }
        let next = current.apply(transition, now)?;
        *current = next.clone();
        Ok(Some(next))
    }

    async fn attach_payment_credential(
        &self,
        id: PaymentId,
        envelope: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PaymentRecord>> {
        let mut state = self.lock()?;
        match state.payments.get_mut(&id) {
            Some(payment) if payment.status == PaymentStatus::Pending => {
                payment.encrypted_credential = Some(envelope.to_string());
                payment.updated_at = now;
                Ok(Some(payment.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn pending_renewal_payment(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Option<PaymentRecord>> {
        Ok(self
            .lock()?
            .payments
            .values()
            .filter(|p| {
                p.subscription_id == Some(subscription_id)
                    && p.payment_kind == PaymentKind::Recurring
                    && p.status == PaymentStatus::Pending
            })
            .min_by_key(|p| p.created_at)
            .cloned())
    }

    async fn activate_subscription(
        &self,
        activation: SubscriptionActivation,
    ) -> BillingResult<Subscription> {
        let mut state = self.lock()?;
        let sub = activation.subscription;
        let now = sub.created_at;

        if let Some(existing) = state
            .subscriptions
            .values()
            .find(|s| s.originating_payment_id == sub.originating_payment_id)
        {
            return Ok(existing.clone());
        }

        let payment = state
            .payments
            .get(&sub.originating_payment_id)
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", sub.originating_payment_id)))?;
        if !payment.status.is_settled() {
            return Err(BillingError::InvalidInput(format!(
                "payment {} is {}",
                payment.order_id, payment.status
            )));
        }

        let active: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.user_id == sub.user_id && s.status == SubscriptionStatus::Active)
            .cloned()
            .collect();
        if active.iter().any(|s| s.end_date > now) {
            return Err(BillingError::ActiveSubscriptionExists(sub.user_id.to_string()));
        }
        for stale in active {
            let expired = stale.expired(now)?;
            state.subscriptions.insert(expired.id, expired);
            state.deactivate_application(stale.id);
        }

        if let Some(payment) = state.payments.get_mut(&sub.originating_payment_id) {
            payment.subscription_id = Some(sub.id);
            payment.updated_at = now;
        }
        if let Some(app) = activation.coupon_application {
            state.coupon_applications.insert(sub.id, app);
        }
        if let Some(coupon_id) = activation.deactivate_coupon {
            if let Some(coupon) = state.coupons.get_mut(&coupon_id) {
                coupon.active = false;
            }
        }
        state.subscriptions.insert(sub.id, sub.clone());

        Ok(sub)
    }

    async fn subscription(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>> {
        Ok(self.lock()?.subscriptions.get(&id).cloned())
    }

    async fn live_subscription(
        &self,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .lock()?
            .subscriptions
            .values()
            .find(|s| {
                s.user_id == user_id && s.status == SubscriptionStatus::Active && s.end_date > now
            })
            .cloned())
    }

    async fn coupon_application(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Option<CouponApplication>> {
        Ok(self
            .lock()?
            .coupon_applications
            .get(&subscription_id)
            .cloned())
    }

    async fn due_subscriptions(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        let mut due: Vec<_> = self
            .lock()?
            .subscriptions
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_billing_date);
        Ok(due)
    }

    async fn lapsed_subscriptions(
        &self,
        now: OffsetDateTime,
        grace: time::Duration,
    ) -> BillingResult<Vec<Subscription>> {
        Ok(self
            .lock()?
            .subscriptions
            .values()
            .filter(|s| s.is_lapsed(now, grace))
            .cloned()
            .collect())
    }

    async fn claim_renewal(
        &self,
        id: SubscriptionId,
        now: OffsetDateTime,
        lease: time::Duration,
    ) -> BillingResult<Option<Subscription>> {
        let mut state = self.lock()?;
        let Some(sub) = state.subscriptions.get_mut(&id) else {
            return Ok(None);
        };
        if sub.status != SubscriptionStatus::Active {
            return Ok(None);
        }
        if matches!(sub.renewal_claimed_at, Some(claimed) if claimed + lease > now) {
            return Ok(None);
        }
        sub.renewal_claimed_at = Some(now);
        Ok(Some(sub.clone()))
    }

    async fn release_renewal(&self, id: SubscriptionId) -> BillingResult<()> {
        if let Some(sub) = self.lock()?.subscriptions.get_mut(&id) {
            sub.renewal_claimed_at = None;
        }
        Ok(())
    }

    async fn commit_renewal(&self, commit: RenewalCommit) -> BillingResult<RenewalOutcome> {
        let mut state = self.lock()?;

        let payment = state
            .payments
            .get(&commit.payment_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", commit.payment_id)))?;
        if payment.status.is_settled() {
            return Ok(RenewalOutcome::AlreadyApplied);
        }
        if payment.status != PaymentStatus::Pending {
            return Ok(RenewalOutcome::Conflict(format!(
                "payment {} is {}",
                payment.order_id, payment.status
            )));
        }

        let sub = state
            .subscriptions
            .get(&commit.subscription_id)
            .cloned()
            .ok_or_else(|| {
                BillingError::NotFound(format!("subscription {}", commit.subscription_id))
            })?;
        if sub.next_billing_date != Some(commit.expected_next_billing_date) {
            return Ok(RenewalOutcome::Conflict(format!(
                "subscription {} already moved past cycle {}",
                sub.id, commit.expected_next_billing_date
            )));
        }

        if let Some(ref next_app) = commit.coupon_application {
            let current = state.coupon_applications.get(&commit.subscription_id);
            let in_step = matches!(
                current,
                Some(app) if app.is_active && app.applied_count + 1 == next_app.applied_count
            );
            if !in_step {
                return Ok(RenewalOutcome::Conflict(format!(
                    "coupon application for subscription {} changed",
                    sub.id
                )));
            }
        }

        let settled = payment.apply(&commit.transition, commit.billed_at)?;

        let mut renewed = sub;
        renewed.end_date = commit.new_end_date;
        renewed.last_billing_date = Some(commit.billed_at);
        renewed.next_billing_date = Some(commit.new_end_date);
        renewed.failure_count = 0;
        renewed.next_retry_at = None;
        renewed.renewal_claimed_at = None;
        renewed.is_trial_period = false;
        if renewed.status == SubscriptionStatus::Active && renewed.auto_renew {
            renewed.recurring_status = RecurringStatus::Active;
        }
        renewed.updated_at = commit.billed_at;

        state.payments.insert(settled.id, settled);
        if let Some(app) = commit.coupon_application {
            state.coupon_applications.insert(commit.subscription_id, app);
        }
        state.subscriptions.insert(renewed.id, renewed.clone());

        Ok(RenewalOutcome::Committed(renewed))
    }

    async fn record_renewal_failure(&self, failure: RenewalFailure) -> BillingResult<()> {
        let mut state = self.lock()?;
        let sub = state
            .subscriptions
            .get_mut(&failure.subscription_id)
            .ok_or_else(|| {
                BillingError::NotFound(format!("subscription {}", failure.subscription_id))
            })?;
        sub.failure_count = failure.failure_count;
        sub.next_retry_at = failure.next_retry_at;
        sub.renewal_claimed_at = None;
        if failure.exhausted {
            sub.auto_renew = false;
            sub.recurring_status = RecurringStatus::Failed;
        }
        Ok(())
    }

    async fn expire_subscription(
        &self,
        id: SubscriptionId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let mut state = self.lock()?;
        let expired = match state.subscriptions.get(&id) {
            Some(sub) if sub.status == SubscriptionStatus::Active => sub.expired(now)?,
            _ => return Ok(None),
        };
        state.subscriptions.insert(id, expired.clone());
        state.deactivate_application(id);
        Ok(Some(expired))
    }

    async fn cancel_subscription(
        &self,
        id: SubscriptionId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let mut state = self.lock()?;
        let cancelled = match state.subscriptions.get(&id) {
            Some(sub) if sub.status == SubscriptionStatus::Active => sub.cancelled(now)?,
            _ => return Ok(None),
        };
        state.subscriptions.insert(id, cancelled.clone());
        state.deactivate_application(id);
        Ok(Some(cancelled))
    }

    async fn record_webhook_event(
        &self,
        external_event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        now: OffsetDateTime,
    ) -> BillingResult<(WebhookEvent, bool)> {
        let mut state = self.lock()?;
        if let Some(existing) = state.webhook_events.get(external_event_id) {
            return Ok((existing.clone(), false));
        }
        let event = WebhookEvent {
            id: Uuid::new_v4(),
            external_event_id: external_event_id.to_string(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
            processed: false,
            attempts: 0,
            last_error: None,
            received_at: now,
            processed_at: None,
        };
        state
            .webhook_events
            .insert(external_event_id.to_string(), event.clone());
        Ok((event, true))
    }

    async fn webhook_event(&self, external_event_id: &str) -> BillingResult<Option<WebhookEvent>> {
        Ok(self.lock()?.webhook_events.get(external_event_id).cloned())
    }

    async fn mark_webhook_processed(&self, id: Uuid, now: OffsetDateTime) -> BillingResult<()> {
        let mut state = self.lock()?;
        if let Some(event) = state.webhook_events.values_mut().find(|e| e.id == id) {
            event.processed = true;
            event.processed_at = Some(now);
            event.attempts += 1;
        }
        Ok(())
    }

    async fn record_webhook_failure(&self, id: Uuid, error: &str) -> BillingResult<()> {
        let mut state = self.lock()?;
        if let Some(event) = state.webhook_events.values_mut().find(|e| e.id == id) {
            event.attempts += 1;
            event.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn unprocessed_webhook_events(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEvent>> {
        let mut events: Vec<_> = self
            .lock()?
            .webhook_events
            .values()
            .filter(|e| !e.processed && e.received_at >= since)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.received_at);
        events.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(events)
    }

    async fn purge_webhook_events(&self, before: OffsetDateTime) -> BillingResult<u64> {
        let mut state = self.lock()?;
        let prior = state.webhook_events.len();
        state.webhook_events.retain(|_, e| e.received_at >= before);
        Ok((prior - state.webhook_events.len()) as u64)
    }
}
