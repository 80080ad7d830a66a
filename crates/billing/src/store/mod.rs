//! Persistence port for the billing engine
//!
//! Every method is one atomic unit of work. Mutations of payment and
//! subscription rows are conditional on the state the caller last observed;
//! a lost race is reported as `None` or a conflict outcome, never as a blind
//! overwrite.

mod memory;
mod postgres;

pub use memory::MemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use learnhub_shared::{CouponId, PaymentId, PlanId, SubscriptionId, UserId};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::coupon::{CouponApplication, DiscountCoupon};
use crate::error::BillingResult;
use crate::payment::{PaymentRecord, PaymentStatus, PaymentTransition};
use crate::plan::Plan;
use crate::subscription::Subscription;
use crate::webhooks::WebhookEvent;

/// Everything written when a settled INITIAL_SUBSCRIPTION payment becomes an
/// entitlement
#[derive(Debug, Clone)]
pub struct SubscriptionActivation {
    pub subscription: Subscription,
    /// Already consumed for the cycle the originating payment paid for
    pub coupon_application: Option<CouponApplication>,
    /// One-time-use coupon to retire in the same transaction
    pub deactivate_coupon: Option<CouponId>,
}

/// Everything written when a renewal charge settles
#[derive(Debug, Clone)]
pub struct RenewalCommit {
    pub subscription_id: SubscriptionId,
    pub payment_id: PaymentId,
    /// PAID or WAIVED
    pub transition: PaymentTransition,
    /// Cycle the payment was created for; the commit is refused if the
    /// subscription has moved on
    pub expected_next_billing_date: OffsetDateTime,
    pub new_end_date: OffsetDateTime,
    pub billed_at: OffsetDateTime,
    /// Application after consuming this cycle
    pub coupon_application: Option<CouponApplication>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    Committed(Subscription),
    /// The payment was already settled by another path; nothing written
    AlreadyApplied,
    /// The subscription or application changed underneath; nothing written
    Conflict(String),
}

/// Failed renewal bookkeeping
#[derive(Debug, Clone)]
pub struct RenewalFailure {
    pub subscription_id: SubscriptionId,
    pub failure_count: i32,
    pub next_retry_at: Option<OffsetDateTime>,
    /// Retries exhausted: auto-renew is switched off and recurring status
    /// becomes FAILED
    pub exhausted: bool,
}

/// Billing store trait
#[async_trait]
pub trait BillingStore: Send + Sync {
    // Catalog

    async fn plan(&self, id: PlanId) -> BillingResult<Option<Plan>>;

    /// Validate and insert a coupon definition
    async fn insert_coupon(&self, coupon: &DiscountCoupon) -> BillingResult<()>;

    async fn coupon(&self, id: CouponId) -> BillingResult<Option<DiscountCoupon>>;

    async fn coupon_by_code(&self, code: &str) -> BillingResult<Option<DiscountCoupon>>;

    async fn deactivate_coupon(&self, id: CouponId) -> BillingResult<()>;

    // Payments

    /// Insert a PENDING record. A reused order id is `DuplicateOrder`.
    ///
    /// INITIAL_SUBSCRIPTION records are serialized per user with activation:
    /// refused with `ActiveSubscriptionExists` while the user has a live
    /// subscription, and with `CheckoutInProgress` while another subscription
    /// checkout is PENDING or settled but not yet activated.
    async fn insert_payment(&self, payment: &PaymentRecord) -> BillingResult<()>;

    async fn payment(&self, id: PaymentId) -> BillingResult<Option<PaymentRecord>>;

    async fn payment_by_order(&self, order_id: &str) -> BillingResult<Option<PaymentRecord>>;

    /// Apply `transition` only if the record is still in `from`
    async fn transition_payment(
        &self,
        id: PaymentId,
        from: PaymentStatus,
        transition: &PaymentTransition,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PaymentRecord>>;

    /// Store an encrypted billing key on a PENDING record
    async fn attach_payment_credential(
        &self,
        id: PaymentId,
        envelope: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PaymentRecord>>;

    /// Oldest unresolved RECURRING payment for a subscription
    async fn pending_renewal_payment(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Option<PaymentRecord>>;

    // Subscriptions

    /// Create the subscription, serialized per user.
    ///
    /// Idempotent on the originating payment. Rejected with
    /// `ActiveSubscriptionExists` when the user already has an ACTIVE
    /// subscription whose period has not ended; stale ACTIVE rows are expired
    /// first.
    async fn activate_subscription(
        &self,
        activation: SubscriptionActivation,
    ) -> BillingResult<Subscription>;

    async fn subscription(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>>;

    /// ACTIVE subscription with `end_date > now`, if any
    async fn live_subscription(
        &self,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>>;

    async fn coupon_application(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Option<CouponApplication>>;

    /// ACTIVE, auto-renewing, `next_billing_date <= now`, not backing off
    async fn due_subscriptions(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>>;

    /// ACTIVE past `end_date` with nothing left to retry, or past
    /// `end_date + grace` regardless
    async fn lapsed_subscriptions(
        &self,
        now: OffsetDateTime,
        grace: time::Duration,
    ) -> BillingResult<Vec<Subscription>>;

    /// Take exclusive ownership of a subscription's renewal. `None` when
    /// another worker holds an unexpired claim or the row is no longer ACTIVE.
    async fn claim_renewal(
        &self,
        id: SubscriptionId,
        now: OffsetDateTime,
        lease: time::Duration,
    ) -> BillingResult<Option<Subscription>>;

    async fn release_renewal(&self, id: SubscriptionId) -> BillingResult<()>;

    /// Settle a renewal payment, advance the subscription and consume the
    /// coupon cycle together
    async fn commit_renewal(&self, commit: RenewalCommit) -> BillingResult<RenewalOutcome>;

    async fn record_renewal_failure(&self, failure: RenewalFailure) -> BillingResult<()>;

    /// ACTIVE -> EXPIRED; deactivates the coupon application
    async fn expire_subscription(
        &self,
        id: SubscriptionId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>>;

    /// ACTIVE -> CANCELLED keeping `end_date`; deactivates the coupon application
    async fn cancel_subscription(
        &self,
        id: SubscriptionId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>>;

    // Webhook queue

    /// Insert the event unless its external id was seen before. Returns the
    /// stored row and whether this call inserted it.
    async fn record_webhook_event(
        &self,
        external_event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        now: OffsetDateTime,
    ) -> BillingResult<(WebhookEvent, bool)>;

    async fn webhook_event(&self, external_event_id: &str) -> BillingResult<Option<WebhookEvent>>;

    async fn mark_webhook_processed(&self, id: Uuid, now: OffsetDateTime) -> BillingResult<()>;

    async fn record_webhook_failure(&self, id: Uuid, error: &str) -> BillingResult<()>;

    /// Unprocessed events received at or after `since`, oldest first
    async fn unprocessed_webhook_events(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEvent>>;

    /// Delete events received before `before`. Returns rows removed.
    async fn purge_webhook_events(&self, before: OffsetDateTime) -> BillingResult<u64>;
}
