//! Subscription lifecycle
//!
//! `(none) -> ACTIVE -> {EXPIRED, CANCELLED}`. A subscription is created from
//! the first settled INITIAL_SUBSCRIPTION payment, extended by each successful
//! renewal, and never has its paid period shortened.

use learnhub_shared::{Currency, PaymentId, PlanId, SubscriptionId, UserId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::SettlementPolicy;
use crate::error::{BillingError, BillingResult};
use crate::payment::{PaymentKind, PaymentRecord};
use crate::plan::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "EXPIRED" => Ok(Self::Expired),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(BillingError::Internal(format!("Unknown subscription status: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecurringStatus {
    Inactive,
    Active,
    Paused,
    Failed,
}

impl RecurringStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "INACTIVE",
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for RecurringStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INACTIVE" => Ok(Self::Inactive),
            "ACTIVE" => Ok(Self::Active),
            "PAUSED" => Ok(Self::Paused),
            "FAILED" => Ok(Self::Failed),
            _ => Err(BillingError::Internal(format!("Unknown recurring status: {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub originating_payment_id: PaymentId,
    pub status: SubscriptionStatus,
    pub start_date: OffsetDateTime,
    pub end_date: OffsetDateTime,
    pub auto_renew: bool,
    pub recurring_status: RecurringStatus,
    /// Meaningful only while `auto_renew` is set
    pub next_billing_date: Option<OffsetDateTime>,
    pub last_billing_date: Option<OffsetDateTime>,
    #[serde(skip_serializing, default)]
    pub encrypted_credential: Option<String>,
    pub customer_key: String,
    pub currency: Currency,
    pub is_trial_period: bool,
    /// Consecutive failed renewal attempts for the current cycle
    pub failure_count: i32,
    pub next_retry_at: Option<OffsetDateTime>,
    /// Set while a settlement worker owns the renewal of this row
    pub renewal_claimed_at: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Build the entitlement bought by a settled INITIAL_SUBSCRIPTION payment.
    ///
    /// The subscription renews on its own only when the payment carries a
    /// stored billing key.
    pub fn activate_from_payment(
        payment: &PaymentRecord,
        plan: &Plan,
        now: OffsetDateTime,
    ) -> BillingResult<Self> {
        if !payment.status.is_settled() {
            return Err(BillingError::InvalidInput(format!(
                "payment {} is {}, not PAID or WAIVED",
                payment.order_id, payment.status
            )));
        }
        if payment.payment_kind != PaymentKind::InitialSubscription {
            return Err(BillingError::InvalidInput(format!(
                "payment {} is {}, not INITIAL_SUBSCRIPTION",
                payment.order_id,
                payment.payment_kind.as_str()
            )));
        }
        if payment.plan_id != plan.id {
            return Err(BillingError::InvalidInput(format!(
                "payment {} is for a different plan",
                payment.order_id
            )));
        }

        let start_date = now;
        let end_date = start_date + plan.duration();
        let can_renew = payment.encrypted_credential.is_some();

        Ok(Self {
            id: SubscriptionId::new(),
            user_id: payment.user_id,
            plan_id: plan.id,
            originating_payment_id: payment.id,
            status: SubscriptionStatus::Active,
            start_date,
            end_date,
            auto_renew: can_renew,
            recurring_status: if can_renew {
                RecurringStatus::Active
            } else {
                RecurringStatus::Inactive
            },
            next_billing_date: can_renew.then_some(end_date),
            last_billing_date: Some(now),
            encrypted_credential: payment.encrypted_credential.clone(),
            customer_key: payment.user_id.customer_key(),
            currency: payment.currency,
            is_trial_period: payment.final_amount == 0 && payment.applied_coupon_id.is_some(),
            failure_count: 0,
            next_retry_at: None,
            renewal_claimed_at: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Entitled right now. Cancelled subscribers keep the already-paid period.
    pub fn has_access(&self, now: OffsetDateTime) -> bool {
        matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Cancelled
        ) && self.end_date > now
    }

    /// Holds a credential and is configured to renew without the user
    pub fn renews_automatically(&self) -> bool {
        self.status == SubscriptionStatus::Active
            && self.auto_renew
            && self.recurring_status == RecurringStatus::Active
            && self.encrypted_credential.is_some()
    }

    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.renews_automatically()
            && matches!(self.next_billing_date, Some(due) if due <= now)
            && !matches!(self.next_retry_at, Some(retry) if retry > now)
    }

    /// ACTIVE but past its paid period with no renewal left to try, or
    /// still unrenewed once `grace` has also run out
    pub fn is_lapsed(&self, now: OffsetDateTime, grace: time::Duration) -> bool {
        self.status == SubscriptionStatus::Active
            && self.end_date <= now
            && (!self.auto_renew
                || self.recurring_status == RecurringStatus::Failed
                || self.end_date + grace <= now)
    }

    /// Advance by one plan period anchored on the previous `end_date`
    pub fn renewed(&self, plan: &Plan, now: OffsetDateTime) -> Self {
        let end_date = self.end_date + plan.duration();
        Self {
            end_date,
            last_billing_date: Some(now),
            next_billing_date: Some(end_date),
            recurring_status: RecurringStatus::Active,
            is_trial_period: false,
            failure_count: 0,
            next_retry_at: None,
            renewal_claimed_at: None,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Record a failed renewal. Returns the updated row and whether retries
    /// are exhausted.
    pub fn with_renewal_failure(&self, policy: &SettlementPolicy, now: OffsetDateTime) -> (Self, bool) {
        let failure_count = self.failure_count + 1;
        let exhausted = failure_count >= policy.max_consecutive_failures;
        let updated = Self {
            failure_count,
            next_retry_at: (!exhausted).then(|| now + policy.retry_backoff),
            auto_renew: self.auto_renew && !exhausted,
            recurring_status: if exhausted {
                RecurringStatus::Failed
            } else {
                self.recurring_status
            },
            renewal_claimed_at: None,
            updated_at: now,
            ..self.clone()
        };
        (updated, exhausted)
    }

    pub fn cancelled(&self, now: OffsetDateTime) -> BillingResult<Self> {
        if self.status != SubscriptionStatus::Active {
            return Err(BillingError::InvalidInput(format!(
                "subscription {} is {}, only ACTIVE subscriptions can be cancelled",
                self.id, self.status
            )));
        }
        Ok(Self {
            status: SubscriptionStatus::Cancelled,
            auto_renew: false,
            recurring_status: RecurringStatus::Inactive,
            next_retry_at: None,
            cancelled_at: Some(now),
            updated_at: now,
            ..self.clone()
        })
    }

    pub fn expired(&self, now: OffsetDateTime) -> BillingResult<Self> {
        if self.status != SubscriptionStatus::Active {
            return Err(BillingError::InvalidInput(format!(
                "subscription {} is {}, only ACTIVE subscriptions can expire",
                self.id, self.status
            )));
        }
        Ok(Self {
            status: SubscriptionStatus::Expired,
            auto_renew: false,
            next_retry_at: None,
            renewal_claimed_at: None,
            updated_at: now,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::{NewPayment, PaymentStatus};
    use time::macros::datetime;

    fn plan() -> Plan {
        Plan {
            id: PlanId::new(),
            name: "Monthly".to_string(),
            price_krw: 9_900,
            price_usd: 799,
            duration_days: 30,
            active: true,
        }
    }

    fn settled_payment(plan: &Plan, credential: Option<&str>) -> PaymentRecord {
        let mut payment = PaymentRecord::new_pending(
            NewPayment {
                user_id: UserId::new(),
                plan_id: plan.id,
                subscription_id: None,
                order_id: "order-1".to_string(),
                original_amount: 9_900,
                discount_amount: 0,
                currency: Currency::Krw,
                kind: PaymentKind::InitialSubscription,
                applied_coupon_id: None,
                coupon_terms: None,
                billing_cycle_due: None,
                attempt_number: 1,
            },
            datetime!(2025-01-01 00:00 UTC),
        )
        .unwrap();
        payment.status = PaymentStatus::Paid;
        payment.encrypted_credential = credential.map(str::to_string);
        payment
    }

    #[test]
    fn test_activation_with_credential_renews() {
        let plan = plan();
        let now = datetime!(2025-01-01 00:00 UTC);
        let payment = settled_payment(&plan, Some("envelope"));

        let sub = Subscription::activate_from_payment(&payment, &plan, now).unwrap();
        assert_eq!(sub.originating_payment_id, payment.id);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.end_date, datetime!(2025-01-31 00:00 UTC));
        assert!(sub.auto_renew);
        assert_eq!(sub.recurring_status, RecurringStatus::Active);
        assert_eq!(sub.next_billing_date, Some(sub.end_date));
        assert!(sub.renews_automatically());
    }

    #[test]
    fn test_activation_without_credential_is_one_off() {
        let plan = plan();
        let now = datetime!(2025-01-01 00:00 UTC);
        let sub =
            Subscription::activate_from_payment(&settled_payment(&plan, None), &plan, now).unwrap();
        assert!(!sub.auto_renew);
        assert_eq!(sub.recurring_status, RecurringStatus::Inactive);
        assert_eq!(sub.next_billing_date, None);
        assert!(!sub.is_due(sub.end_date));
    }

    #[test]
    fn test_activation_requires_settled_initial_payment() {
        let plan = plan();
        let now = datetime!(2025-01-01 00:00 UTC);

        let mut pending = settled_payment(&plan, None);
        pending.status = PaymentStatus::Pending;
        assert!(Subscription::activate_from_payment(&pending, &plan, now).is_err());

        let mut one_time = settled_payment(&plan, None);
        one_time.payment_kind = PaymentKind::OneTime;
        assert!(Subscription::activate_from_payment(&one_time, &plan, now).is_err());
    }

    #[test]
    fn test_renewal_anchors_on_previous_end_date() {
        let plan = plan();
        let start = datetime!(2025-01-01 00:00 UTC);
        let sub =
            Subscription::activate_from_payment(&settled_payment(&plan, Some("e")), &plan, start)
                .unwrap();

        // settlement runs two days late
        let late = datetime!(2025-02-02 03:00 UTC);
        let renewed = sub.renewed(&plan, late);
        assert_eq!(renewed.end_date, datetime!(2025-03-02 00:00 UTC));
        assert!(renewed.end_date >= sub.end_date);
        assert_eq!(renewed.last_billing_date, Some(late));
        assert_eq!(renewed.next_billing_date, Some(renewed.end_date));
        assert_eq!(renewed.failure_count, 0);
    }

    #[test]
    fn test_failures_back_off_then_exhaust() {
        let plan = plan();
        let now = datetime!(2025-01-31 03:00 UTC);
        let sub =
            Subscription::activate_from_payment(&settled_payment(&plan, Some("e")), &plan, now)
                .unwrap();
        let policy = SettlementPolicy {
            max_consecutive_failures: 2,
            ..SettlementPolicy::default()
        };

        let (first, exhausted) = sub.with_renewal_failure(&policy, now);
        assert!(!exhausted);
        assert_eq!(first.failure_count, 1);
        assert_eq!(first.next_retry_at, Some(now + policy.retry_backoff));
        assert!(first.auto_renew);

        let (second, exhausted) = first.with_renewal_failure(&policy, now);
        assert!(exhausted);
        assert!(!second.auto_renew);
        assert_eq!(second.recurring_status, RecurringStatus::Failed);
        assert!(second.is_lapsed(second.end_date, policy.lapse_grace));
    }

    #[test]
    fn test_unrenewed_subscription_lapses_after_grace() {
        let plan = plan();
        let now = datetime!(2025-01-01 00:00 UTC);
        let sub =
            Subscription::activate_from_payment(&settled_payment(&plan, Some("e")), &plan, now)
                .unwrap();
        let grace = time::Duration::days(3);

        assert!(sub.renews_automatically());
        assert!(!sub.is_lapsed(sub.end_date, grace));
        assert!(!sub.is_lapsed(sub.end_date + time::Duration::days(2), grace));
        assert!(sub.is_lapsed(sub.end_date + grace, grace));
    }

    #[test]
    fn test_cancel_keeps_paid_period() {
        let plan = plan();
        let now = datetime!(2025-01-10 00:00 UTC);
        let sub =
            Subscription::activate_from_payment(&settled_payment(&plan, Some("e")), &plan, now)
                .unwrap();

        let cancelled = sub.cancelled(now).unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert!(!cancelled.auto_renew);
        assert_eq!(cancelled.recurring_status, RecurringStatus::Inactive);
        assert_eq!(cancelled.end_date, sub.end_date);
        assert!(cancelled.has_access(now));
        assert!(!cancelled.has_access(sub.end_date));

        assert!(cancelled.cancelled(now).is_err());
        assert!(cancelled.expired(now).is_err());
    }
}
