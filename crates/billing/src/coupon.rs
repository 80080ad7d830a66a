//! Discount coupons and recurring coupon applications
//!
//! A coupon is a catalog definition. When a recurring coupon is used on a
//! subscription that can renew on its own, its discount terms are snapshotted
//! into a [`CouponApplication`] so later catalog edits never change an
//! existing subscriber's deal.

use learnhub_shared::{CouponId, Currency, SubscriptionId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecurringType {
    OneTime,
    Recurring,
}

impl RecurringType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneTime => "ONE_TIME",
            Self::Recurring => "RECURRING",
        }
    }
}

impl std::str::FromStr for RecurringType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONE_TIME" => Ok(Self::OneTime),
            "RECURRING" => Ok(Self::Recurring),
            _ => Err(BillingError::Internal(format!("Unknown recurring type: {}", s))),
        }
    }
}

/// Discount values applied to one billing cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountTerms {
    /// Whole percent, 0..=100
    pub percent: i32,
    pub flat_krw: i64,
    pub flat_usd: i64,
}

impl DiscountTerms {
    pub fn flat_for(&self, currency: Currency) -> i64 {
        match currency {
            Currency::Krw => self.flat_krw,
            Currency::Usd => self.flat_usd,
        }
    }

    /// Discount for `original_amount`: percent first, then flat, clamped to
    /// `[0, original_amount]`.
    pub fn quote(&self, original_amount: i64, currency: Currency) -> BillingResult<i64> {
        if original_amount < 0 {
            return Err(BillingError::InvalidAmount(format!(
                "original amount must not be negative: {}",
                original_amount
            )));
        }

        let percent_off = i128::from(original_amount) * i128::from(self.percent) / 100;
        let total = percent_off + i128::from(self.flat_for(currency));
        let clamped = total.clamp(0, i128::from(original_amount));

        i64::try_from(clamped)
            .map_err(|_| BillingError::InvalidAmount("discount out of range".to_string()))
    }
}

/// Catalog coupon definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountCoupon {
    pub id: CouponId,
    pub code: String,
    pub discount_percent: i32,
    pub flat_discount_krw: i64,
    pub flat_discount_usd: i64,
    pub recurring_type: RecurringType,
    pub recurring_months: Option<i32>,
    pub max_recurring_uses: Option<i32>,
    pub one_time_use_only: bool,
    pub active: bool,
    pub expires_at: Option<OffsetDateTime>,
}

impl DiscountCoupon {
    /// Reject malformed configuration at creation time so charges never see it
    pub fn validate(&self) -> BillingResult<()> {
        if self.code.trim().is_empty() {
            return Err(BillingError::InvalidCoupon("code must not be empty".to_string()));
        }
        if !(0..=100).contains(&self.discount_percent) {
            return Err(BillingError::InvalidCoupon(format!(
                "discount percent must be within 0..=100, got {}",
                self.discount_percent
            )));
        }
        if self.flat_discount_krw < 0 || self.flat_discount_usd < 0 {
            return Err(BillingError::InvalidCoupon(
                "flat discounts must not be negative".to_string(),
            ));
        }
        if self.discount_percent == 0 && self.flat_discount_krw == 0 && self.flat_discount_usd == 0
        {
            return Err(BillingError::InvalidCoupon(
                "coupon must discount something".to_string(),
            ));
        }
        if matches!(self.recurring_months, Some(m) if m <= 0) {
            return Err(BillingError::InvalidCoupon(
                "recurring months must be positive".to_string(),
            ));
        }
        if matches!(self.max_recurring_uses, Some(m) if m <= 0) {
            return Err(BillingError::InvalidCoupon(
                "max recurring uses must be positive".to_string(),
            ));
        }
        if self.recurring_type == RecurringType::OneTime
            && (self.recurring_months.is_some() || self.max_recurring_uses.is_some())
        {
            return Err(BillingError::InvalidCoupon(
                "one-time coupons cannot carry recurring caps".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the coupon may be redeemed at checkout right now
    pub fn ensure_redeemable(&self, now: OffsetDateTime) -> BillingResult<()> {
        if !self.active {
            return Err(BillingError::CouponUnavailable(format!(
                "coupon {} is no longer active",
                self.code
            )));
        }
        if matches!(self.expires_at, Some(expiry) if expiry <= now) {
            return Err(BillingError::CouponUnavailable(format!(
                "coupon {} has expired",
                self.code
            )));
        }
        Ok(())
    }

    pub fn terms(&self) -> DiscountTerms {
        DiscountTerms {
            percent: self.discount_percent,
            flat_krw: self.flat_discount_krw,
            flat_usd: self.flat_discount_usd,
        }
    }

    pub fn quote(&self, original_amount: i64, currency: Currency) -> BillingResult<i64> {
        self.terms().quote(original_amount, currency)
    }
}

/// A recurring coupon bound to one subscription's future cycles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponApplication {
    pub id: Uuid,
    pub subscription_id: SubscriptionId,
    pub coupon_id: CouponId,
    pub remaining_months: Option<i32>,
    pub applied_count: i32,
    pub max_uses: Option<i32>,
    pub is_active: bool,
    /// Snapshot taken at attachment time
    pub terms: DiscountTerms,
}

impl CouponApplication {
    /// Bind `coupon` to a subscription with the `terms` its first charge was
    /// quoted from.
    ///
    /// Returns `None` for one-time coupons and for subscriptions that cannot
    /// renew on their own (no usable charge credential).
    pub fn attach(
        coupon: &DiscountCoupon,
        terms: DiscountTerms,
        subscription_id: SubscriptionId,
        has_usable_credential: bool,
    ) -> Option<Self> {
        if coupon.recurring_type != RecurringType::Recurring || !has_usable_credential {
            return None;
        }

        Some(Self {
            id: Uuid::new_v4(),
            subscription_id,
            coupon_id: coupon.id,
            remaining_months: coupon.recurring_months,
            applied_count: 0,
            max_uses: coupon.max_recurring_uses,
            is_active: true,
            terms,
        })
    }

    /// Record one successfully billed cycle.
    ///
    /// Must be persisted in the same unit of work as the payment that paid
    /// for the cycle.
    pub fn consume_cycle(&self) -> BillingResult<Self> {
        if !self.is_active {
            return Err(BillingError::InvalidInput(format!(
                "coupon application {} is no longer active",
                self.id
            )));
        }

        let applied_count = self.applied_count + 1;
        let remaining_months = self.remaining_months.map(|m| (m - 1).max(0));
        let months_exhausted = remaining_months == Some(0);
        let uses_exhausted = matches!(self.max_uses, Some(max) if applied_count >= max);

        Ok(Self {
            applied_count,
            remaining_months,
            is_active: !(months_exhausted || uses_exhausted),
            ..self.clone()
        })
    }

    pub fn deactivated(&self) -> Self {
        Self {
            is_active: false,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coupon(percent: i32, flat_krw: i64) -> DiscountCoupon {
        DiscountCoupon {
            id: CouponId::new(),
            code: "WELCOME".to_string(),
            discount_percent: percent,
            flat_discount_krw: flat_krw,
            flat_discount_usd: 0,
            recurring_type: RecurringType::Recurring,
            recurring_months: Some(3),
            max_recurring_uses: None,
            one_time_use_only: false,
            active: true,
            expires_at: None,
        }
    }

    #[test]
    fn test_quote_percent_then_flat() {
        let c = coupon(10, 1_000);
        // 10% of 9,900 = 990, plus 1,000 flat
        assert_eq!(c.quote(9_900, Currency::Krw).unwrap(), 1_990);
        // flat KRW does not leak into USD
        assert_eq!(c.quote(1_000, Currency::Usd).unwrap(), 100);
    }

    #[test]
    fn test_quote_clamped_to_original() {
        assert_eq!(coupon(100, 5_000).quote(9_900, Currency::Krw).unwrap(), 9_900);
        assert_eq!(coupon(0, 50_000).quote(9_900, Currency::Krw).unwrap(), 9_900);
        assert_eq!(coupon(50, 0).quote(0, Currency::Krw).unwrap(), 0);
        assert!(coupon(50, 0).quote(-1, Currency::Krw).is_err());
    }

    #[test]
    fn test_validate_rejects_malformed() {
        assert!(coupon(10, 0).validate().is_ok());
        assert!(coupon(-5, 0).validate().is_err());
        assert!(coupon(101, 0).validate().is_err());
        assert!(coupon(10, -1).validate().is_err());
        assert!(coupon(0, 0).validate().is_err());

        let mut c = coupon(10, 0);
        c.recurring_months = Some(0);
        assert!(c.validate().is_err());

        let mut c = coupon(10, 0);
        c.recurring_type = RecurringType::OneTime;
        assert!(c.validate().is_err());
        c.recurring_months = None;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_redeemable_checks_active_and_expiry() {
        let now = OffsetDateTime::now_utc();
        let mut c = coupon(10, 0);
        assert!(c.ensure_redeemable(now).is_ok());

        c.expires_at = Some(now - time::Duration::minutes(1));
        assert!(c.ensure_redeemable(now).is_err());

        c.expires_at = None;
        c.active = false;
        assert!(c.ensure_redeemable(now).is_err());
    }

    #[test]
    fn test_attach_only_recurring_with_credential() {
        let sub = SubscriptionId::new();
        let c = coupon(10, 0);
        assert!(CouponApplication::attach(&c, c.terms(), sub, true).is_some());
        assert!(CouponApplication::attach(&c, c.terms(), sub, false).is_none());

        let mut one_time = coupon(10, 0);
        one_time.recurring_type = RecurringType::OneTime;
        assert!(CouponApplication::attach(&one_time, one_time.terms(), sub, true).is_none());
    }

    #[test]
    fn test_consume_counts_down_and_deactivates() {
        let c = coupon(100, 0);
        let app = CouponApplication::attach(&c, c.terms(), SubscriptionId::new(), true).unwrap();

        let first = app.consume_cycle().unwrap();
        assert_eq!(first.remaining_months, Some(2));
        assert_eq!(first.applied_count, 1);
        assert!(first.is_active);

        let second = first.consume_cycle().unwrap();
        assert_eq!(second.remaining_months, Some(1));

        let third = second.consume_cycle().unwrap();
        assert_eq!(third.remaining_months, Some(0));
        assert!(!third.is_active);

        // exhausted applications never come back
        assert!(third.consume_cycle().is_err());
    }

    #[test]
    fn test_max_uses_deactivates() {
        let mut c = coupon(20, 0);
        c.recurring_months = None;
        c.max_recurring_uses = Some(2);
        let app = CouponApplication::attach(&c, c.terms(), SubscriptionId::new(), true).unwrap();

        let app = app.consume_cycle().unwrap();
        assert!(app.is_active);
        let app = app.consume_cycle().unwrap();
        assert!(!app.is_active);
        assert_eq!(app.remaining_months, None);
    }

    #[test]
    fn test_snapshot_survives_catalog_edit() {
        let mut c = coupon(50, 0);
        let app = CouponApplication::attach(&c, c.terms(), SubscriptionId::new(), true).unwrap();
        c.discount_percent = 5;
        c.active = false;

        assert_eq!(app.terms.quote(10_000, Currency::Krw).unwrap(), 5_000);
    }

    #[test]
    fn test_attach_uses_given_terms() {
        let quoted = coupon(50, 0).terms();
        let edited = coupon(10, 0);

        let app = CouponApplication::attach(&edited, quoted, SubscriptionId::new(), true).unwrap();
        assert_eq!(app.terms, quoted);
        assert_eq!(app.coupon_id, edited.id);
    }
}
