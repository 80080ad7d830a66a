//! PostgreSQL store
//!
//! Multi-row units of work run in one transaction. Subscription checkouts and
//! activation are serialized per user with a transaction-scoped advisory
//! lock; renewals lock the subscription and payment rows with `FOR UPDATE`.

use async_trait::async_trait;
use learnhub_shared::{CouponId, PaymentId, PlanId, SubscriptionId, UserId};
use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    BillingStore, RenewalCommit, RenewalFailure, RenewalOutcome, SubscriptionActivation,
};
use crate::coupon::{CouponApplication, DiscountCoupon, DiscountTerms};
use crate::error::{BillingError, BillingResult};
use crate::gateway::GatewayResponse;
use crate::payment::{PaymentKind, PaymentRecord, PaymentStatus, PaymentTransition};
use crate::plan::Plan;
use crate::subscription::Subscription;
use crate::webhooks::WebhookEvent;

const OPEN_CHECKOUT_CONSTRAINT: &str = "idx_payments_one_open_checkout_per_user";

const PAYMENT_COLUMNS: &str = "id, user_id, plan_id, subscription_id, order_id, external_charge_key, \
     original_amount, discount_amount, final_amount, currency, status, payment_kind, \
     applied_coupon_id, encrypted_credential, billing_cycle_due, attempt_number, \
     failure_reason, raw_gateway_response, approved_at, created_at, updated_at, coupon_terms";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, originating_payment_id, status, \
     start_date, end_date, auto_renew, recurring_status, next_billing_date, last_billing_date, \
     encrypted_credential, customer_key, currency, is_trial_period, failure_count, \
     next_retry_at, renewal_claimed_at, cancelled_at, created_at, updated_at";

const COUPON_COLUMNS: &str = "id, code, discount_percent, flat_discount_krw, flat_discount_usd, \
     recurring_type, recurring_months, max_recurring_uses, one_time_use_only, active, expires_at";

const APPLICATION_COLUMNS: &str = "id, subscription_id, coupon_id, remaining_months, \
     applied_count, max_uses, is_active, discount_percent, flat_discount_krw, flat_discount_usd";

const WEBHOOK_COLUMNS: &str = "id, external_event_id, event_type, payload, processed, attempts, \
     last_error, received_at, processed_at";

fn corrupt(what: &str, err: impl std::fmt::Display) -> BillingError {
    BillingError::Internal(format!("Corrupt {} row: {}", what, err))
}

#[derive(FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    price_krw: i64,
    price_usd: i64,
    duration_days: i32,
    active: bool,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            id: PlanId(row.id),
            name: row.name,
            price_krw: row.price_krw,
            price_usd: row.price_usd,
            duration_days: row.duration_days,
            active: row.active,
        }
    }
}

#[derive(FromRow)]
struct PaymentRow {
    id: Uuid,
    user_id: Uuid,
    plan_id: Uuid,
    subscription_id: Option<Uuid>,
    order_id: String,
    external_charge_key: Option<String>,
    original_amount: i64,
    discount_amount: i64,
    final_amount: i64,
    currency: String,
    status: String,
    payment_kind: String,
    applied_coupon_id: Option<Uuid>,
    encrypted_credential: Option<String>,
    billing_cycle_due: Option<OffsetDateTime>,
    attempt_number: i32,
    failure_reason: Option<String>,
    raw_gateway_response: Option<serde_json::Value>,
    approved_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    coupon_terms: Option<serde_json::Value>,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let raw_gateway_response = row
            .raw_gateway_response
            .map(serde_json::from_value::<GatewayResponse>)
            .transpose()
            .map_err(|e| corrupt("payment", e))?;
        let coupon_terms = row
            .coupon_terms
            .map(serde_json::from_value::<DiscountTerms>)
            .transpose()
            .map_err(|e| corrupt("payment", e))?;

        Ok(PaymentRecord {
            id: PaymentId(row.id),
            user_id: UserId(row.user_id),
            plan_id: PlanId(row.plan_id),
            subscription_id: row.subscription_id.map(SubscriptionId),
            order_id: row.order_id,
            external_charge_key: row.external_charge_key,
            original_amount: row.original_amount,
            discount_amount: row.discount_amount,
            final_amount: row.final_amount,
            currency: row.currency.parse().map_err(|e| corrupt("payment", e))?,
            status: row.status.parse()?,
            payment_kind: row.payment_kind.parse()?,
            applied_coupon_id: row.applied_coupon_id.map(CouponId),
            coupon_terms,
            encrypted_credential: row.encrypted_credential,
            billing_cycle_due: row.billing_cycle_due,
            attempt_number: row.attempt_number,
            failure_reason: row.failure_reason,
            raw_gateway_response,
            approved_at: row.approved_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    plan_id: Uuid,
    originating_payment_id: Uuid,
    status: String,
    start_date: OffsetDateTime,
    end_date: OffsetDateTime,
    auto_renew: bool,
    recurring_status: String,
    next_billing_date: Option<OffsetDateTime>,
    last_billing_date: Option<OffsetDateTime>,
    encrypted_credential: Option<String>,
    customer_key: String,
    currency: String,
    is_trial_period: bool,
    failure_count: i32,
    next_retry_at: Option<OffsetDateTime>,
    renewal_claimed_at: Option<OffsetDateTime>,
    cancelled_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: SubscriptionId(row.id),
            user_id: UserId(row.user_id),
            plan_id: PlanId(row.plan_id),
            originating_payment_id: PaymentId(row.originating_payment_id),
            status: row.status.parse()?,
            start_date: row.start_date,
            end_date: row.end_date,
            auto_renew: row.auto_renew,
            recurring_status: row.recurring_status.parse()?,
            next_billing_date: row.next_billing_date,
            last_billing_date: row.last_billing_date,
            encrypted_credential: row.encrypted_credential,
            customer_key: row.customer_key,
            currency: row.currency.parse().map_err(|e| corrupt("subscription", e))?,
            is_trial_period: row.is_trial_period,
            failure_count: row.failure_count,
            next_retry_at: row.next_retry_at,
            renewal_claimed_at: row.renewal_claimed_at,
            cancelled_at: row.cancelled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct CouponRow {
    id: Uuid,
    code: String,
    discount_percent: i32,
    flat_discount_krw: i64,
    flat_discount_usd: i64,
    recurring_type: String,
    recurring_months: Option<i32>,
    max_recurring_uses: Option<i32>,
    one_time_use_only: bool,
    active: bool,
    expires_at: Option<OffsetDateTime>,
}

impl TryFrom<CouponRow> for DiscountCoupon {
    type Error = BillingError;

    fn try_from(row: CouponRow) -> Result<Self, Self::Error> {
        Ok(DiscountCoupon {
            id: CouponId(row.id),
            code: row.code,
            discount_percent: row.discount_percent,
            flat_discount_krw: row.flat_discount_krw,
            flat_discount_usd: row.flat_discount_usd,
            recurring_type: row.recurring_type.parse()?,
            recurring_months: row.recurring_months,
            max_recurring_uses: row.max_recurring_uses,
            one_time_use_only: row.one_time_use_only,
            active: row.active,
            expires_at: row.expires_at,
        })
    }
}

#[derive(FromRow)]
struct ApplicationRow {
    id: Uuid,
    subscription_id: Uuid,
    coupon_id: Uuid,
    remaining_months: Option<i32>,
    applied_count: i32,
    max_uses: Option<i32>,
    is_active: bool,
    discount_percent: i32,
    flat_discount_krw: i64,
    flat_discount_usd: i64,
}

impl From<ApplicationRow> for CouponApplication {
    fn from(row: ApplicationRow) -> Self {
        CouponApplication {
            id: row.id,
            subscription_id: SubscriptionId(row.subscription_id),
            coupon_id: CouponId(row.coupon_id),
            remaining_months: row.remaining_months,
            applied_count: row.applied_count,
            max_uses: row.max_uses,
            is_active: row.is_active,
            terms: DiscountTerms {
                percent: row.discount_percent,
                flat_krw: row.flat_discount_krw,
                flat_usd: row.flat_discount_usd,
            },
        }
    }
}

#[derive(FromRow)]
struct WebhookRow {
    id: Uuid,
    external_event_id: String,
    event_type: String,
    payload: serde_json::Value,
    processed: bool,
    attempts: i32,
    last_error: Option<String>,
    received_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
}

impl From<WebhookRow> for WebhookEvent {
    fn from(row: WebhookRow) -> Self {
        WebhookEvent {
            id: row.id,
            external_event_id: row.external_event_id,
            event_type: row.event_type,
            payload: row.payload,
            processed: row.processed,
            attempts: row.attempts,
            last_error: row.last_error,
            received_at: row.received_at,
            processed_at: row.processed_at,
        }
    }
}

/// Conditional status update shared by single-row transitions and renewals
async fn write_transition(
    conn: &mut PgConnection,
    id: PaymentId,
    from: PaymentStatus,
    transition: &PaymentTransition,
    now: OffsetDateTime,
) -> BillingResult<Option<PaymentRecord>> {
    if !from.can_transition_to(transition.to) {
        return Err(BillingError::IllegalTransition {
            from,
            to: transition.to,
        });
    }

    let raw = transition
        .raw_gateway_response
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;

    let row: Option<PaymentRow> = sqlx::query_as(&format!(
        r#"
        UPDATE payments SET
            status = $3,
            external_charge_key = COALESCE($4, external_charge_key),
            raw_gateway_response = COALESCE($5, raw_gateway_response),
            approved_at = COALESCE($6, approved_at),
            failure_reason = COALESCE($7, failure_reason),
            updated_at = $8
        WHERE id = $1 AND status = $2
        RETURNING {PAYMENT_COLUMNS}
        "#
    ))
    .bind(id.0)
    .bind(from.as_str())
    .bind(transition.to.as_str())
    .bind(&transition.external_charge_key)
    .bind(raw)
    .bind(transition.approved_at)
    .bind(&transition.failure_reason)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(PaymentRecord::try_from).transpose()
}

async fn deactivate_applications(
    conn: &mut PgConnection,
    subscription_ids: &[Uuid],
    now: OffsetDateTime,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE coupon_applications SET is_active = false, updated_at = $2
        WHERE subscription_id = ANY($1) AND is_active
        "#,
    )
    .bind(subscription_ids)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Postgres-backed [`BillingStore`]
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Seed or update a plan. Plans are otherwise managed outside the engine.
    pub async fn upsert_plan(&self, plan: &Plan) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO plans (id, name, price_krw, price_usd, duration_days, active)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                price_krw = EXCLUDED.price_krw,
                price_usd = EXCLUDED.price_usd,
                duration_days = EXCLUDED.duration_days,
                active = EXCLUDED.active
            "#,
        )
        .bind(plan.id.0)
        .bind(&plan.name)
        .bind(plan.price_krw)
        .bind(plan.price_usd)
        .bind(plan.duration_days)
        .bind(plan.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn select_subscriptions(
        &self,
        predicate: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE {predicate}"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn plan(&self, id: PlanId) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            "SELECT id, name, price_krw, price_usd, duration_days, active FROM plans WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Plan::from))
    }

    async fn insert_coupon(&self, coupon: &DiscountCoupon) -> BillingResult<()> {
        coupon.validate()?;

        sqlx::query(
            r#"
            INSERT INTO discount_coupons (
                id, code, discount_percent, flat_discount_krw, flat_discount_usd,
                recurring_type, recurring_months, max_recurring_uses,
                one_time_use_only, active, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(coupon.id.0)
        .bind(&coupon.code)
        .bind(coupon.discount_percent)
        .bind(coupon.flat_discount_krw)
        .bind(coupon.flat_discount_usd)
        .bind(coupon.recurring_type.as_str())
        .bind(coupon.recurring_months)
        .bind(coupon.max_recurring_uses)
        .bind(coupon.one_time_use_only)
        .bind(coupon.active)
        .bind(coupon.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                BillingError::InvalidCoupon(format!("code {} already exists", coupon.code))
            }
            other => other.into(),
        })?;

        Ok(())
    }

    async fn coupon(&self, id: CouponId) -> BillingResult<Option<DiscountCoupon>> {
        let row: Option<CouponRow> = sqlx::query_as(&format!(
            "SELECT {COUPON_COLUMNS} FROM discount_coupons WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DiscountCoupon::try_from).transpose()
    }

    async fn coupon_by_code(&self, code: &str) -> BillingResult<Option<DiscountCoupon>> {
        let row: Option<CouponRow> = sqlx::query_as(&format!(
            "SELECT {COUPON_COLUMNS} FROM discount_coupons WHERE code = $1"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DiscountCoupon::try_from).transpose()
    }

    async fn deactivate_coupon(&self, id: CouponId) -> BillingResult<()> {
        sqlx::query("UPDATE discount_coupons SET active = false WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_payment(&self, payment: &PaymentRecord) -> BillingResult<()> {
        let raw = payment
            .raw_gateway_response
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let coupon_terms = payment
            .coupon_terms
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let mut tx = self.pool.begin().await?;

        if payment.payment_kind == PaymentKind::InitialSubscription {
            // same per-user lock as activate_subscription
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(payment.user_id.to_string())
                .execute(&mut *tx)
                .await?;

            let live: Option<(Uuid,)> = sqlx::query_as(
                r#"
                SELECT id FROM subscriptions
                WHERE user_id = $1 AND status = 'ACTIVE' AND end_date > $2
                LIMIT 1
                "#,
            )
            .bind(payment.user_id.0)
            .bind(payment.created_at)
            .fetch_optional(&mut *tx)
            .await?;
            if live.is_some() {
                tx.rollback().await?;
                return Err(BillingError::ActiveSubscriptionExists(payment.user_id.to_string()));
            }

            let open: Option<(String,)> = sqlx::query_as(
                r#"
                SELECT p.order_id FROM payments p
                WHERE p.user_id = $1
                  AND p.payment_kind = 'INITIAL_SUBSCRIPTION'
                  AND (p.status = 'PENDING'
                       OR (p.status IN ('PAID', 'WAIVED')
                           AND NOT EXISTS (
                               SELECT 1 FROM subscriptions s WHERE s.originating_payment_id = p.id
                           )))
                LIMIT 1
                "#,
            )
            .bind(payment.user_id.0)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some((order_id,)) = open {
                tx.rollback().await?;
                return Err(BillingError::CheckoutInProgress(order_id));
            }
        }

        sqlx::query(&format!(
            r#"
            INSERT INTO payments ({PAYMENT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
            "#
        ))
        .bind(payment.id.0)
        .bind(payment.user_id.0)
        .bind(payment.plan_id.0)
        .bind(payment.subscription_id.map(|s| s.0))
        .bind(&payment.order_id)
        .bind(&payment.external_charge_key)
        .bind(payment.original_amount)
        .bind(payment.discount_amount)
        .bind(payment.final_amount)
        .bind(payment.currency.as_str())
        .bind(payment.status.as_str())
        .bind(payment.payment_kind.as_str())
        .bind(payment.applied_coupon_id.map(|c| c.0))
        .bind(&payment.encrypted_credential)
        .bind(payment.billing_cycle_due)
        .bind(payment.attempt_number)
        .bind(&payment.failure_reason)
        .bind(raw)
        .bind(payment.approved_at)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .bind(coupon_terms)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db)
                if db.constraint() == Some(OPEN_CHECKOUT_CONSTRAINT) =>
            {
                BillingError::CheckoutInProgress(payment.user_id.to_string())
            }
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                BillingError::DuplicateOrder(payment.order_id.clone())
            }
            other => other.into(),
        })?;

        tx.commit().await?;
        Ok(())
    }

    async fn payment(&self, id: PaymentId) -> BillingResult<Option<PaymentRecord>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentRecord::try_from).transpose()
    }

    async fn payment_by_order(&self, order_id: &str) -> BillingResult<Option<PaymentRecord>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentRecord::try_from).transpose()
    }

    async fn transition_payment(
        &self,
        id: PaymentId,
        from: PaymentStatus,
        transition: &PaymentTransition,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PaymentRecord>> {
        let mut conn = self.pool.acquire().await?;
        write_transition(&mut conn, id, from, transition, now).await
    }

    async fn attach_payment_credential(
        &self,
        id: PaymentId,
        envelope: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Option<PaymentRecord>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payments SET encrypted_credential = $2, updated_at = $3
            WHERE id = $1 AND status = 'PENDING'
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(id.0)
        .bind(envelope)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentRecord::try_from).transpose()
    }

    async fn pending_renewal_payment(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Option<PaymentRecord>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS} FROM payments
            WHERE subscription_id = $1 AND status = 'PENDING' AND payment_kind = 'RECURRING'
            ORDER BY created_at ASC
            LIMIT 1
            "#
        ))
        .bind(subscription_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentRecord::try_from).transpose()
    }

    async fn activate_subscription(
        &self,
        activation: SubscriptionActivation,
    ) -> BillingResult<Subscription> {
        let sub = activation.subscription;
        let now = sub.created_at;
        let mut tx = self.pool.begin().await?;

        // Serialize activation per user
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(sub.user_id.to_string())
            .execute(&mut *tx)
            .await?;

        let existing: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE originating_payment_id = $1"
        ))
        .bind(sub.originating_payment_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(existing) = existing {
            tx.rollback().await?;
            return Subscription::try_from(existing);
        }

        let payment_status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM payments WHERE id = $1 FOR UPDATE")
                .bind(sub.originating_payment_id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let status: PaymentStatus = match payment_status {
            Some((status,)) => status.parse()?,
            None => {
                return Err(BillingError::NotFound(format!(
                    "payment {}",
                    sub.originating_payment_id
                )))
            }
        };
        if !status.is_settled() {
            return Err(BillingError::InvalidInput(format!(
                "payment {} is {}",
                sub.originating_payment_id, status
            )));
        }

        let active: Vec<(Uuid, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT id, end_date FROM subscriptions
            WHERE user_id = $1 AND status = 'ACTIVE'
            FOR UPDATE
            "#,
        )
        .bind(sub.user_id.0)
        .fetch_all(&mut *tx)
        .await?;

        if active.iter().any(|(_, end_date)| *end_date > now) {
            tx.rollback().await?;
            return Err(BillingError::ActiveSubscriptionExists(sub.user_id.to_string()));
        }

        if !active.is_empty() {
            let stale: Vec<Uuid> = active.iter().map(|(id, _)| *id).collect();
            sqlx::query(
                r#"
                UPDATE subscriptions SET
                    status = 'EXPIRED',
                    auto_renew = false,
                    next_retry_at = NULL,
                    renewal_claimed_at = NULL,
                    updated_at = $2
                WHERE id = ANY($1)
                "#,
            )
            .bind(&stale)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            deactivate_applications(&mut tx, &stale, now).await?;
        }

        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions ({SUBSCRIPTION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(sub.id.0)
        .bind(sub.user_id.0)
        .bind(sub.plan_id.0)
        .bind(sub.originating_payment_id.0)
        .bind(sub.status.as_str())
        .bind(sub.start_date)
        .bind(sub.end_date)
        .bind(sub.auto_renew)
        .bind(sub.recurring_status.as_str())
        .bind(sub.next_billing_date)
        .bind(sub.last_billing_date)
        .bind(&sub.encrypted_credential)
        .bind(&sub.customer_key)
        .bind(sub.currency.as_str())
        .bind(sub.is_trial_period)
        .bind(sub.failure_count)
        .bind(sub.next_retry_at)
        .bind(sub.renewal_claimed_at)
        .bind(sub.cancelled_at)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE payments SET subscription_id = $1, updated_at = $3 WHERE id = $2")
            .bind(sub.id.0)
            .bind(sub.originating_payment_id.0)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        if let Some(app) = activation.coupon_application {
            sqlx::query(&format!(
                r#"
                INSERT INTO coupon_applications ({APPLICATION_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (subscription_id) DO NOTHING
                "#
            ))
            .bind(app.id)
            .bind(sub.id.0)
            .bind(app.coupon_id.0)
            .bind(app.remaining_months)
            .bind(app.applied_count)
            .bind(app.max_uses)
            .bind(app.is_active)
            .bind(app.terms.percent)
            .bind(app.terms.flat_krw)
            .bind(app.terms.flat_usd)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(coupon_id) = activation.deactivate_coupon {
            sqlx::query("UPDATE discount_coupons SET active = false WHERE id = $1")
                .bind(coupon_id.0)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Subscription::try_from(row)
    }

    async fn subscription(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn live_subscription(
        &self,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE user_id = $1 AND status = 'ACTIVE' AND end_date > $2
            LIMIT 1
            "#
        ))
        .bind(user_id.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn coupon_application(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Option<CouponApplication>> {
        let row: Option<ApplicationRow> = sqlx::query_as(&format!(
            "SELECT {APPLICATION_COLUMNS} FROM coupon_applications WHERE subscription_id = $1"
        ))
        .bind(subscription_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CouponApplication::from))
    }

    async fn due_subscriptions(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        self.select_subscriptions(
            r#"status = 'ACTIVE'
               AND auto_renew
               AND recurring_status = 'ACTIVE'
               AND encrypted_credential IS NOT NULL
               AND next_billing_date <= $1
               AND (next_retry_at IS NULL OR next_retry_at <= $1)
               ORDER BY next_billing_date ASC"#,
            now,
        )
        .await
    }

    async fn lapsed_subscriptions(
        &self,
        now: OffsetDateTime,
        grace: time::Duration,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE status = 'ACTIVE'
              AND end_date <= $1
              AND (NOT auto_renew OR recurring_status = 'FAILED' OR end_date <= $2)
            "#
        ))
        .bind(now)
        .bind(now - grace)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn claim_renewal(
        &self,
        id: SubscriptionId,
        now: OffsetDateTime,
        lease: time::Duration,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET renewal_claimed_at = $2
            WHERE id = $1
              AND status = 'ACTIVE'
              AND (renewal_claimed_at IS NULL OR renewal_claimed_at <= $3)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(id.0)
        .bind(now)
        .bind(now - lease)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn release_renewal(&self, id: SubscriptionId) -> BillingResult<()> {
        sqlx::query("UPDATE subscriptions SET renewal_claimed_at = NULL WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn commit_renewal(&self, commit: RenewalCommit) -> BillingResult<RenewalOutcome> {
        let mut tx = self.pool.begin().await?;

        let payment: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1 FOR UPDATE"
        ))
        .bind(commit.payment_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let payment = payment
            .map(PaymentRecord::try_from)
            .transpose()?
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", commit.payment_id)))?;

        if payment.status.is_settled() {
            tx.rollback().await?;
            return Ok(RenewalOutcome::AlreadyApplied);
        }
        if payment.status != PaymentStatus::Pending {
            tx.rollback().await?;
            return Ok(RenewalOutcome::Conflict(format!(
                "payment {} is {}",
                payment.order_id, payment.status
            )));
        }

        let next_billing: Option<(Option<OffsetDateTime>,)> = sqlx::query_as(
            "SELECT next_billing_date FROM subscriptions WHERE id = $1 FOR UPDATE",
        )
        .bind(commit.subscription_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((next_billing,)) = next_billing else {
            return Err(BillingError::NotFound(format!(
                "subscription {}",
                commit.subscription_id
            )));
        };
        if next_billing != Some(commit.expected_next_billing_date) {
            tx.rollback().await?;
            return Ok(RenewalOutcome::Conflict(format!(
                "subscription {} already moved past cycle {}",
                commit.subscription_id, commit.expected_next_billing_date
            )));
        }

        if let Some(ref app) = commit.coupon_application {
            let updated = sqlx::query(
                r#"
                UPDATE coupon_applications SET
                    remaining_months = $2,
                    applied_count = $3,
                    is_active = $4,
                    updated_at = $5
                WHERE subscription_id = $1 AND is_active AND applied_count = $6
                "#,
            )
            .bind(commit.subscription_id.0)
            .bind(app.remaining_months)
            .bind(app.applied_count)
            .bind(app.is_active)
            .bind(commit.billed_at)
            .bind(app.applied_count - 1)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(RenewalOutcome::Conflict(format!(
                    "coupon application for subscription {} changed",
                    commit.subscription_id
                )));
            }
        }

        let settled = write_transition(
            &mut tx,
            commit.payment_id,
            PaymentStatus::Pending,
            &commit.transition,
            commit.billed_at,
        )
        .await?;
        if settled.is_none() {
            tx.rollback().await?;
            return Ok(RenewalOutcome::Conflict(format!(
                "payment {} changed during renewal",
                commit.payment_id
            )));
        }

        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                end_date = $2,
                last_billing_date = $3,
                next_billing_date = $2,
                failure_count = 0,
                next_retry_at = NULL,
                renewal_claimed_at = NULL,
                is_trial_period = false,
                recurring_status = CASE
                    WHEN status = 'ACTIVE' AND auto_renew THEN 'ACTIVE'
                    ELSE recurring_status
                END,
                updated_at = $3
            WHERE id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(commit.subscription_id.0)
        .bind(commit.new_end_date)
        .bind(commit.billed_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RenewalOutcome::Committed(Subscription::try_from(row)?))
    }

    async fn record_renewal_failure(&self, failure: RenewalFailure) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions SET
                failure_count = $2,
                next_retry_at = $3,
                auto_renew = auto_renew AND NOT $4,
                recurring_status = CASE WHEN $4 THEN 'FAILED' ELSE recurring_status END,
                renewal_claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(failure.subscription_id.0)
        .bind(failure.failure_count)
        .bind(failure.next_retry_at)
        .bind(failure.exhausted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn expire_subscription(
        &self,
        id: SubscriptionId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let mut tx = self.pool.begin().await?;
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                status = 'EXPIRED',
                auto_renew = false,
                next_retry_at = NULL,
                renewal_claimed_at = NULL,
                updated_at = $2
            WHERE id = $1 AND status = 'ACTIVE'
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(id.0)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if row.is_some() {
            deactivate_applications(&mut tx, &[id.0], now).await?;
        }
        tx.commit().await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn cancel_subscription(
        &self,
        id: SubscriptionId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let mut tx = self.pool.begin().await?;
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                status = 'CANCELLED',
                auto_renew = false,
                recurring_status = 'INACTIVE',
                next_retry_at = NULL,
                cancelled_at = $2,
                updated_at = $2
            WHERE id = $1 AND status = 'ACTIVE'
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(id.0)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if row.is_some() {
            deactivate_applications(&mut tx, &[id.0], now).await?;
        }
        tx.commit().await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn record_webhook_event(
        &self,
        external_event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        now: OffsetDateTime,
    ) -> BillingResult<(WebhookEvent, bool)> {
        let inserted: Option<WebhookRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO webhook_events (id, external_event_id, event_type, payload, received_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (external_event_id) DO NOTHING
            RETURNING {WEBHOOK_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(external_event_id)
        .bind(event_type)
        .bind(payload)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        let existing = self.webhook_event(external_event_id).await?.ok_or_else(|| {
            BillingError::Internal(format!(
                "webhook event {} vanished after conflict",
                external_event_id
            ))
        })?;
        Ok((existing, false))
    }

    async fn webhook_event(&self, external_event_id: &str) -> BillingResult<Option<WebhookEvent>> {
        let row: Option<WebhookRow> = sqlx::query_as(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhook_events WHERE external_event_id = $1"
        ))
        .bind(external_event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(WebhookEvent::from))
    }

    async fn mark_webhook_processed(&self, id: Uuid, now: OffsetDateTime) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processed = true, processed_at = $2, attempts = attempts + 1
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_webhook_failure(&self, id: Uuid, error: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE webhook_events SET attempts = attempts + 1, last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unprocessed_webhook_events(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEvent>> {
        let rows: Vec<WebhookRow> = sqlx::query_as(&format!(
            r#"
            SELECT {WEBHOOK_COLUMNS} FROM webhook_events
            WHERE processed = false AND received_at >= $1
            ORDER BY received_at ASC
            LIMIT $2
            "#
        ))
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(WebhookEvent::from).collect())
    }

    async fn purge_webhook_events(&self, before: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM webhook_events WHERE received_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
