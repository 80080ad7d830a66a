//! Billing audit trail
//!
//! Append-only record of every money-relevant decision: charges attempted,
//! settled, waived or refunded, subscription lifecycle changes, coupon usage
//! and settlement runs. Events answer "why was this user charged this amount?"
//! after the fact.
//!
//! Writes go through an [`AuditSink`]. A failing sink never fails the billing
//! operation that emitted the event; the failure is logged instead.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use learnhub_shared::{SubscriptionId, UserId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BillingEventType {
    // Checkout
    CheckoutStarted,
    BillingKeyIssued,

    // Payments
    PaymentAttempted,
    PaymentSucceeded,
    PaymentFailed,
    PaymentWaived,
    PaymentCancelled,
    PaymentRefunded,

    // Subscription lifecycle
    SubscriptionActivated,
    SubscriptionRenewed,
    SubscriptionExpired,
    SubscriptionCancelled,
    RenewalFailed,

    // Coupons
    CouponApplied,
    CouponExhausted,

    // Settlement runs
    SettlementStarted,
    SettlementCompleted,
    SettlementError,

    IntegrityViolation,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::CheckoutStarted => "CHECKOUT_STARTED",
            BillingEventType::BillingKeyIssued => "BILLING_KEY_ISSUED",
            BillingEventType::PaymentAttempted => "PAYMENT_ATTEMPTED",
            BillingEventType::PaymentSucceeded => "PAYMENT_SUCCEEDED",
            BillingEventType::PaymentFailed => "PAYMENT_FAILED",
            BillingEventType::PaymentWaived => "PAYMENT_WAIVED",
            BillingEventType::PaymentCancelled => "PAYMENT_CANCELLED",
            BillingEventType::PaymentRefunded => "PAYMENT_REFUNDED",
            BillingEventType::SubscriptionActivated => "SUBSCRIPTION_ACTIVATED",
            BillingEventType::SubscriptionRenewed => "SUBSCRIPTION_RENEWED",
            BillingEventType::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            BillingEventType::SubscriptionCancelled => "SUBSCRIPTION_CANCELLED",
            BillingEventType::RenewalFailed => "RENEWAL_FAILED",
            BillingEventType::CouponApplied => "COUPON_APPLIED",
            BillingEventType::CouponExhausted => "COUPON_EXHAUSTED",
            BillingEventType::SettlementStarted => "SETTLEMENT_STARTED",
            BillingEventType::SettlementCompleted => "SETTLEMENT_COMPLETED",
            BillingEventType::SettlementError => "SETTLEMENT_ERROR",
            BillingEventType::IntegrityViolation => "INTEGRITY_VIOLATION",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through the checkout flow
    User,
    /// Operator action
    Admin,
    /// Scheduled settlement and other automation
    System,
    /// Gateway webhook
    Gateway,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Admin => write!(f, "admin"),
            ActorType::System => write!(f, "system"),
            ActorType::Gateway => write!(f, "gateway"),
        }
    }
}

/// A billing event record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub event_type: BillingEventType,
    pub user_id: Option<UserId>,
    pub subscription_id: Option<SubscriptionId>,
    pub order_id: Option<String>,
    pub event_data: serde_json::Value,
    pub actor_id: Option<Uuid>,
    pub actor_type: ActorType,
    pub created_at: OffsetDateTime,
}

/// Builder for creating billing events
#[derive(Debug, Clone)]
pub struct BillingEventBuilder {
    event_type: BillingEventType,
    user_id: Option<UserId>,
    subscription_id: Option<SubscriptionId>,
    order_id: Option<String>,
    event_data: serde_json::Value,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(event_type: BillingEventType) -> Self {
        Self {
            event_type,
            user_id: None,
            subscription_id: None,
            order_id: None,
            event_data: serde_json::json!({}),
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn subscription(mut self, subscription_id: SubscriptionId) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }

    pub fn order(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    /// Set the event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    /// Set the actor (who triggered the event)
    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    /// Set the actor type without a specific actor
    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn build(self, now: OffsetDateTime) -> BillingEvent {
        BillingEvent {
            id: Uuid::new_v4(),
            event_type: self.event_type,
            user_id: self.user_id,
            subscription_id: self.subscription_id,
            order_id: self.order_id,
            event_data: self.event_data,
            actor_id: self.actor_id,
            actor_type: self.actor_type,
            created_at: now,
        }
    }
}

/// Destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: &BillingEvent) -> BillingResult<()>;
}

/// Handle used by services to emit events
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Audit log that only writes structured log lines
    pub fn tracing_only() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }

    /// Record an event. Sink failures are logged and swallowed.
    pub async fn emit(&self, builder: BillingEventBuilder) {
        let event = builder.build(OffsetDateTime::now_utc());
        if let Err(e) = self.sink.append(&event).await {
            tracing::warn!(
                event_type = %event.event_type,
                order_id = ?event.order_id,
                error = %e,
                "Failed to record billing audit event"
            );
        }
    }
}

/// Writes events into the `billing_events` table
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn append(&self, event: &BillingEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (
                id,
                event_type,
                user_id,
                subscription_id,
                order_id,
                event_data,
                actor_id,
                actor_type,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(event.event_type.to_string())
        .bind(event.user_id.map(|u| u.0))
        .bind(event.subscription_id.map(|s| s.0))
        .bind(&event.order_id)
        .bind(&event.event_data)
        .bind(event.actor_id)
        .bind(event.actor_type.to_string())
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Emits each event as a structured `tracing` line
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, event: &BillingEvent) -> BillingResult<()> {
        tracing::info!(
            target: "billing_audit",
            event_type = %event.event_type,
            user_id = ?event.user_id,
            subscription_id = ?event.subscription_id,
            order_id = ?event.order_id,
            actor_type = %event.actor_type,
            data = %event.event_data,
            "billing event"
        );
        Ok(())
    }
}

/// Keeps events in memory; used by tests and local runs
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<BillingEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BillingEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count_of(&self, event_type: BillingEventType) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: &BillingEvent) -> BillingResult<()> {
        self.events
            .lock()
            .map_err(|_| BillingError::Internal("audit sink lock poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn append(&self, _event: &BillingEvent) -> BillingResult<()> {
            Err(BillingError::Database("connection refused".to_string()))
        }
    }

    #[test]
    fn test_billing_event_type_display() {
        assert_eq!(BillingEventType::PaymentWaived.to_string(), "PAYMENT_WAIVED");
        assert_eq!(
            BillingEventType::SubscriptionRenewed.to_string(),
            "SUBSCRIPTION_RENEWED"
        );
        assert_eq!(
            BillingEventType::IntegrityViolation.to_string(),
            "INTEGRITY_VIOLATION"
        );
    }

    #[test]
    fn test_actor_type_display() {
        assert_eq!(ActorType::User.to_string(), "user");
        assert_eq!(ActorType::Admin.to_string(), "admin");
        assert_eq!(ActorType::System.to_string(), "system");
        assert_eq!(ActorType::Gateway.to_string(), "gateway");
    }

    #[test]
    fn test_event_builder() {
        let user = UserId::new();
        let event = BillingEventBuilder::new(BillingEventType::CouponApplied)
            .user(user)
            .order("order-1")
            .data(serde_json::json!({"remaining_months": 2}))
            .actor_type(ActorType::Gateway)
            .build(OffsetDateTime::now_utc());

        assert_eq!(event.user_id, Some(user));
        assert_eq!(event.order_id.as_deref(), Some("order-1"));
        assert_eq!(event.event_data["remaining_months"], 2);
        assert_eq!(event.actor_type, ActorType::Gateway);
        assert!(event.subscription_id.is_none());
    }

    #[tokio::test]
    async fn test_memory_sink_records_events() {
        let sink = Arc::new(MemoryAuditSink::new());
        let audit = AuditLog::new(sink.clone());

        audit
            .emit(BillingEventBuilder::new(BillingEventType::SettlementStarted))
            .await;
        audit
            .emit(BillingEventBuilder::new(BillingEventType::SettlementCompleted))
            .await;

        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.count_of(BillingEventType::SettlementStarted), 1);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_propagate() {
        let audit = AuditLog::new(Arc::new(FailingSink));
        // must complete without panicking or returning an error
        audit
            .emit(BillingEventBuilder::new(BillingEventType::PaymentFailed))
            .await;
    }
}
