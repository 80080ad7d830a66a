//! LearnHub recurring billing engine
//!
//! Checkout, recurring settlement and gateway webhook reconciliation over a
//! single persistence port. Card credentials are stored only as vault
//! envelopes; amounts are integer minor units throughout.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod audit;
pub mod checkout;
pub mod config;
pub mod coupon;
pub mod error;
pub mod gateway;
pub mod payment;
pub mod plan;
pub mod settlement;
pub mod store;
pub mod subscription;
pub mod vault;
pub mod webhooks;

use std::sync::Arc;

use sqlx::PgPool;

pub use audit::{
    ActorType, AuditLog, AuditSink, BillingEvent, BillingEventBuilder, BillingEventType,
    MemoryAuditSink, PgAuditSink, TracingAuditSink,
};
pub use checkout::{CheckoutOutcome, CheckoutRequest, CheckoutService};
pub use config::{BillingConfig, GatewayConfig, SettlementPolicy, WebhookPolicy};
pub use coupon::{CouponApplication, DiscountCoupon, DiscountTerms, RecurringType};
pub use error::{BillingError, BillingResult, ErrorClass};
pub use gateway::{
    ApprovedCharge, BillingKeyIssue, CardInfo, ChargeResult, DeclinedCharge, GatewayResponse,
    HttpGateway, PaymentGateway,
};
pub use payment::{
    ChargeInstrument, ChargeVerdict, NewPayment, PaymentKind, PaymentRecord, PaymentService,
    PaymentStatus, PaymentTransition,
};
pub use plan::Plan;
pub use settlement::{RenewalStep, SettlementItemError, SettlementJob, SettlementSummary};
pub use store::{BillingStore, MemoryBillingStore, PgBillingStore};
pub use subscription::{RecurringStatus, Subscription, SubscriptionStatus};
pub use vault::BillingKeyVault;
pub use webhooks::{
    GatewayEvent, SweepSummary, WebhookEnvelope, WebhookEvent, WebhookOutcome, WebhookReconciler,
};

/// Main billing service that wires the engine together
#[derive(Clone)]
pub struct BillingService {
    pub store: Arc<dyn BillingStore>,
    pub payments: PaymentService,
    pub checkout: CheckoutService,
    pub settlement: SettlementJob,
    pub webhooks: WebhookReconciler,
}

impl BillingService {
    /// Assemble the engine over explicit adapters
    pub fn new(
        config: &BillingConfig,
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        audit: AuditLog,
    ) -> BillingResult<Self> {
        let vault = BillingKeyVault::new(&config.encryption_key)?;
        let payments = PaymentService::new(
            store.clone(),
            gateway.clone(),
            audit.clone(),
            config.gateway.lookup_attempts,
        );
        let checkout = CheckoutService::new(
            store.clone(),
            gateway,
            payments.clone(),
            vault.clone(),
            audit.clone(),
        );
        let settlement = SettlementJob::new(
            store.clone(),
            payments.clone(),
            vault,
            audit,
            config.settlement.clone(),
        );
        let webhooks = WebhookReconciler::new(
            store.clone(),
            payments.clone(),
            checkout.clone(),
            settlement.clone(),
            config.webhooks.clone(),
        );

        Ok(Self {
            store,
            payments,
            checkout,
            settlement,
            webhooks,
        })
    }

    /// Production wiring: Postgres store and audit trail, HTTP gateway
    pub fn from_pool(config: &BillingConfig, pool: PgPool) -> BillingResult<Self> {
        let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool.clone()));
        let gateway: Arc<dyn PaymentGateway> = Arc::new(HttpGateway::new(config.gateway.clone())?);
        let audit = AuditLog::new(Arc::new(PgAuditSink::new(pool)));
        Self::new(config, store, gateway, audit)
    }
}
