//! Shared fixtures for billing integration tests
//!
//! Everything runs against `MemoryBillingStore` and a scripted gateway, so no
//! database or network is needed.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use learnhub_billing::{
    ApprovedCharge, AuditLog, BillingConfig, BillingKeyIssue, BillingResult, BillingService,
    CardInfo, ChargeResult, CheckoutRequest, DiscountCoupon, GatewayConfig, MemoryAuditSink,
    MemoryBillingStore, PaymentGateway, PaymentKind, Plan, RecurringType, SettlementPolicy,
    Subscription, WebhookPolicy,
};
use learnhub_shared::{CouponId, Currency, PlanId, UserId};
use time::OffsetDateTime;

/// Next answer the gateway gives
#[derive(Debug, Clone)]
pub enum Script {
    /// Capture exactly what was asked
    Approve,
    /// Report a capture of a different amount
    ApproveAmount(i64),
    Decline(&'static str),
    Timeout,
}

#[derive(Default)]
struct GatewayState {
    charges: VecDeque<Script>,
    lookups: VecDeque<Script>,
    /// order id -> amount requested
    requested: HashMap<String, i64>,
    charge_calls: Vec<(String, i64)>,
    lookup_calls: usize,
}

/// Approves everything unless told otherwise
#[derive(Default)]
pub struct ScriptedGateway {
    state: Mutex<GatewayState>,
}

impl ScriptedGateway {
    pub fn script_charge(&self, script: Script) {
        self.state.lock().unwrap().charges.push_back(script);
    }

    pub fn script_lookup(&self, script: Script) {
        self.state.lock().unwrap().lookups.push_back(script);
    }

    /// (order id, amount) of every charge request
    pub fn charge_calls(&self) -> Vec<(String, i64)> {
        self.state.lock().unwrap().charge_calls.clone()
    }

    pub fn lookup_calls(&self) -> usize {
        self.state.lock().unwrap().lookup_calls
    }

    fn answer(script: Script, payment_key: String, order_id: &str, amount: i64) -> ChargeResult {
        match script {
            Script::Approve => approved(payment_key, order_id, amount),
            Script::ApproveAmount(captured) => approved(payment_key, order_id, captured),
            Script::Decline(code) => ChargeResult::declined(code, "declined by issuer"),
            Script::Timeout => ChargeResult::Indeterminate {
                reason: "request timed out".to_string(),
            },
        }
    }

    fn charge(&self, payment_key: String, order_id: &str, amount: i64) -> ChargeResult {
        let script = {
            let mut state = self.state.lock().unwrap();
            state.requested.insert(order_id.to_string(), amount);
            state.charge_calls.push((order_id.to_string(), amount));
            state.charges.pop_front().unwrap_or(Script::Approve)
        };
        Self::answer(script, payment_key, order_id, amount)
    }
}

fn approved(payment_key: String, order_id: &str, amount: i64) -> ChargeResult {
    ChargeResult::Approved(ApprovedCharge {
        payment_key,
        order_id: order_id.to_string(),
        amount,
        approved_at: OffsetDateTime::now_utc(),
        method: Some("CARD".to_string()),
    })
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn issue_billing_key(
        &self,
        auth_key: &str,
        _customer_key: &str,
    ) -> BillingResult<BillingKeyIssue> {
        Ok(BillingKeyIssue {
            billing_key: format!("bk_{}", auth_key),
            card: CardInfo {
                issuer_code: Some("61".to_string()),
                masked_number: Some("1234-****-****-5678".to_string()),
                card_type: Some("CREDIT".to_string()),
            },
        })
    }

    async fn confirm_charge(&self, payment_key: &str, order_id: &str, amount: i64) -> ChargeResult {
        self.charge(payment_key.to_string(), order_id, amount)
    }

    async fn charge_with_key(
        &self,
        _billing_key: &str,
        _customer_key: &str,
        amount: i64,
        order_id: &str,
        _order_name: &str,
    ) -> ChargeResult {
        self.charge(format!("pay_{}", order_id), order_id, amount)
    }

    async fn lookup_charge(&self, order_id: &str) -> ChargeResult {
        let (script, amount) = {
            let mut state = self.state.lock().unwrap();
            state.lookup_calls += 1;
            let amount = state.requested.get(order_id).copied();
            (state.lookups.pop_front().unwrap_or(Script::Timeout), amount)
        };
        match amount {
            Some(amount) => Self::answer(script, format!("pay_{}", order_id), order_id, amount),
            None => ChargeResult::declined("NOT_FOUND_PAYMENT", "no such order"),
        }
    }
}

pub struct Harness {
    pub store: Arc<MemoryBillingStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub audit: Arc<MemoryAuditSink>,
    pub billing: BillingService,
    pub plan: Plan,
}

pub fn test_config() -> BillingConfig {
    BillingConfig {
        encryption_key: [7u8; 32],
        gateway: GatewayConfig {
            api_base: "http://gateway.invalid".to_string(),
            secret_key: "test_sk".to_string(),
            timeout: std::time::Duration::from_secs(1),
            lookup_attempts: 1,
            webhook_secret: "test-webhook-secret-that-is-long-enough".to_string(),
        },
        settlement: SettlementPolicy::default(),
        webhooks: WebhookPolicy::default(),
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: BillingConfig) -> Self {
        let store = Arc::new(MemoryBillingStore::new());
        let gateway = Arc::new(ScriptedGateway::default());
        let audit = Arc::new(MemoryAuditSink::new());

        let plan = Plan {
            id: PlanId::new(),
            name: "Monthly".to_string(),
            price_krw: 9_900,
            price_usd: 799,
            duration_days: 30,
            active: true,
        };
        store.insert_plan(plan.clone()).unwrap();

        let billing = BillingService::new(
            &config,
            store.clone(),
            gateway.clone(),
            AuditLog::new(audit.clone()),
        )
        .unwrap();

        Self {
            store,
            gateway,
            audit,
            billing,
            plan,
        }
    }

    pub fn request(&self, user_id: UserId, kind: PaymentKind, coupon: Option<&str>) -> CheckoutRequest {
        CheckoutRequest {
            user_id,
            plan_id: self.plan.id,
            currency: Currency::Krw,
            coupon_code: coupon.map(str::to_string),
            order_id: format!("order-{}", uuid::Uuid::new_v4().simple()),
            kind,
        }
    }

    /// Card-registered subscription at full price
    pub async fn subscribe(&self, user_id: UserId) -> Subscription {
        let pending = self
            .billing
            .checkout
            .start_checkout(self.request(user_id, PaymentKind::InitialSubscription, None))
            .await
            .unwrap();
        self.billing
            .checkout
            .register_billing_key(&pending.order_id, "auth_card")
            .await
            .unwrap()
            .subscription
            .unwrap()
    }

    pub async fn subscription(&self, subscription: &Subscription) -> Subscription {
        use learnhub_billing::BillingStore;
        self.store
            .subscription(subscription.id)
            .await
            .unwrap()
            .unwrap()
    }

    /// Pull the next billing date into the past so the next run picks it up
    pub async fn make_due(&self, subscription: &Subscription) -> Subscription {
        let mut current = self.subscription(subscription).await;
        current.next_billing_date = Some(OffsetDateTime::now_utc() - time::Duration::minutes(1));
        current.next_retry_at = None;
        self.store.replace_subscription(current.clone()).unwrap();
        current
    }
}

pub fn recurring_coupon(code: &str, percent: i32, months: i32) -> DiscountCoupon {
    DiscountCoupon {
        id: CouponId::new(),
        code: code.to_string(),
        discount_percent: percent,
        flat_discount_krw: 0,
        flat_discount_usd: 0,
        recurring_type: RecurringType::Recurring,
        recurring_months: Some(months),
        max_recurring_uses: None,
        one_time_use_only: false,
        active: true,
        expires_at: None,
    }
}

pub fn webhook(event_id: &str, event_type: &str, data: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "eventId": event_id,
        "eventType": event_type,
        "data": data,
    })
}
