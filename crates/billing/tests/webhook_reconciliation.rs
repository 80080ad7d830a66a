//! Gateway webhook intake and idempotent reconciliation

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use common::{webhook, Harness, Script};
use learnhub_billing::{
    BillingEventType, BillingStore, PaymentKind, PaymentStatus, WebhookOutcome,
};
use learnhub_shared::UserId;

/// A subscription checkout whose confirmation timed out
async fn pending_after_timeout(h: &Harness, user: UserId) -> String {
    h.gateway.script_charge(Script::Timeout);
    h.gateway.script_lookup(Script::Timeout);
    let pending = h
        .billing
        .checkout
        .start_checkout(h.request(user, PaymentKind::InitialSubscription, None))
        .await
        .unwrap();
    assert!(h
        .billing
        .checkout
        .confirm_checkout(&pending.order_id, "pk_1", 9_900)
        .await
        .is_err());
    pending.order_id
}

#[tokio::test]
async fn test_duplicate_success_delivery_pays_once() {
    let h = Harness::new();
    let user = UserId::new();
    let order_id = pending_after_timeout(&h, user).await;

    let payload = webhook(
        "evt_1",
        "charge.succeeded",
        serde_json::json!({"orderId": order_id, "paymentKey": "pk_1", "amount": 9900}),
    );

    let (_, inserted) = h.billing.webhooks.ingest(&payload).await.unwrap();
    assert!(inserted);
    let (_, inserted) = h.billing.webhooks.ingest(&payload).await.unwrap();
    assert!(!inserted);

    assert_eq!(
        h.billing.webhooks.handle("evt_1").await.unwrap(),
        WebhookOutcome::Applied
    );
    assert_eq!(
        h.billing.webhooks.handle("evt_1").await.unwrap(),
        WebhookOutcome::AlreadyProcessed
    );

    // the same capture announced again under a new event id
    let redelivery = webhook(
        "evt_2",
        "charge.succeeded",
        serde_json::json!({"orderId": order_id, "paymentKey": "pk_1", "amount": 9900}),
    );
    h.billing.webhooks.ingest(&redelivery).await.unwrap();
    h.billing.webhooks.handle("evt_2").await.unwrap();

    let payment = h.store.payment_by_order(&order_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Paid);
    assert_eq!(h.audit.count_of(BillingEventType::PaymentSucceeded), 1);
    assert_eq!(h.store.subscriptions_for_user(user).unwrap().len(), 1);
    assert_eq!(h.audit.count_of(BillingEventType::SubscriptionActivated), 1);
}

#[tokio::test]
async fn test_success_webhook_with_wrong_amount_fails_payment() {
    let h = Harness::new();
    let order_id = pending_after_timeout(&h, UserId::new()).await;

    let payload = webhook(
        "evt_bad",
        "charge.succeeded",
        serde_json::json!({"orderId": order_id, "paymentKey": "pk_1", "amount": 100}),
    );
    h.billing.webhooks.ingest(&payload).await.unwrap();
    assert_eq!(
        h.billing.webhooks.handle("evt_bad").await.unwrap(),
        WebhookOutcome::Applied
    );

    let payment = h.store.payment_by_order(&order_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(h.audit.count_of(BillingEventType::IntegrityViolation), 1);
    assert!(h.store.webhook_event("evt_bad").await.unwrap().unwrap().processed);
}

#[tokio::test]
async fn test_failure_after_success_is_ignored() {
    let h = Harness::new();
    let pending = h
        .billing
        .checkout
        .start_checkout(h.request(UserId::new(), PaymentKind::OneTime, None))
        .await
        .unwrap();
    h.billing
        .checkout
        .confirm_checkout(&pending.order_id, "pk_1", 9_900)
        .await
        .unwrap();

    let payload = webhook(
        "evt_late",
        "charge.failed",
        serde_json::json!({"orderId": pending.order_id, "code": "REJECT", "message": "late"}),
    );
    h.billing.webhooks.ingest(&payload).await.unwrap();
    h.billing.webhooks.handle("evt_late").await.unwrap();

    let payment = h.store.payment_by_order(&pending.order_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Paid);
}

#[tokio::test]
async fn test_failure_webhook_fails_pending() {
    let h = Harness::new();
    let order_id = pending_after_timeout(&h, UserId::new()).await;

    let payload = webhook(
        "evt_fail",
        "charge.failed",
        serde_json::json!({"orderId": order_id, "code": "EXCEED_MAX_AMOUNT", "message": "limit"}),
    );
    h.billing.webhooks.ingest(&payload).await.unwrap();
    h.billing.webhooks.handle("evt_fail").await.unwrap();

    let payment = h.store.payment_by_order(&order_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.failure_reason.as_deref(), Some("EXCEED_MAX_AMOUNT: limit"));
}

#[tokio::test]
async fn test_success_on_failed_payment_alerts() {
    let h = Harness::new();
    let order_id = pending_after_timeout(&h, UserId::new()).await;
    h.billing.webhooks
        .ingest(&webhook(
            "evt_fail",
            "charge.failed",
            serde_json::json!({"orderId": order_id, "code": "REJECT", "message": "no"}),
        ))
        .await
        .unwrap();
    h.billing.webhooks.handle("evt_fail").await.unwrap();

    h.billing.webhooks
        .ingest(&webhook(
            "evt_ok",
            "charge.succeeded",
            serde_json::json!({"orderId": order_id, "paymentKey": "pk_1", "amount": 9900}),
        ))
        .await
        .unwrap();
    h.billing.webhooks.handle("evt_ok").await.unwrap();

    let payment = h.store.payment_by_order(&order_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(h.audit.count_of(BillingEventType::IntegrityViolation), 1);
}

#[tokio::test]
async fn test_refund_and_cancel_notices() {
    let h = Harness::new();
    let paid = h
        .billing
        .checkout
        .start_checkout(h.request(UserId::new(), PaymentKind::OneTime, None))
        .await
        .unwrap();
    h.billing
        .checkout
        .confirm_checkout(&paid.order_id, "pk_1", 9_900)
        .await
        .unwrap();
    let abandoned = h
        .billing
        .checkout
        .start_checkout(h.request(UserId::new(), PaymentKind::OneTime, None))
        .await
        .unwrap();

    h.billing.webhooks
        .ingest(&webhook("evt_r", "charge.refunded", serde_json::json!({"orderId": paid.order_id})))
        .await
        .unwrap();
    h.billing.webhooks
        .ingest(&webhook(
            "evt_c",
            "charge.cancelled",
            serde_json::json!({"orderId": abandoned.order_id, "reason": "expired"}),
        ))
        .await
        .unwrap();

    let summary = h.billing.webhooks.sweep().await.unwrap();
    assert_eq!(summary.handled, 2);
    assert_eq!(summary.failed, 0);

    let refunded = h.store.payment_by_order(&paid.order_id).await.unwrap().unwrap();
    assert_eq!(refunded.status, PaymentStatus::Refunded);
    let cancelled = h.store.payment_by_order(&abandoned.order_id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, PaymentStatus::Cancelled);
    assert_eq!(h.audit.count_of(BillingEventType::PaymentRefunded), 1);
}

#[tokio::test]
async fn test_unknown_type_is_marked_processed() {
    let h = Harness::new();
    h.billing.webhooks
        .ingest(&webhook("evt_x", "payout.paid", serde_json::json!({})))
        .await
        .unwrap();

    assert_eq!(
        h.billing.webhooks.handle("evt_x").await.unwrap(),
        WebhookOutcome::Applied
    );
    assert!(h.store.webhook_event("evt_x").await.unwrap().unwrap().processed);
}

#[tokio::test]
async fn test_unprocessable_event_stays_queued() {
    let h = Harness::new();
    h.billing.webhooks
        .ingest(&webhook(
            "evt_orphan",
            "charge.succeeded",
            serde_json::json!({"orderId": "no-such-order", "paymentKey": "pk", "amount": 1}),
        ))
        .await
        .unwrap();

    let summary = h.billing.webhooks.sweep().await.unwrap();
    assert_eq!(summary.failed, 1);

    let event = h.store.webhook_event("evt_orphan").await.unwrap().unwrap();
    assert!(!event.processed);
    assert_eq!(event.attempts, 1);
    assert!(event.last_error.is_some());
}

#[tokio::test]
async fn test_malformed_delivery_rejected_at_intake() {
    let h = Harness::new();
    let err = h
        .billing
        .webhooks
        .ingest(&serde_json::json!({"type": "charge.succeeded"}))
        .await
        .unwrap_err();
    assert!(matches!(err, learnhub_billing::BillingError::InvalidInput(_)));
}

#[tokio::test]
async fn test_purge_keeps_recent_events() {
    let h = Harness::new();
    h.billing.webhooks
        .ingest(&webhook("evt_new", "payout.paid", serde_json::json!({})))
        .await
        .unwrap();

    assert_eq!(h.billing.webhooks.purge().await.unwrap(), 0);
    assert!(h.store.webhook_event("evt_new").await.unwrap().is_some());
}
