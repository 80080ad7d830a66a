//! Scheduled job wrappers over an in-memory engine

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::sync::Arc;

use learnhub_billing::{
    AuditLog, BillingConfig, BillingService, BillingStore, GatewayConfig, HttpGateway,
    MemoryAuditSink, MemoryBillingStore, SettlementPolicy, WebhookPolicy,
};
use learnhub_worker::{webhook_processor, SettlementRunner};
use serde_json::json;

fn billing() -> (BillingService, Arc<MemoryBillingStore>) {
    let config = BillingConfig {
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
    };
    let store = Arc::new(MemoryBillingStore::new());
    // Nothing in these tests reaches the gateway
    let gateway = Arc::new(HttpGateway::new(config.gateway.clone()).unwrap());
    let billing = BillingService::new(
        &config,
        store.clone(),
        gateway,
        AuditLog::new(Arc::new(MemoryAuditSink::new())),
    )
    .unwrap();
    (billing, store)
}

#[tokio::test]
async fn test_sweep_applies_queued_events() {
    let (billing, store) = billing();
    billing
        .webhooks
        .ingest(&json!({
            "eventId": "evt_worker_1",
            "eventType": "payout.created",
            "data": {},
        }))
        .await
        .unwrap();

    webhook_processor::process_webhook_queue(&billing.webhooks).await;

    let event = store.webhook_event("evt_worker_1").await.unwrap().unwrap();
    assert!(event.processed);
}

#[tokio::test]
async fn test_sweep_keeps_unapplied_events_queued() {
    let (billing, store) = billing();
    billing
        .webhooks
        .ingest(&json!({
            "eventId": "evt_worker_2",
            "eventType": "charge.succeeded",
            "data": { "orderId": "unknown-order", "paymentKey": "pk", "amount": 1000 },
        }))
        .await
        .unwrap();

    webhook_processor::process_webhook_queue(&billing.webhooks).await;

    let event = store.webhook_event("evt_worker_2").await.unwrap().unwrap();
    assert!(!event.processed);
    assert_eq!(event.attempts, 1);
    assert!(event.last_error.is_some());
}

#[tokio::test]
async fn test_cleanup_keeps_recent_events() {
    let (billing, store) = billing();
    billing
        .webhooks
        .ingest(&json!({
            "eventId": "evt_worker_3",
            "eventType": "payout.created",
            "data": {},
        }))
        .await
        .unwrap();

    webhook_processor::cleanup_old_webhooks(&billing.webhooks).await;

    assert!(store.webhook_event("evt_worker_3").await.unwrap().is_some());
}

#[tokio::test]
async fn test_settlement_tick_with_nothing_due() {
    let (billing, _store) = billing();
    let runner = SettlementRunner::new(billing.settlement.clone());

    let summary = runner.tick().await.unwrap();

    assert_eq!(summary.attempted, 0);
    assert_eq!(summary.expired, 0);
    assert!(summary.errors.is_empty());
}
