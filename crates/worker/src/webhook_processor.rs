//! Webhook queue processor
//!
//! Applies queued gateway notifications that the API only stored. Failed
//! events stay in the queue and are picked up again on the next tick until
//! they age out of the retry window.

use learnhub_billing::WebhookReconciler;
use tracing::{error, info, warn};

/// Process pending webhooks from the queue
pub async fn process_webhook_queue(reconciler: &WebhookReconciler) {
    let summary = match reconciler.sweep().await {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "Failed to sweep webhook queue");
            return;
        }
    };

    if summary.failed > 0 {
        warn!(
            handled = summary.handled,
            failed = summary.failed,
            "Some webhooks could not be applied, will retry"
        );
    }
}

/// Delete webhook events older than the retention period
pub async fn cleanup_old_webhooks(reconciler: &WebhookReconciler) {
    match reconciler.purge().await {
        Ok(deleted) => info!(deleted, "Webhook retention cleanup finished"),
        Err(e) => {
            error!(error = %e, "Failed to cleanup old webhooks");
        }
    }
}
