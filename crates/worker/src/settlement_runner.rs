//! Scheduled settlement
//!
//! Overlapping ticks are skipped here. Row claims in the store already keep
//! two runs from charging the same subscription, this only avoids wasted work
//! when a run outlasts its interval.

use std::sync::Arc;

use learnhub_billing::{SettlementJob, SettlementSummary};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct SettlementRunner {
    job: SettlementJob,
    running: Arc<Mutex<()>>,
}

impl SettlementRunner {
    pub fn new(job: SettlementJob) -> Self {
        Self {
            job,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Run once unless a previous run is still in progress
    pub async fn tick(&self) -> Option<SettlementSummary> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("Previous settlement run still in progress, skipping tick");
            return None;
        };

        match self.job.run().await {
            Ok(summary) => {
                for item in &summary.errors {
                    warn!(
                        subscription_id = %item.subscription_id,
                        error = %item.error,
                        "Renewal aborted"
                    );
                }
                info!(
                    attempted = summary.attempted,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    expired = summary.expired,
                    "Scheduled settlement finished"
                );
                Some(summary)
            }
            Err(e) => {
                error!(error = %e, "Scheduled settlement failed");
                None
            }
        }
    }
}
