//! Application state shared across all handlers

use std::sync::Arc;

use learnhub_billing::BillingService;
use sqlx::PgPool;

use crate::config::Config;
use crate::security::SignatureVerifier;

#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    /// Absent when the engine runs over an in-memory store
    pub pool: Option<PgPool>,
    pub config: Arc<Config>,
    pub webhook_verifier: SignatureVerifier,
}

impl AppState {
    pub fn new(billing: BillingService, pool: Option<PgPool>, config: Config) -> Self {
        let webhook_verifier = SignatureVerifier::new(
            &config.billing.gateway.webhook_secret,
            config.webhook_tolerance,
        );
        Self {
            billing: Arc::new(billing),
            pool,
            config: Arc::new(config),
            webhook_verifier,
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
