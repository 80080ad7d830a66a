//! Worker configuration

use std::env;

use learnhub_billing::{BillingConfig, BillingError};

/// Seconds-resolution cron expressions (sec min hour day month weekday)
const DEFAULT_SETTLEMENT_CRON: &str = "0 0 3 * * *";
const DEFAULT_WEBHOOK_SWEEP_CRON: &str = "0 * * * * *";
const DEFAULT_WEBHOOK_PURGE_CRON: &str = "0 30 4 * * *";

#[derive(Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub settlement_cron: String,
    pub webhook_sweep_cron: String,
    pub webhook_purge_cron: String,
    pub billing: BillingConfig,
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("database_url", &"[REDACTED]")
            .field("database_max_connections", &self.database_max_connections)
            .field("settlement_cron", &self.settlement_cron)
            .field("webhook_sweep_cron", &self.webhook_sweep_cron)
            .field("webhook_purge_cron", &self.webhook_purge_cron)
            .field("billing", &self.billing)
            .finish()
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, WorkerConfigError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| WorkerConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            settlement_cron: cron_or("SETTLEMENT_CRON", DEFAULT_SETTLEMENT_CRON)?,
            webhook_sweep_cron: cron_or("WEBHOOK_SWEEP_CRON", DEFAULT_WEBHOOK_SWEEP_CRON)?,
            webhook_purge_cron: cron_or("WEBHOOK_PURGE_CRON", DEFAULT_WEBHOOK_PURGE_CRON)?,
            billing: BillingConfig::from_env()?,
        })
    }
}

fn cron_or(name: &'static str, default: &str) -> Result<String, WorkerConfigError> {
    let value = env::var(name).unwrap_or_else(|_| default.to_string());
    // tokio-cron-scheduler expects six fields, seconds first
    if value.split_whitespace().count() != 6 {
        return Err(WorkerConfigError::InvalidSchedule(name));
    }
    Ok(value)
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("{0} must be a six-field cron expression")]
    InvalidSchedule(&'static str),
    #[error("Billing configuration: {0}")]
    Billing(#[from] BillingError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 7] = [
        "DATABASE_URL",
        "BILLING_KEY_ENCRYPTION_KEY",
        "GATEWAY_SECRET_KEY",
        "GATEWAY_WEBHOOK_SECRET",
        "SETTLEMENT_CRON",
        "WEBHOOK_SWEEP_CRON",
        "WEBHOOK_PURGE_CRON",
    ];

    fn setup() {
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var(
            "BILLING_KEY_ENCRYPTION_KEY",
            "a1b2c3d4e5f6789012345678901234567890abcdef1234567890abcdef123456",
        );
        env::set_var("GATEWAY_SECRET_KEY", "test_sk_example");
        env::set_var(
            "GATEWAY_WEBHOOK_SECRET",
            "test-webhook-secret-that-is-long-enough",
        );
    }

    fn cleanup() {
        for name in VARS {
            env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_default_schedules() {
        setup();
        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.settlement_cron, "0 0 3 * * *");
        assert_eq!(config.webhook_sweep_cron, "0 * * * * *");
        assert_eq!(config.webhook_purge_cron, "0 30 4 * * *");
        cleanup();
    }

    #[test]
    #[serial]
    fn test_five_field_cron_rejected() {
        setup();
        env::set_var("SETTLEMENT_CRON", "0 3 * * *");
        assert!(matches!(
            WorkerConfig::from_env(),
            Err(WorkerConfigError::InvalidSchedule("SETTLEMENT_CRON"))
        ));
        cleanup();
    }

    #[test]
    #[serial]
    fn test_database_url_required() {
        setup();
        env::remove_var("DATABASE_URL");
        assert!(matches!(
            WorkerConfig::from_env(),
            Err(WorkerConfigError::Missing("DATABASE_URL"))
        ));
        cleanup();
    }
}
