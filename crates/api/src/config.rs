//! Application configuration

use std::env;

use learnhub_billing::{BillingConfig, BillingError};

/// Minimum length for the settlement trigger bearer token
const MIN_TRIGGER_TOKEN_LEN: usize = 32;

/// Application configuration loaded from environment variables
#[derive(Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    /// Bearer token guarding `POST /internal/settlement/run`
    pub settlement_token: String,
    /// Maximum age of a signed webhook delivery
    pub webhook_tolerance: time::Duration,

    pub billing: BillingConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("database_url", &"[REDACTED]")
            .field("database_max_connections", &self.database_max_connections)
            .field("settlement_token", &"[REDACTED]")
            .field("webhook_tolerance", &self.webhook_tolerance)
            .field("billing", &self.billing)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let settlement_token = env::var("SETTLEMENT_TRIGGER_TOKEN")
            .map_err(|_| ConfigError::Missing("SETTLEMENT_TRIGGER_TOKEN"))?;
        if settlement_token.len() < MIN_TRIGGER_TOKEN_LEN {
            return Err(ConfigError::WeakSecret(
                "SETTLEMENT_TRIGGER_TOKEN must be at least 32 characters",
            ));
        }

        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),
            settlement_token,
            webhook_tolerance: time::Duration::seconds(
                env::var("WEBHOOK_SIGNATURE_TOLERANCE_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .unwrap_or(300),
            ),
            billing: BillingConfig::from_env()?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
    #[error("Billing configuration: {0}")]
    Billing(#[from] BillingError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn setup_minimal_config() {
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var(
            "SETTLEMENT_TRIGGER_TOKEN",
            "test-settlement-token-at-least-32-characters",
        );
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

    fn cleanup_config() {
        for name in [
            "DATABASE_URL",
            "SETTLEMENT_TRIGGER_TOKEN",
            "BILLING_KEY_ENCRYPTION_KEY",
            "GATEWAY_SECRET_KEY",
            "GATEWAY_WEBHOOK_SECRET",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_minimal_config_loads() {
        setup_minimal_config();
        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.webhook_tolerance, time::Duration::minutes(5));
        assert!(!format!("{:?}", config).contains("test-settlement-token"));
        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_short_trigger_token_rejected() {
        setup_minimal_config();
        env::set_var("SETTLEMENT_TRIGGER_TOKEN", "short");
        assert!(matches!(Config::from_env(), Err(ConfigError::WeakSecret(_))));
        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        setup_minimal_config();
        env::remove_var("DATABASE_URL");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_billing_errors_surface() {
        setup_minimal_config();
        env::remove_var("BILLING_KEY_ENCRYPTION_KEY");
        assert!(matches!(Config::from_env(), Err(ConfigError::Billing(_))));
        cleanup_config();
    }
}
