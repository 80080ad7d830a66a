//! Billing engine configuration
//!
//! Loaded once at process start from environment variables. Secrets are
//! validated here so a misconfigured process refuses to start instead of
//! failing on the first charge.

use std::str::FromStr;

use crate::error::{BillingError, BillingResult};

/// Known insecure placeholder keys that must never reach production
const INSECURE_KEYS: &[&str] = &[
    "0000000000000000000000000000000000000000000000000000000000000000",
    "1111111111111111111111111111111111111111111111111111111111111111",
    "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
];

/// Minimum length for the webhook signing secret
const MIN_WEBHOOK_SECRET_LEN: usize = 32;

/// Payment gateway connection settings
#[derive(Clone)]
pub struct GatewayConfig {
    /// Base URL of the gateway REST API
    pub api_base: String,
    /// Secret API key (sent as HTTP Basic username)
    pub secret_key: String,
    /// Per-request timeout
    pub timeout: std::time::Duration,
    /// How many times to re-query an order after an indeterminate outcome
    pub lookup_attempts: usize,
    /// Shared secret used to sign webhook deliveries
    pub webhook_secret: String,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("api_base", &self.api_base)
            .field("secret_key", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .field("lookup_attempts", &self.lookup_attempts)
            .field("webhook_secret", &"[REDACTED]")
            .finish()
    }
}

/// Retry policy for the daily settlement run
#[derive(Debug, Clone)]
pub struct SettlementPolicy {
    /// Consecutive failed renewal attempts before auto-renew is switched off
    pub max_consecutive_failures: i32,
    /// Delay before a failed renewal is retried
    pub retry_backoff: time::Duration,
    /// Maximum subscriptions charged in parallel (never two for the same subscription)
    pub concurrency: usize,
    /// How long a renewal claim stays valid before another run may take it over
    pub claim_lease: time::Duration,
    /// ACTIVE subscriptions this far past `end_date` expire even while a
    /// renewal is still unresolved
    pub lapse_grace: time::Duration,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            retry_backoff: time::Duration::hours(24),
            concurrency: 4,
            claim_lease: time::Duration::minutes(30),
            lapse_grace: time::Duration::days(3),
        }
    }
}

/// Retry and retention policy for the webhook queue
#[derive(Debug, Clone)]
pub struct WebhookPolicy {
    /// Unprocessed events older than this are no longer retried
    pub retry_window: time::Duration,
    /// Events older than this are purged
    pub retention: time::Duration,
    /// Maximum events handled per sweep
    pub sweep_batch: i64,
}

impl Default for WebhookPolicy {
    fn default() -> Self {
        Self {
            retry_window: time::Duration::hours(24),
            retention: time::Duration::days(90),
            sweep_batch: 50,
        }
    }
}

/// Complete billing configuration
#[derive(Clone)]
pub struct BillingConfig {
    /// AES-256 key for billing key envelopes
    pub encryption_key: [u8; 32],
    pub gateway: GatewayConfig,
    pub settlement: SettlementPolicy,
    pub webhooks: WebhookPolicy,
}

impl std::fmt::Debug for BillingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingConfig")
            .field("encryption_key", &"[REDACTED]")
            .field("gateway", &self.gateway)
            .field("settlement", &self.settlement)
            .field("webhooks", &self.webhooks)
            .finish()
    }
}

impl BillingConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let encryption_key = parse_encryption_key(&required("BILLING_KEY_ENCRYPTION_KEY")?)?;

        let webhook_secret = required("GATEWAY_WEBHOOK_SECRET")?;
        if webhook_secret.len() < MIN_WEBHOOK_SECRET_LEN {
            return Err(BillingError::Config(format!(
                "GATEWAY_WEBHOOK_SECRET must be at least {} characters",
                MIN_WEBHOOK_SECRET_LEN
            )));
        }

        let gateway = GatewayConfig {
            api_base: std::env::var("GATEWAY_API_BASE")
                .unwrap_or_else(|_| "https://api.tosspayments.com".to_string()),
            secret_key: required("GATEWAY_SECRET_KEY")?,
            timeout: std::time::Duration::from_millis(parse_or("GATEWAY_TIMEOUT_MS", 10_000u64)?),
            lookup_attempts: parse_or("GATEWAY_LOOKUP_ATTEMPTS", 3usize)?,
            webhook_secret,
        };

        let settlement = SettlementPolicy {
            max_consecutive_failures: parse_or("SETTLEMENT_MAX_CONSECUTIVE_FAILURES", 3i32)?,
            retry_backoff: time::Duration::hours(parse_or("SETTLEMENT_RETRY_BACKOFF_HOURS", 24i64)?),
            concurrency: parse_or("SETTLEMENT_CONCURRENCY", 4usize)?.max(1),
            claim_lease: time::Duration::minutes(parse_or("SETTLEMENT_CLAIM_LEASE_MINUTES", 30i64)?),
            lapse_grace: time::Duration::hours(parse_or("SETTLEMENT_LAPSE_GRACE_HOURS", 72i64)?),
        };
        if settlement.max_consecutive_failures < 1 {
            return Err(BillingError::Config(
                "SETTLEMENT_MAX_CONSECUTIVE_FAILURES must be at least 1".to_string(),
            ));
        }

        let webhooks = WebhookPolicy {
            retry_window: time::Duration::hours(parse_or("WEBHOOK_RETRY_WINDOW_HOURS", 24i64)?),
            retention: time::Duration::days(parse_or("WEBHOOK_RETENTION_DAYS", 90i64)?),
            sweep_batch: parse_or("WEBHOOK_SWEEP_BATCH", 50i64)?,
        };

        Ok(Self {
            encryption_key,
            gateway,
            settlement,
            webhooks,
        })
    }
}

/// Parse the vault key from its 64-character hex form
pub fn parse_encryption_key(hex_key: &str) -> BillingResult<[u8; 32]> {
    if hex_key.len() != 64 {
        return Err(BillingError::Config(
            "BILLING_KEY_ENCRYPTION_KEY must be exactly 64 hex characters (32 bytes)".to_string(),
        ));
    }

    if INSECURE_KEYS.contains(&hex_key.to_lowercase().as_str()) {
        return Err(BillingError::Config(
            "BILLING_KEY_ENCRYPTION_KEY is using a known insecure default value".to_string(),
        ));
    }

    let bytes = hex::decode(hex_key).map_err(|_| {
        BillingError::Config(
            "BILLING_KEY_ENCRYPTION_KEY must contain only hexadecimal characters".to_string(),
        )
    })?;

    bytes
        .try_into()
        .map_err(|_| BillingError::Config("BILLING_KEY_ENCRYPTION_KEY has wrong length".to_string()))
}

fn required(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{} not set", name)))
}

fn parse_or<T: FromStr>(name: &str, default: T) -> BillingResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VALID_KEY: &str = "a1b2c3d4e5f6789012345678901234567890abcdef1234567890abcdef123456";

    fn setup_minimal_env() {
        env::set_var("BILLING_KEY_ENCRYPTION_KEY", VALID_KEY);
        env::set_var("GATEWAY_SECRET_KEY", "test_sk_example");
        env::set_var(
            "GATEWAY_WEBHOOK_SECRET",
            "test-webhook-secret-that-is-long-enough",
        );
    }

    fn cleanup_env() {
        for name in [
            "BILLING_KEY_ENCRYPTION_KEY",
            "GATEWAY_SECRET_KEY",
            "GATEWAY_WEBHOOK_SECRET",
            "SETTLEMENT_MAX_CONSECUTIVE_FAILURES",
            "SETTLEMENT_CONCURRENCY",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    fn test_encryption_key_validation() {
        assert!(parse_encryption_key(VALID_KEY).is_ok());
        assert!(parse_encryption_key("abc123").is_err());
        assert!(parse_encryption_key(&"0".repeat(64)).is_err());
        assert!(parse_encryption_key(&"F".repeat(64)).is_err());
        assert!(parse_encryption_key(&format!("xy{}", &VALID_KEY[2..])).is_err());
    }

    #[test]
    #[serial]
    fn test_missing_key_refuses_to_start() {
        setup_minimal_env();
        env::remove_var("BILLING_KEY_ENCRYPTION_KEY");

        let result = BillingConfig::from_env();
        assert!(matches!(result, Err(BillingError::Config(_))));

        cleanup_env();
    }

    #[test]
    #[serial]
    fn test_defaults_and_overrides() {
        setup_minimal_env();
        env::set_var("SETTLEMENT_MAX_CONSECUTIVE_FAILURES", "5");
        env::set_var("SETTLEMENT_CONCURRENCY", "0");

        let config = BillingConfig::from_env().unwrap();
        assert_eq!(config.settlement.max_consecutive_failures, 5);
        assert_eq!(config.settlement.concurrency, 1);
        assert_eq!(config.settlement.lapse_grace, time::Duration::days(3));
        assert_eq!(config.webhooks.retry_window, time::Duration::hours(24));
        assert_eq!(config.gateway.lookup_attempts, 3);

        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("test_sk_example"));
        assert!(!rendered.contains("a1b2c3"));

        cleanup_env();
    }

    #[test]
    #[serial]
    fn test_invalid_threshold_rejected() {
        setup_minimal_env();
        env::set_var("SETTLEMENT_MAX_CONSECUTIVE_FAILURES", "many");
        assert!(BillingConfig::from_env().is_err());

        env::set_var("SETTLEMENT_MAX_CONSECUTIVE_FAILURES", "0");
        assert!(BillingConfig::from_env().is_err());

        cleanup_env();
    }
}
