//! Gateway webhook signatures
//!
//! Header format: `x-gateway-signature: t=<unix seconds>,v1=<hex>`, where the
//! signature is HMAC-SHA256 over `"{t}.{raw body}"` keyed with the shared
//! webhook secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::{Duration, OffsetDateTime};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Signature header is malformed")]
    Malformed,
    #[error("Signature timestamp is outside the tolerance window")]
    Expired,
    #[error("Signature does not match")]
    Mismatch,
    #[error("HMAC initialization failed")]
    HmacInitFailed,
}

/// Verifies signed webhook deliveries
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"[REDACTED]")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: &str, tolerance: Duration) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            tolerance,
        }
    }

    /// Check a header value against the raw body at `now`
    pub fn verify(
        &self,
        header: &str,
        body: &[u8],
        now: OffsetDateTime,
    ) -> Result<(), SignatureError> {
        let (timestamp, provided) = parse_header(header)?;

        let age = now.unix_timestamp() - timestamp;
        if age.abs() > self.tolerance.whole_seconds() {
            return Err(SignatureError::Expired);
        }

        let expected = sign_payload(&self.secret, timestamp, body)?;
        if constant_time_compare(provided, &expected) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }
}

fn parse_header(header: &str) -> Result<(i64, &str), SignatureError> {
    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse::<i64>().map_err(|_| SignatureError::Malformed)?)
            }
            Some(("v1", value)) => signature = Some(value),
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(t), Some(v1)) if !v1.is_empty() => Ok((t, v1)),
        _ => Err(SignatureError::Malformed),
    }
}

/// Hex HMAC-SHA256 of `"{timestamp}.{body}"`
pub fn sign_payload(secret: &[u8], timestamp: i64, body: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::HmacInitFailed)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Compare `Authorization: Bearer <token>` against the configured token
pub fn bearer_token_matches(header: Option<&str>, expected: &str) -> bool {
    match header.and_then(|value| value.strip_prefix("Bearer ")) {
        Some(token) => constant_time_compare(token, expected),
        None => false,
    }
}

/// Constant-time string comparison
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        // Do a dummy comparison to avoid length-based timing attacks
        let dummy = vec![0u8; a.len()];
        let _ = a.as_bytes().ct_eq(&dummy);
        return false;
    }

    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-webhook-secret-that-is-long-enough";
    const BODY: &[u8] = br#"{"eventId":"evt_1","eventType":"charge.succeeded","data":{}}"#;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(SECRET, Duration::minutes(5))
    }

    fn header_at(timestamp: i64, body: &[u8]) -> String {
        let sig = sign_payload(SECRET.as_bytes(), timestamp, body).unwrap();
        format!("t={},v1={}", timestamp, sig)
    }

    #[test]
    fn test_valid_signature_accepted() {
        let now = OffsetDateTime::now_utc();
        let header = header_at(now.unix_timestamp(), BODY);
        assert_eq!(verifier().verify(&header, BODY, now), Ok(()));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let now = OffsetDateTime::now_utc();
        let header = header_at(now.unix_timestamp(), BODY);
        let tampered = br#"{"eventId":"evt_1","eventType":"charge.succeeded","data":{"amount":1}}"#;
        assert_eq!(
            verifier().verify(&header, tampered, now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_stale_signature_rejected() {
        let now = OffsetDateTime::now_utc();
        let header = header_at(now.unix_timestamp() - 301, BODY);
        assert_eq!(
            verifier().verify(&header, BODY, now),
            Err(SignatureError::Expired)
        );

        let header = header_at(now.unix_timestamp() - 299, BODY);
        assert_eq!(verifier().verify(&header, BODY, now), Ok(()));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let now = OffsetDateTime::now_utc();
        let sig = sign_payload(b"another-secret", now.unix_timestamp(), BODY).unwrap();
        let header = format!("t={},v1={}", now.unix_timestamp(), sig);
        assert_eq!(
            verifier().verify(&header, BODY, now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_malformed_headers() {
        let now = OffsetDateTime::now_utc();
        for header in ["", "t=abc,v1=00", "v1=00", "t=1700000000", "t=1700000000,v1="] {
            assert_eq!(
                verifier().verify(header, BODY, now),
                Err(SignatureError::Malformed),
                "header {:?}",
                header
            );
        }
    }

    #[test]
    fn test_bearer_token() {
        let token = "settlement-token-with-at-least-32-chars";
        assert!(bearer_token_matches(Some(&format!("Bearer {}", token)), token));
        assert!(!bearer_token_matches(Some(token), token));
        assert!(!bearer_token_matches(Some("Bearer short"), token));
        assert!(!bearer_token_matches(None, token));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "abcd"));
    }
}
