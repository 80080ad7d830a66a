//! Billing key vault
//!
//! Encrypts gateway billing keys before they touch the database. Envelopes are
//! self-contained: `base64(version || nonce || ciphertext+tag)`, so they can be
//! decrypted in any order by any process holding the same key.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{BillingError, BillingResult};

/// Envelope format version. Bumped when the key generation changes.
const ENVELOPE_VERSION: u8 = 1;

const NONCE_LEN: usize = 12;

/// Tag length appended by AES-GCM
const TAG_LEN: usize = 16;

/// Symmetric vault for charge credentials
#[derive(Clone)]
pub struct BillingKeyVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for BillingKeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingKeyVault")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl BillingKeyVault {
    pub fn new(key: &[u8; 32]) -> BillingResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| BillingError::Config("invalid billing key vault key".to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypt a plaintext billing key into a storable envelope
    pub fn encrypt(&self, plain_credential: &str) -> BillingResult<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plain_credential.as_bytes())
            .map_err(|_| BillingError::Credential("encryption failed".to_string()))?;

        let mut envelope = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        envelope.push(ENVELOPE_VERSION);
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(envelope))
    }

    /// Decrypt an envelope. Fails closed: any corruption, tag mismatch, or
    /// foreign key generation yields an error and never partial plaintext.
    pub fn decrypt(&self, envelope: &str) -> BillingResult<String> {
        let raw = BASE64
            .decode(envelope.trim())
            .map_err(|_| BillingError::Credential("envelope is not valid base64".to_string()))?;

        if raw.len() < 1 + NONCE_LEN + TAG_LEN {
            return Err(BillingError::Credential("envelope is truncated".to_string()));
        }

        let (version, rest) = raw.split_at(1);
        if version[0] != ENVELOPE_VERSION {
            return Err(BillingError::Credential(format!(
                "unsupported envelope version {}",
                version[0]
            )));
        }

        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| BillingError::Credential("envelope failed authentication".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| BillingError::Credential("credential is not valid UTF-8".to_string()))
    }
}
