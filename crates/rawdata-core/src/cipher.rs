//! Optional symmetric encryption of message segments.
//!
//! When both a secret passphrase and a salt are configured, a single
//! AES-256-GCM key is derived once with PBKDF2-HMAC-SHA256 and the
//! passphrase/salt material is wiped immediately afterwards. Without both,
//! the cipher is a passthrough.
//!
//! # Ciphertext Layout
//!
//! ```text
//! [12-byte random IV][AES-GCM ciphertext + 16-byte tag]
//! ```
//!
//! Every call to [`PayloadCipher::maybe_encrypt`] draws a fresh IV, so the
//! manifest and entry segments of one message are independent ciphertexts.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::fmt;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// PBKDF2 iteration count used for key derivation.
pub const KEY_DERIVATION_ITERATIONS: u32 = 65_536;

/// Length of the random initialization vector prefixed to each ciphertext.
pub const IV_LEN: usize = 12;

const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Payload encryption, enabled only when a key was derived.
///
/// Read-only after construction and safe to share across worker threads.
pub struct PayloadCipher {
    cipher: Option<Aes256Gcm>,
}

impl PayloadCipher {
    /// A cipher that passes every payload through unchanged.
    pub fn disabled() -> Self {
        Self { cipher: None }
    }

    /// Derive the key from a configured secret and salt.
    ///
    /// Encryption is enabled only when both are present and non-empty. If
    /// exactly one is configured a warning is logged and encryption stays
    /// disabled. The secret and salt strings are zeroed before returning.
    pub fn from_secret(secret: Option<String>, salt: Option<String>) -> Self {
        Self::with_iterations(secret, salt, KEY_DERIVATION_ITERATIONS)
    }

    /// Like [`from_secret`](Self::from_secret) with an explicit PBKDF2 round count.
    pub fn with_iterations(secret: Option<String>, salt: Option<String>, iterations: u32) -> Self {
        let secret = secret.map(Zeroizing::new).filter(|s| !s.is_empty());
        let salt = salt.map(Zeroizing::new).filter(|s| !s.is_empty());

        match (secret, salt) {
            (Some(secret), Some(salt)) => {
                let mut key_bytes = Zeroizing::new([0u8; KEY_LEN]);
                pbkdf2_hmac::<Sha256>(
                    secret.as_bytes(),
                    salt.as_bytes(),
                    iterations,
                    &mut *key_bytes,
                );
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*key_bytes));
                info!("Payload encryption enabled (AES-256-GCM)");
                Self {
                    cipher: Some(cipher),
                }
            }
            (None, None) => {
                debug!("No encryption secret configured, payloads are not encrypted");
                Self::disabled()
            }
            (secret, _) => {
                warn!(
                    "Encryption misconfigured: {} is set but {} is missing, payloads are NOT encrypted",
                    if secret.is_some() { "secret" } else { "salt" },
                    if secret.is_some() { "salt" } else { "secret" },
                );
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypt with a fresh IV, or return the input unchanged when disabled.
    pub fn maybe_encrypt(&self, plaintext: Vec<u8>) -> Result<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext);
        };

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
            .map_err(|e| Error::Cipher(format!("encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt bytes produced by [`maybe_encrypt`](Self::maybe_encrypt).
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| Error::Cipher("no encryption key configured".to_string()))?;

        if data.len() < IV_LEN + TAG_LEN {
            return Err(Error::Cipher(format!(
                "ciphertext too short: {} bytes",
                data.len()
            )));
        }

        let (iv, ciphertext) = data.split_at(IV_LEN);
        cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|e| Error::Cipher(format!("decryption failed: {e}")))
    }
}

impl fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadCipher")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
