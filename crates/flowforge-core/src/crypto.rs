//! Column encryption for designated ledger fields.
//!
//! When `FLOWFORGE_MASTER_KEY` is configured, incident commands and loop
//! patterns are sealed with XChaCha20-Poly1305 before they reach SQLite.
//! The 24-byte nonce is generated per value and prepended to the
//! ciphertext; the whole blob is base64-encoded for storage in TEXT
//! columns. Values are sanitized *before* encryption, so a decrypted
//! column never yields raw secrets either.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::{Aead, OsRng};
use chacha20poly1305::{AeadCore, Key, KeyInit, XChaCha20Poly1305, XNonce};
use thiserror::Error;

/// Length of the hex-encoded master key (32 bytes).
pub const MASTER_KEY_HEX_LEN: usize = 64;

const NONCE_LEN: usize = 24;

/// Errors from column encryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The master key is not 64 hex characters.
    #[error("master key must be {MASTER_KEY_HEX_LEN} hex characters")]
    InvalidKey,

    /// Sealing a value failed.
    #[error("encrypt failed: {0}")]
    Encrypt(String),

    /// Opening a value failed (wrong key or corrupted blob).
    #[error("decrypt failed: {0}")]
    Decrypt(String),
}

/// Cipher bound to the configured master key.
#[derive(Clone)]
pub struct ColumnCipher {
    cipher: XChaCha20Poly1305,
}

impl std::fmt::Debug for ColumnCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnCipher").finish_non_exhaustive()
    }
}

impl ColumnCipher {
    /// Builds a cipher from the hex-encoded 32-byte master key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the key is not exactly
    /// 64 hex characters.
    pub fn from_hex_key(hex_key: &str) -> Result<Self, CryptoError> {
        let trimmed = hex_key.trim();
        if trimmed.len() != MASTER_KEY_HEX_LEN {
            return Err(CryptoError::InvalidKey);
        }
        let bytes = hex::decode(trimmed).map_err(|_| CryptoError::InvalidKey)?;
        let key = Key::from_slice(&bytes);
        Ok(Self {
            cipher: XChaCha20Poly1305::new(key),
        })
    }

    /// Seals `plaintext`, returning base64(nonce || ciphertext).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encrypt`] if the AEAD rejects the input.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(BASE64.encode(blob))
    }

    /// Opens a blob produced by [`Self::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decrypt`] on malformed base64, a truncated
    /// blob, or an authentication failure.
    pub fn decrypt(&self, blob: &str) -> Result<String, CryptoError> {
        let raw = BASE64
            .decode(blob.trim())
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(CryptoError::Decrypt("blob shorter than nonce".into()));
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let opened = self
            .cipher
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        String::from_utf8(opened).map_err(|e| CryptoError::Decrypt(e.to_string()))
    }
}

/// Encryption posture for designated ledger columns.
///
/// `Sealed` writes must encrypt or fail (fail-closed). `Plaintext` is only
/// reachable when no master key is configured and is logged at startup so
/// the downgrade is always explicit.
#[derive(Debug, Clone)]
pub enum EncryptionPolicy {
    /// Master key configured; designated columns are sealed.
    Sealed(ColumnCipher),
    /// No master key; values stored as (sanitized) plaintext.
    Plaintext,
}

impl EncryptionPolicy {
    /// Builds the policy from an optional master key value.
    ///
    /// # Errors
    ///
    /// Returns an error when a key is present but malformed; a malformed
    /// key must never silently downgrade to plaintext.
    pub fn from_master_key(master_key: Option<&str>) -> Result<Self, CryptoError> {
        match master_key {
            Some(key) if !key.trim().is_empty() => {
                Ok(Self::Sealed(ColumnCipher::from_hex_key(key)?))
            }
            _ => Ok(Self::Plaintext),
        }
    }

    /// Whether writes will be sealed.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        matches!(self, Self::Sealed(_))
    }

    /// Seals a value per policy. Plaintext policy passes through.
    ///
    /// # Errors
    ///
    /// With a configured key, any encryption failure propagates so the
    /// caller can abort the write.
    pub fn seal(&self, value: &str) -> Result<String, CryptoError> {
        match self {
            Self::Sealed(cipher) => cipher.encrypt(value),
            Self::Plaintext => Ok(value.to_string()),
        }
    }

    /// Opens a stored value per policy.
    ///
    /// # Errors
    ///
    /// Propagates decryption failures; plaintext policy passes through.
    pub fn open(&self, stored: &str) -> Result<String, CryptoError> {
        match self {
            Self::Sealed(cipher) => cipher.decrypt(stored),
            Self::Plaintext => Ok(stored.to_string()),
        }
    }
}
