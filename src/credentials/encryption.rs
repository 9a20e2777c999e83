//! AES-256-GCM encryption for credential tokens.
//!
//! Each token is sealed separately under a fresh random nonce. The nonce is
//! prepended to the ciphertext and tag, and the whole blob is base64-encoded,
//! so a stored value can be opened with nothing but the blob and the key.
//!
//! ```text
//! base64( nonce[12] || ciphertext[n] || tag[16] )
//! ```

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;
use thiserror::Error;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Cipher failures. None of the variants carry plaintext or key material.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption key must be {KEY_SIZE} bytes (256 bits): {0}")]
    InvalidKey(String),

    #[error("refusing to encrypt an empty value")]
    EmptyInput,

    #[error("malformed ciphertext: {0}")]
    MalformedInput(String),

    #[error("plaintext could not be sealed")]
    SealFailed,

    #[error("ciphertext failed authentication (wrong key or tampered data)")]
    AuthenticationFailed,
}

/// Symmetric token cipher keyed with a fixed 256-bit secret.
///
/// Holds only the immutable AES key schedule, so a single instance can be
/// shared across threads behind an `Arc`.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Builds a cipher from raw key bytes.
    ///
    /// # Errors
    /// * `InvalidKey` - if `key` is not exactly 32 bytes
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != KEY_SIZE {
            return Err(CipherError::InvalidKey(format!("got {} bytes", key.len())));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;

        Ok(Self { cipher })
    }

    /// Builds a cipher from a base64-encoded key, the form used in config.
    ///
    /// # Errors
    /// * `InvalidKey` - if the value is not base64 or does not decode to 32 bytes
    pub fn from_base64_key(key_base64: &str) -> Result<Self, CipherError> {
        let key_bytes = BASE64
            .decode(key_base64.trim())
            .map_err(|e| CipherError::InvalidKey(format!("not valid base64: {}", e)))?;

        Self::new(&key_bytes)
    }

    /// Generates a fresh random key, base64-encoded.
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        BASE64.encode(key)
    }

    /// Encrypts `plaintext` into a self-contained base64 blob.
    ///
    /// # Security
    /// - Uses a cryptographically secure random nonce (never reuse)
    /// - Authenticated encryption (tampering detected)
    ///
    /// # Errors
    /// * `EmptyInput` - `plaintext` is empty
    /// * `SealFailed` - the AEAD refused to seal the value
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        if plaintext.is_empty() {
            return Err(CipherError::EmptyInput);
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        // Output already carries the tag appended to the ciphertext
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::SealFailed)?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);

        Ok(BASE64.encode(blob))
    }

    /// Decrypts a blob produced by [`TokenCipher::encrypt`].
    ///
    /// # Errors
    /// * `MalformedInput` - not base64, shorter than nonce + tag, or not UTF-8
    /// * `AuthenticationFailed` - wrong key, corruption or tampering
    pub fn decrypt(&self, blob: &str) -> Result<String, CipherError> {
        let data = BASE64
            .decode(blob)
            .map_err(|e| CipherError::MalformedInput(format!("not valid base64: {}", e)))?;

        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CipherError::MalformedInput(format!(
                "expected at least {} bytes, got {}",
                NONCE_SIZE + TAG_SIZE,
                data.len()
            )));
        }

        let (nonce_bytes, sealed) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, sealed)
            .map_err(|_| CipherError::AuthenticationFailed)?;

        String::from_utf8(plaintext)
            .map_err(|_| CipherError::MalformedInput("decrypted data is not valid UTF-8".into()))
    }
}
