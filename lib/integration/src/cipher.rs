//! Authenticated encryption for credential payloads.
//!
//! AES-256-GCM with a random 96-bit nonce. The stored form is
//! `nonce || ciphertext || tag`.

use crate::error::CredentialError;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flowforge_core::Result;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// Encrypts and decrypts credential payloads with one master key.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    /// Creates a cipher from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns an error unless the key is exactly 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self, CredentialError> {
        if key.len() != KEY_SIZE {
            return Err(CredentialError::InvalidKey {
                reason: format!("key must be {KEY_SIZE} bytes, got {}", key.len()),
            }
            .into());
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| CredentialError::InvalidKey {
            reason: e.to_string(),
        })?;
        Ok(Self { cipher })
    }

    /// Creates a cipher from a base64-encoded key.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not base64 or not 32 bytes long.
    pub fn from_base64(encoded: &str) -> Result<Self, CredentialError> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CredentialError::InvalidKey {
                reason: e.to_string(),
            })?;
        Self::new(&key)
    }

    /// Encrypts `plaintext` under a fresh nonce.
    ///
    /// # Errors
    ///
    /// Returns an error if the AEAD implementation fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CredentialError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext =
            self.cipher
                .encrypt(&nonce, plaintext)
                .map_err(|e| CredentialError::EncryptionFailed {
                    reason: e.to_string(),
                })?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(nonce.as_slice());
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    /// Decrypts a payload produced by [`CredentialCipher::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is truncated, was tampered with or was
    /// encrypted under another key.
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, CredentialError> {
        if payload.len() < NONCE_SIZE {
            return Err(CredentialError::DecryptionFailed { id: None }.into());
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::DecryptionFailed { id: None })?;
        Ok(plaintext)
    }
}
