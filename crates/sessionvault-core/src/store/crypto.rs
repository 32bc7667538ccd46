//! Authenticated encryption for store records.
//!
//! Keys are derived from the configured secret with Argon2id and a per-file
//! salt. Records are sealed with XChaCha20-Poly1305 under a fresh random
//! nonce, with the key id and record name bound in as associated data.

use std::fmt;

use argon2::Argon2;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::StoreError;
use crate::auth::EncryptionSecret;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const SALT_SIZE: usize = 16;

/// Prefix of the associated data for every record
const AD_LABEL: &[u8] = b"sessionvault:";

/// Derived 256-bit record key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
    key_id: String,
}

impl EncryptionKey {
    /// Derive a key from `secret` and `salt` using Argon2id defaults.
    pub fn derive(
        secret: &EncryptionSecret,
        salt: &[u8],
        key_id: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let mut bytes = [0u8; KEY_SIZE];
        Argon2::default()
            .hash_password_into(secret.expose(), salt, &mut bytes)
            .map_err(|e| StoreError::Crypto(format!("key derivation failed: {}", e)))?;
        Ok(Self {
            bytes,
            key_id: key_id.into(),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Seal `plaintext` for the record `name`. Returns `(nonce, ciphertext)`.
    pub fn seal(&self, name: &str, plaintext: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>), StoreError> {
        let nonce = random_bytes::<NONCE_SIZE>();
        let aad = self.associated_data(name);
        let ciphertext = self
            .cipher()
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| StoreError::Crypto("encryption failed".to_string()))?;
        Ok((nonce, ciphertext))
    }

    /// Open a record sealed by [`seal`](Self::seal) under the same key and name.
    pub fn open(&self, name: &str, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, StoreError> {
        if nonce.len() != NONCE_SIZE {
            return Err(StoreError::Crypto(format!(
                "nonce must be {} bytes, got {}",
                NONCE_SIZE,
                nonce.len()
            )));
        }
        let aad = self.associated_data(name);
        self.cipher()
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| StoreError::Crypto("authentication failed".to_string()))
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.bytes))
    }

    fn associated_data(&self, name: &str) -> Vec<u8> {
        let mut aad = Vec::with_capacity(AD_LABEL.len() + self.key_id.len() + 1 + name.len());
        aad.extend_from_slice(AD_LABEL);
        aad.extend_from_slice(self.key_id.as_bytes());
        aad.push(b':');
        aad.extend_from_slice(name.as_bytes());
        aad
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key_id", &self.key_id)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
