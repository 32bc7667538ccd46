use std::fmt;

use anyhow::{Context, Result};
use keyring::Entry;
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

const SERVICE_NAME: &str = "sessionvault";
const KEY_ACCOUNT: &str = "encryption-key";

/// Environment variable consulted before the OS keychain
pub const ENCRYPTION_KEY_ENV: &str = "SESSIONVAULT_ENCRYPTION_KEY";

/// Length of secrets generated by `init-key`
const GENERATED_SECRET_LEN: usize = 48;

/// Secret the store key is derived from. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionSecret(String);

impl EncryptionSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for EncryptionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionSecret([REDACTED])")
    }
}

/// Where the encryption secret comes from at startup.
pub struct KeySource;

impl KeySource {
    /// Resolve the secret from the environment, then the OS keychain.
    ///
    /// Missing everywhere is a hard error: the privileged process refuses to
    /// start rather than running without encryption at rest.
    pub fn resolve() -> Result<EncryptionSecret> {
        if let Some(secret) = Self::from_env() {
            debug!("Encryption secret taken from environment");
            return Ok(secret);
        }
        let secret = Self::from_keychain().with_context(|| {
            format!(
                "No encryption secret found: set {} or run `sessionvault init-key`",
                ENCRYPTION_KEY_ENV
            )
        })?;
        debug!("Encryption secret taken from OS keychain");
        Ok(secret)
    }

    fn from_env() -> Option<EncryptionSecret> {
        std::env::var(ENCRYPTION_KEY_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(EncryptionSecret::new)
    }

    /// Retrieve the secret from the OS keychain
    pub fn from_keychain() -> Result<EncryptionSecret> {
        let entry = Entry::new(SERVICE_NAME, KEY_ACCOUNT)
            .context("Failed to create keyring entry")?;
        let secret = entry
            .get_password()
            .context("Failed to retrieve encryption secret from keychain")?;
        Ok(EncryptionSecret::new(secret))
    }

    /// Generate a random secret and store it in the OS keychain
    pub fn generate_into_keychain() -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, KEY_ACCOUNT)
            .context("Failed to create keyring entry")?;
        let mut secret = Self::generate();
        entry
            .set_password(&secret)
            .context("Failed to store encryption secret in keychain")?;
        secret.zeroize();
        Ok(())
    }

    /// Check if the keychain already holds a secret
    pub fn has_keychain_secret() -> bool {
        Entry::new(SERVICE_NAME, KEY_ACCOUNT)
            .map(|entry| entry.get_password().is_ok())
            .unwrap_or(false)
    }

    fn generate() -> String {
        OsRng
            .sample_iter(&Alphanumeric)
            .take(GENERATED_SECRET_LEN)
            .map(char::from)
            .collect()
    }
}
