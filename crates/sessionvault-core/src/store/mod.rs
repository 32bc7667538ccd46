//! Encrypted local persistence for session material.
//!
//! This module provides:
//! - `CredentialStore`: an encrypted, atomically-replaced key/value file
//! - `StorageAdapter`: the narrow string storage capability handed to the
//!   identity provider client
//!
//! Undecryptable or corrupt records read as absent; they never surface as
//! errors to the caller.

pub mod adapter;
pub mod credential_store;
pub mod crypto;

use thiserror::Error;

pub use adapter::{SessionStorage, StorageAdapter};
pub use credential_store::{CredentialStore, EncryptedRecord, SESSION_KEY, STORE_FILE};
pub use crypto::EncryptionKey;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}
