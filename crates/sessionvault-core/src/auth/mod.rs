//! Session material and the secrets that protect it.
//!
//! This module provides:
//! - `Session`: a complete authenticated identity with its tokens and expiry
//! - `RedactedUser`: the token-free projection sent to the UI process
//! - `KeySource`: resolution of the store encryption secret (env or OS keychain)

pub mod keys;
pub mod session;

pub use keys::{EncryptionSecret, KeySource, ENCRYPTION_KEY_ENV};
pub use session::{RedactedUser, Session, SessionError, UserIdentity, DEFAULT_REFRESH_MARGIN_SECS};
