//! sessionvault core library.
//!
//! Client-side authentication and session persistence for a desktop
//! application that delegates identity to a remote auth service:
//!
//! - `store`: encrypted, atomically-written credential store and the
//!   string storage adapter the provider client reads through
//! - `api`: the identity provider seam and its HTTPS client
//! - `manager`: the serialized session state machine
//! - `bridge`: the UI ↔ privileged process protocol
//!
//! Raw tokens and key material stay inside the privileged process; only
//! [`auth::RedactedUser`] views cross the bridge.

pub mod api;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod manager;
pub mod store;

pub use api::{HttpIdentityProvider, IdentityProvider, ProviderError};
pub use auth::{EncryptionSecret, KeySource, RedactedUser, Session};
pub use bridge::{BridgeClient, BridgeError, BridgeServer};
pub use config::Config;
pub use error::AuthError;
pub use manager::{
    AuthIntent, IntentOutcome, ManagerOptions, SessionChange, SessionEvent, SessionHandle,
    SessionManager, SessionPhase,
};
pub use store::{CredentialStore, SessionStorage, StorageAdapter};
