//! Client side of the remote identity service.
//!
//! This module provides the `IdentityProvider` trait the session manager
//! drives, and `HttpIdentityProvider`, its HTTPS implementation for
//! GoTrue-compatible endpoints (`/auth/v1/...`).

pub mod client;
pub mod error;
pub mod provider;

pub use client::HttpIdentityProvider;
pub use error::ProviderError;
pub use provider::IdentityProvider;
