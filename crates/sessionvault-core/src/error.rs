//! Errors reported to callers of the session manager and across the bridge.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::ProviderError;
use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "code", content = "message")]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Could not reach the identity service: {0}")]
    NetworkFailure(String),

    #[error("Saved session could not be read")]
    StorageCorrupt,

    #[error("Cannot save session, you may be signed out next launch: {0}")]
    StorageIoFailure(String),

    #[error("Session expired. Please sign in again.")]
    SessionExpired,

    #[error("Not signed in")]
    Unauthorized,

    #[error("{0}")]
    Rejected(String),

    #[error("Session service unavailable")]
    Unavailable,
}

impl AuthError {
    /// Stable code used on the wire and in logs
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "InvalidCredentials",
            AuthError::NetworkFailure(_) => "NetworkFailure",
            AuthError::StorageCorrupt => "StorageCorrupt",
            AuthError::StorageIoFailure(_) => "StorageIoFailure",
            AuthError::SessionExpired => "SessionExpired",
            AuthError::Unauthorized => "Unauthorized",
            AuthError::Rejected(_) => "Rejected",
            AuthError::Unavailable => "Unavailable",
        }
    }

    /// Whether the user can simply try again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidCredentials | AuthError::NetworkFailure(_) | AuthError::Unavailable
        )
    }
}

impl From<ProviderError> for AuthError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidCredentials => AuthError::InvalidCredentials,
            ProviderError::Unauthorized => AuthError::Unauthorized,
            ProviderError::RefreshRevoked => AuthError::SessionExpired,
            ProviderError::Rejected(msg) => AuthError::Rejected(msg),
            ProviderError::Timeout => AuthError::NetworkFailure("request timed out".to_string()),
            ProviderError::RateLimited => {
                AuthError::NetworkFailure("rate limited, try again shortly".to_string())
            }
            ProviderError::Network(e) => AuthError::NetworkFailure(e.to_string()),
            ProviderError::ServerError(msg) | ProviderError::InvalidResponse(msg) => {
                AuthError::NetworkFailure(msg)
            }
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(e) => AuthError::StorageIoFailure(e.to_string()),
            StoreError::Crypto(msg) => AuthError::StorageIoFailure(msg),
            StoreError::Serialization(_) => AuthError::StorageCorrupt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_string(&AuthError::InvalidCredentials).unwrap();
        assert_eq!(json, r#"{"code":"InvalidCredentials"}"#);

        let json = serde_json::to_string(&AuthError::NetworkFailure("timeout".into())).unwrap();
        assert_eq!(json, r#"{"code":"NetworkFailure","message":"timeout"}"#);
    }

    #[test]
    fn test_provider_classification() {
        assert_eq!(AuthError::from(ProviderError::RefreshRevoked), AuthError::SessionExpired);
        assert_eq!(
            AuthError::from(ProviderError::InvalidCredentials),
            AuthError::InvalidCredentials
        );
        assert!(matches!(
            AuthError::from(ProviderError::Timeout),
            AuthError::NetworkFailure(_)
        ));
    }

    #[test]
    fn test_code_matches_tag() {
        let err = AuthError::StorageIoFailure("disk full".into());
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], err.code());
    }
}
