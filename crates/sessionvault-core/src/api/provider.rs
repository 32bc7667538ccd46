use async_trait::async_trait;

use super::ProviderError;
use crate::auth::{Session, UserIdentity};

/// Remote identity service as seen by the session manager.
///
/// Implementations classify failures into [`ProviderError`] and never retry
/// on their own; retry policy belongs to the caller, which knows whether a
/// retry is safe in its current state.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Register an account. A session is returned only when the provider
    /// does not require email confirmation.
    async fn sign_up(&self, email: &str, password: &str) -> Result<Option<Session>, ProviderError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, ProviderError>;

    /// Revoke the session remotely.
    async fn sign_out(&self, access_token: &str) -> Result<(), ProviderError>;

    /// Session the client has persisted locally, if any. Never touches the network.
    async fn get_session(&self) -> Result<Option<Session>, ProviderError>;

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, ProviderError>;

    /// Look up the user behind an access token; used to validate a hydrated session.
    async fn get_user(&self, access_token: &str) -> Result<UserIdentity, ProviderError>;

    async fn reset_password(&self, email: &str) -> Result<(), ProviderError>;

    async fn update_password(
        &self,
        access_token: &str,
        new_password: &str,
    ) -> Result<UserIdentity, ProviderError>;
}
