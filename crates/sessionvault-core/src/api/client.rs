//! HTTPS client for a GoTrue-compatible identity service.
//!
//! Only `{user id, email, access token, refresh token, expiry}` is taken
//! from provider responses; everything else in the payload is dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

use super::error::RequestKind;
use super::{IdentityProvider, ProviderError};
use crate::auth::session::SessionPayload;
use crate::auth::{Session, UserIdentity};
use crate::store::{SessionStorage, SESSION_KEY};

/// HTTP request timeout in seconds when none is configured
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;

/// Header carrying the public API key on every request
const API_KEY_HEADER: &str = "apikey";

/// Identity provider client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpIdentityProvider {
    client: Client,
    base_url: String,
    api_key: String,
    storage: Option<Arc<dyn SessionStorage>>,
}

impl HttpIdentityProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_timeout(
            base_url,
            api_key,
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            storage: None,
        })
    }

    /// Read persisted sessions through `storage` in [`get_session`](IdentityProvider::get_session).
    pub fn with_storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
            .header(header::ACCEPT, "application/json")
    }

    /// Check if response is successful, returning a classified error if not.
    async fn check_response(
        kind: RequestKind,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ProviderError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            debug!(%status, ?kind, "Identity provider returned an error");
            Err(ProviderError::from_status(kind, status, &body))
        }
    }

    async fn send(kind: RequestKind, request: RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Network(e)
            }
        })?;
        Self::check_response(kind, response).await
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ProviderError> {
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }

    /// Sessions the provider hands out must be complete and not yet expired.
    fn into_session(payload: SessionPayload) -> Result<Session, ProviderError> {
        payload
            .into_issued_session()
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn sign_up(&self, email: &str, password: &str) -> Result<Option<Session>, ProviderError> {
        let request = self
            .request(reqwest::Method::POST, "signup")
            .json(&json!({ "email": email, "password": password }));
        let response = Self::send(RequestKind::Public, request).await?;
        let body: serde_json::Value = Self::parse(response).await?;

        // Auto-confirmed projects answer with a session; others with just the user
        if body.get("access_token").is_some() {
            let payload: SessionPayload = serde_json::from_value(body)
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
            return Self::into_session(payload).map(Some);
        }
        Ok(None)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, ProviderError> {
        let request = self
            .request(reqwest::Method::POST, "token")
            .query(&[("grant_type", "password")])
            .json(&json!({ "email": email, "password": password }));
        let response = Self::send(RequestKind::PasswordGrant, request).await?;
        Self::into_session(Self::parse(response).await?)
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), ProviderError> {
        let request = self
            .request(reqwest::Method::POST, "logout")
            .bearer_auth(access_token);
        Self::send(RequestKind::Authenticated, request).await?;
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>, ProviderError> {
        let Some(storage) = self.storage.as_ref() else {
            return Ok(None);
        };
        let Some(payload) = storage.get_item(SESSION_KEY) else {
            return Ok(None);
        };
        match Session::from_payload(&payload) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(error = %e, "Persisted session payload unusable, ignoring");
                Ok(None)
            }
        }
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session, ProviderError> {
        let request = self
            .request(reqwest::Method::POST, "token")
            .query(&[("grant_type", "refresh_token")])
            .json(&json!({ "refresh_token": refresh_token }));
        let response = Self::send(RequestKind::RefreshGrant, request).await?;
        Self::into_session(Self::parse(response).await?)
    }

    async fn get_user(&self, access_token: &str) -> Result<UserIdentity, ProviderError> {
        let request = self
            .request(reqwest::Method::GET, "user")
            .bearer_auth(access_token);
        let response = Self::send(RequestKind::Authenticated, request).await?;
        Self::parse(response).await
    }

    async fn reset_password(&self, email: &str) -> Result<(), ProviderError> {
        let request = self
            .request(reqwest::Method::POST, "recover")
            .json(&json!({ "email": email }));
        Self::send(RequestKind::Public, request).await?;
        Ok(())
    }

    async fn update_password(
        &self,
        access_token: &str,
        new_password: &str,
    ) -> Result<UserIdentity, ProviderError> {
        let request = self
            .request(reqwest::Method::PUT, "user")
            .bearer_auth(access_token)
            .json(&json!({ "password": new_password }));
        let response = Self::send(RequestKind::Authenticated, request).await?;
        Self::parse(response).await
    }
}
