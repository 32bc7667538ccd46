use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Buffer before expiry at which a refresh is attempted (5 minutes)
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session field `{0}` is empty")]
    MissingField(&'static str),

    #[error("session already expired at {0}")]
    AlreadyExpired(i64),

    #[error("malformed session payload: {0}")]
    Malformed(String),
}

/// An authenticated identity and its token material.
///
/// A `Session` is always complete: construction fails rather than producing
/// a value with a missing user id, email or token. Tokens are opaque and
/// never interpreted here.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    user_id: String,
    email: String,
    access_token: String,
    refresh_token: String,
    expires_at: i64,
}

impl Session {
    /// Build a fresh session. The expiry must lie in the future.
    pub fn new(
        user_id: impl Into<String>,
        email: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: i64,
    ) -> Result<Self, SessionError> {
        let session = Self::complete(
            user_id.into(),
            email.into(),
            access_token.into(),
            refresh_token.into(),
            expires_at,
        )?;
        if session.is_expired() {
            return Err(SessionError::AlreadyExpired(expires_at));
        }
        Ok(session)
    }

    fn complete(
        user_id: String,
        email: String,
        access_token: String,
        refresh_token: String,
        expires_at: i64,
    ) -> Result<Self, SessionError> {
        for (name, value) in [
            ("user_id", &user_id),
            ("email", &email),
            ("access_token", &access_token),
            ("refresh_token", &refresh_token),
        ] {
            if value.trim().is_empty() {
                return Err(SessionError::MissingField(name));
            }
        }
        Ok(Self {
            user_id,
            email,
            access_token,
            refresh_token,
            expires_at,
        })
    }

    /// Parse the persisted/provider payload.
    ///
    /// Only completeness is checked: an expired session read back from disk
    /// is still returned so the caller can try to refresh it.
    pub fn from_payload(json: &str) -> Result<Self, SessionError> {
        let payload: SessionPayload =
            serde_json::from_str(json).map_err(|e| SessionError::Malformed(e.to_string()))?;
        payload.into_stored_session()
    }

    /// Serialize to the payload shape the provider client reads back.
    pub fn to_payload(&self) -> String {
        let payload = SessionPayload {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: Some(self.expires_at),
            expires_in: None,
            user: PayloadUser {
                id: self.user_id.clone(),
                email: Some(self.email.clone()),
            },
        };
        // A struct of strings and integers cannot fail to serialize
        serde_json::to_string(&payload).unwrap_or_default()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.expires_at
    }

    /// Check if the session will expire within `margin_secs` and should be refreshed
    pub fn needs_refresh(&self, margin_secs: i64) -> bool {
        Utc::now().timestamp() + margin_secs >= self.expires_at
    }

    pub fn seconds_until_expiry(&self) -> i64 {
        (self.expires_at - Utc::now().timestamp()).max(0)
    }

    /// Replace the email after the provider reports a profile change.
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        let email = email.into();
        if !email.trim().is_empty() {
            self.email = email;
        }
        self
    }

    /// Projection that is safe to hand to the UI process.
    pub fn redacted(&self) -> RedactedUser {
        RedactedUser {
            user_id: self.user_id.clone(),
            email: self.email.clone(),
            is_authenticated: true,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Session view without token material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct RedactedUser {
    pub user_id: String,
    pub email: String,
    pub is_authenticated: bool,
}

/// Identity fields the provider returns for user lookups and updates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Wire shape of a session as the provider returns and persists it.
/// Unknown fields (token_type, user metadata, ...) are dropped on parse.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SessionPayload {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    pub user: PayloadUser,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PayloadUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl SessionPayload {
    /// A session read back from storage; may already be expired.
    pub(crate) fn into_stored_session(self) -> Result<Session, SessionError> {
        let expires_at = self.resolve_expiry()?;
        Session::complete(
            self.user.id,
            self.user.email.unwrap_or_default(),
            self.access_token,
            self.refresh_token,
            expires_at,
        )
    }

    /// A session just issued by the provider; must still be valid.
    pub(crate) fn into_issued_session(self) -> Result<Session, SessionError> {
        let expires_at = self.resolve_expiry()?;
        Session::new(
            self.user.id,
            self.user.email.unwrap_or_default(),
            self.access_token,
            self.refresh_token,
            expires_at,
        )
    }

    fn resolve_expiry(&self) -> Result<i64, SessionError> {
        match (self.expires_at, self.expires_in) {
            (Some(at), _) => Ok(at),
            (None, Some(secs)) => Ok(Utc::now().timestamp() + secs),
            (None, None) => Err(SessionError::Malformed("no expiry".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_secs(secs: i64) -> i64 {
        Utc::now().timestamp() + secs
    }

    #[test]
    fn test_new_rejects_empty_fields() {
        let err = Session::new("u1", "", "at", "rt", in_secs(3600)).unwrap_err();
        assert_eq!(err, SessionError::MissingField("email"));

        let err = Session::new("u1", "a@x.com", "at", "  ", in_secs(3600)).unwrap_err();
        assert_eq!(err, SessionError::MissingField("refresh_token"));
    }

    #[test]
    fn test_new_rejects_past_expiry() {
        let past = in_secs(-10);
        let err = Session::new("u1", "a@x.com", "at", "rt", past).unwrap_err();
        assert_eq!(err, SessionError::AlreadyExpired(past));
    }

    #[test]
    fn test_payload_keeps_expired_sessions() {
        let json = format!(
            r#"{{"access_token":"at","refresh_token":"rt","expires_at":{},"user":{{"id":"u1","email":"a@x.com"}}}}"#,
            in_secs(-60)
        );
        let session = Session::from_payload(&json).unwrap();
        assert!(session.is_expired());
        assert_eq!(session.user_id(), "u1");
    }

    #[test]
    fn test_issued_session_must_be_live() {
        let json = format!(
            r#"{{"access_token":"at","refresh_token":"rt","expires_at":{},"user":{{"id":"u1","email":"a@x.com"}}}}"#,
            in_secs(-60)
        );
        let payload: SessionPayload = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            payload.into_issued_session(),
            Err(SessionError::AlreadyExpired(_))
        ));

        let payload: SessionPayload = serde_json::from_str(
            r#"{"access_token":"at","refresh_token":"rt","expires_in":3600,"user":{"id":"u1","email":"a@x.com"}}"#,
        )
        .unwrap();
        assert!(!payload.into_issued_session().unwrap().is_expired());
    }

    #[test]
    fn test_payload_ignores_extra_fields() {
        let json = r#"{
            "access_token": "at",
            "token_type": "bearer",
            "expires_in": 3600,
            "refresh_token": "rt",
            "user": {"id": "u1", "email": "a@x.com", "role": "authenticated"}
        }"#;
        let session = Session::from_payload(json).unwrap();
        assert!(!session.is_expired());
        assert!(!session.to_payload().contains("token_type"));
        assert!(!session.to_payload().contains("role"));
    }

    #[test]
    fn test_payload_missing_expiry_is_malformed() {
        let json = r#"{"access_token":"at","refresh_token":"rt","user":{"id":"u1","email":"a@x.com"}}"#;
        assert!(matches!(
            Session::from_payload(json),
            Err(SessionError::Malformed(_))
        ));
    }

    #[test]
    fn test_needs_refresh_inside_margin() {
        let session = Session::new("u1", "a@x.com", "at", "rt", in_secs(120)).unwrap();
        assert!(session.needs_refresh(DEFAULT_REFRESH_MARGIN_SECS));
        assert!(!session.needs_refresh(10));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let session = Session::new("u1", "a@x.com", "secret-at", "secret-rt", in_secs(60)).unwrap();
        let rendered = format!("{:?}", session);
        assert!(!rendered.contains("secret-at"));
        assert!(!rendered.contains("secret-rt"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn test_redacted_view_has_no_tokens() {
        let session = Session::new("u1", "a@x.com", "secret-at", "secret-rt", in_secs(60)).unwrap();
        let json = serde_json::to_string(&session.redacted()).unwrap();
        assert_eq!(json, r#"{"userId":"u1","email":"a@x.com","isAuthenticated":true}"#);
    }
}
