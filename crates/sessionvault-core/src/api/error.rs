use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Invalid login credentials")]
    InvalidCredentials,

    #[error("Unauthorized - access token rejected")]
    Unauthorized,

    #[error("Refresh token revoked or expired")]
    RefreshRevoked,

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Which request a failure came from; the same status means different
/// things for a password grant and a refresh grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    PasswordGrant,
    RefreshGrant,
    Authenticated,
    Public,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorBody {
    fn code(&self) -> Option<&str> {
        self.error_code.as_deref().or(self.error.as_deref())
    }

    fn text(&self) -> Option<&str> {
        self.error_description
            .as_deref()
            .or(self.msg.as_deref())
            .or(self.message.as_deref())
    }
}

impl ProviderError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(kind: RequestKind, status: reqwest::StatusCode, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let message = parsed
            .text()
            .map(Self::truncate_body)
            .unwrap_or_else(|| Self::truncate_body(body));
        let invalid_grant = parsed.code() == Some("invalid_grant")
            || parsed.code() == Some("invalid_credentials");

        match (status.as_u16(), kind) {
            (429, _) => ProviderError::RateLimited,
            (400 | 401, RequestKind::PasswordGrant) if invalid_grant || status.as_u16() == 401 => {
                ProviderError::InvalidCredentials
            }
            (400 | 401 | 403, RequestKind::RefreshGrant) => ProviderError::RefreshRevoked,
            (401 | 403, _) => ProviderError::Unauthorized,
            (500..=599, _) => ProviderError::ServerError(message),
            (400..=499, _) => ProviderError::Rejected(message),
            _ => ProviderError::InvalidResponse(format!("Status {}: {}", status, message)),
        }
    }

    /// Failures that say nothing about the session itself; retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_)
                | ProviderError::Timeout
                | ProviderError::RateLimited
                | ProviderError::ServerError(_)
        )
    }

    /// Failures meaning the tokens themselves are no longer accepted.
    pub fn is_revocation(&self) -> bool {
        matches!(
            self,
            ProviderError::RefreshRevoked
                | ProviderError::Unauthorized
                | ProviderError::InvalidCredentials
        )
    }
}
