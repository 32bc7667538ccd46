use std::fmt;

use serde::{Deserialize, Serialize};

use crate::auth::RedactedUser;
use crate::error::AuthError;

/// A single requested auth operation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthIntent {
    SignIn { email: String, password: String },
    SignUp { email: String, password: String },
    SignOut,
    ResetPassword { email: String },
    UpdatePassword {
        #[serde(rename = "newPassword")]
        new_password: String,
    },
    GetCurrentSession,
    RefreshSession,
}

impl AuthIntent {
    pub fn name(&self) -> &'static str {
        match self {
            AuthIntent::SignIn { .. } => "sign_in",
            AuthIntent::SignUp { .. } => "sign_up",
            AuthIntent::SignOut => "sign_out",
            AuthIntent::ResetPassword { .. } => "reset_password",
            AuthIntent::UpdatePassword { .. } => "update_password",
            AuthIntent::GetCurrentSession => "get_current_session",
            AuthIntent::RefreshSession => "refresh_session",
        }
    }
}

impl fmt::Debug for AuthIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthIntent::SignIn { email, .. } => f
                .debug_struct("SignIn")
                .field("email", email)
                .field("password", &"[REDACTED]")
                .finish(),
            AuthIntent::SignUp { email, .. } => f
                .debug_struct("SignUp")
                .field("email", email)
                .field("password", &"[REDACTED]")
                .finish(),
            AuthIntent::ResetPassword { email } => {
                f.debug_struct("ResetPassword").field("email", email).finish()
            }
            AuthIntent::UpdatePassword { .. } => f
                .debug_struct("UpdatePassword")
                .field("new_password", &"[REDACTED]")
                .finish(),
            AuthIntent::SignOut => f.write_str("SignOut"),
            AuthIntent::GetCurrentSession => f.write_str("GetCurrentSession"),
            AuthIntent::RefreshSession => f.write_str("RefreshSession"),
        }
    }
}

/// Successful result of an intent.
///
/// `warning` carries a non-fatal problem, such as a session that is live in
/// memory but could not be saved to disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntentOutcome {
    pub user: Option<RedactedUser>,
    pub warning: Option<AuthError>,
}

/// Coarse state of the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    SignedOut,
    Authenticating,
    Authenticated,
    Refreshing,
    SigningOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub enum SessionChange {
    /// Startup hydration settled (with or without a user)
    Hydrated,
    SignedIn,
    Refreshed,
    UserUpdated,
    SignedOut,
    /// Refresh was refused; the user must sign in again
    Expired,
}

/// Notification pushed to subscribers whenever the session changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionEvent {
    pub reason: SessionChange,
    pub user: Option<RedactedUser>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_wire_shape() {
        let intent = AuthIntent::UpdatePassword {
            new_password: "pw".into(),
        };
        let json = serde_json::to_string(&intent).unwrap();
        assert_eq!(json, r#"{"type":"updatePassword","newPassword":"pw"}"#);

        let parsed: AuthIntent =
            serde_json::from_str(r#"{"type":"signIn","email":"a@x.com","password":"pw"}"#).unwrap();
        assert_eq!(parsed.name(), "sign_in");
    }

    #[test]
    fn test_intent_debug_hides_passwords() {
        let intent = AuthIntent::SignIn {
            email: "a@x.com".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{:?}", intent);
        assert!(rendered.contains("a@x.com"));
        assert!(!rendered.contains("hunter2"));
    }
}
