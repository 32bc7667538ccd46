use serde::{Deserialize, Serialize};

use crate::auth::RedactedUser;
use crate::error::AuthError;
use crate::manager::{AuthIntent, IntentOutcome, SessionEvent};

/// Correlation id reserved for replies to frames that could not be parsed
pub const UNCORRELATED_ID: u64 = 0;

/// UI → privileged process frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct BridgeRequest {
    pub id: u64,
    pub call: BridgeCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "kind", content = "intent", rename_all = "camelCase")]
pub enum BridgeCall {
    Intent(AuthIntent),
    Subscribe,
    Unsubscribe,
}

/// Reply to one request. Never carries token material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct BridgeResponse {
    pub id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<RedactedUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AuthError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<AuthError>,
}

impl BridgeResponse {
    pub fn from_result(id: u64, result: Result<IntentOutcome, AuthError>) -> Self {
        match result {
            Ok(outcome) => Self {
                id,
                success: true,
                user: outcome.user,
                error: None,
                warning: outcome.warning,
            },
            Err(error) => Self::failure(id, error),
        }
    }

    pub fn ok(id: u64) -> Self {
        Self {
            id,
            success: true,
            user: None,
            error: None,
            warning: None,
        }
    }

    pub fn failure(id: u64, error: AuthError) -> Self {
        Self {
            id,
            success: false,
            user: None,
            error: Some(error),
            warning: None,
        }
    }

    /// Back to the manager's result shape.
    pub fn into_result(self) -> Result<IntentOutcome, AuthError> {
        if self.success {
            Ok(IntentOutcome {
                user: self.user,
                warning: self.warning,
            })
        } else {
            Err(self
                .error
                .unwrap_or_else(|| AuthError::Rejected("request failed".to_string())))
        }
    }
}

/// Privileged process → UI frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeMessage {
    Response(BridgeResponse),
    Event(SessionEvent),
}
