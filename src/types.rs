//! Core domain types for the token lifecycle.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which authentication audience a session belongs to.
///
/// `Unified` is the current single-session flow; `Buyer` and `Producer`
/// are the legacy per-audience flows kept for compatibility. The kind
/// namespaces persisted keys and selects the refresh endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    #[default]
    Unified,
    Buyer,
    Producer,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Unified => "unified",
            TokenKind::Buyer => "buyer",
            TokenKind::Producer => "producer",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenState {
    #[default]
    Idle,
    Authenticating,
    Authenticated,
    Expiring,
    Refreshing,
    Error,
}

impl TokenState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenState::Idle => "idle",
            TokenState::Authenticating => "authenticating",
            TokenState::Authenticated => "authenticated",
            TokenState::Expiring => "expiring",
            TokenState::Refreshing => "refreshing",
            TokenState::Error => "error",
        }
    }

    /// Parse a persisted state name. Unknown names yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(TokenState::Idle),
            "authenticating" => Some(TokenState::Authenticating),
            "authenticated" => Some(TokenState::Authenticated),
            "expiring" => Some(TokenState::Expiring),
            "refreshing" => Some(TokenState::Refreshing),
            "error" => Some(TokenState::Error),
            _ => None,
        }
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable context carried alongside the state. Timestamps are epoch
/// milliseconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenContext {
    /// Reason for the most recent login or refresh failure.
    pub error_message: Option<String>,
    pub expires_at: Option<i64>,
    pub last_refresh_attempt: Option<i64>,
    /// Consecutive refresh failures since the last successful
    /// authentication.
    pub refresh_failure_count: u32,
}

/// Events driving the lifecycle machine.
///
/// `expires_in` values are seconds of validity granted by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    LoginStarted,
    LoginSucceeded { expires_in: u64 },
    LoginFailed { reason: String },
    RefreshRequested,
    RefreshSucceeded { expires_in: u64 },
    RefreshFailed { reason: String },
    Expired,
    Logout,
}

/// Result of a refresh attempt, whether performed locally or adopted from
/// another instance.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Success { expires_in: u64 },
    Failure { error: String },
}

impl RefreshOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RefreshOutcome::Success { .. })
    }

    /// The outcome reported when waiting on another instance times out.
    pub fn timeout() -> Self {
        RefreshOutcome::Failure {
            error: "timeout".to_string(),
        }
    }
}
