//! Storage key layout.
//!
//! Keys are namespaced by token kind so the legacy buyer/producer sessions
//! and the unified session can coexist in one store. The refresh lock key
//! is shared across kinds: at most one refresh runs at a time regardless
//! of audience.

use crate::types::TokenKind;

/// Cross-instance refresh lock record (JSON).
pub const REFRESH_LOCK: &str = "auth_refresh_lock";

/// Persisted lifecycle state name, e.g. "authenticated".
pub fn state(kind: TokenKind) -> String {
    format!("{}_auth_state", kind.as_str())
}

/// Expiry timestamp, decimal epoch milliseconds.
pub fn expires_at(kind: TokenKind) -> String {
    format!("{}_auth_expires_at", kind.as_str())
}

/// Last refresh attempt timestamp, decimal epoch milliseconds.
pub fn last_refresh(kind: TokenKind) -> String {
    format!("{}_auth_last_refresh", kind.as_str())
}
