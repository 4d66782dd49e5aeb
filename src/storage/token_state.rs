//! Best-effort persistence of the lifecycle state.
//!
//! Mirrors the machine's data model onto three keys per token kind. Every
//! storage failure is logged and swallowed; restore degrades field by
//! field instead of failing as a whole.

use tracing::warn;

use super::{keys, KeyValueStore};
use crate::types::{TokenContext, TokenKind, TokenState};

/// What restore found, field by field.
///
/// Fields are independent: a corrupt timestamp yields `None` for that
/// field without discarding the rest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedTokenState {
    pub expires_at: Option<i64>,
    pub last_refresh_attempt: Option<i64>,
    pub state: Option<TokenState>,
}

/// Persist the current state and context.
///
/// `idle` has no session to remember; it removes all keys instead of
/// writing. `None` numeric fields remove their key so a later restore
/// sees them as absent.
pub fn persist_token_state(
    store: &dyn KeyValueStore,
    kind: TokenKind,
    state: TokenState,
    context: &TokenContext,
) {
    if state == TokenState::Idle {
        clear_persisted_state(store, kind);
        return;
    }

    set_or_log(store, &keys::state(kind), state.as_str());
    write_optional(store, &keys::expires_at(kind), context.expires_at);
    write_optional(store, &keys::last_refresh(kind), context.last_refresh_attempt);
}

/// Read back whatever survives in storage.
pub fn restore_token_state(store: &dyn KeyValueStore, kind: TokenKind) -> PersistedTokenState {
    PersistedTokenState {
        expires_at: read_number(store, &keys::expires_at(kind)),
        last_refresh_attempt: read_number(store, &keys::last_refresh(kind)),
        state: read_or_log(store, &keys::state(kind)).and_then(|s| TokenState::parse(&s)),
    }
}

/// Remove all persisted keys for this kind.
pub fn clear_persisted_state(store: &dyn KeyValueStore, kind: TokenKind) {
    remove_or_log(store, &keys::state(kind));
    remove_or_log(store, &keys::expires_at(kind));
    remove_or_log(store, &keys::last_refresh(kind));
}

fn write_optional(store: &dyn KeyValueStore, key: &str, value: Option<i64>) {
    match value {
        Some(v) => set_or_log(store, key, &v.to_string()),
        None => remove_or_log(store, key),
    }
}

fn set_or_log(store: &dyn KeyValueStore, key: &str, value: &str) {
    if let Err(e) = store.set(key, value) {
        warn!(key = %key, error = %e, "Failed to persist token state");
    }
}

fn remove_or_log(store: &dyn KeyValueStore, key: &str) {
    if let Err(e) = store.remove(key) {
        warn!(key = %key, error = %e, "Failed to remove persisted token state");
    }
}

fn read_or_log(store: &dyn KeyValueStore, key: &str) -> Option<String> {
    match store.get(key) {
        Ok(value) => value,
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to read persisted token state");
            None
        }
    }
}

/// Non-numeric values count as absent.
fn read_number(store: &dyn KeyValueStore, key: &str) -> Option<i64> {
    read_or_log(store, key).and_then(|s| s.parse().ok())
}
