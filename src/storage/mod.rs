//! Pluggable key-value persistence for token state.
//!
//! Storage is best-effort: every operation can fail (quota, poisoned
//! backend, missing directory) and callers swallow and log. The in-memory
//! machine stays authoritative; storage only has to be good enough to
//! survive a restart and to carry the cross-instance lock record.

mod db;
pub mod keys;
mod memory;
mod token_state;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Minimal string key-value port shared by all storage backends.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

pub use db::RedbStore;
pub use memory::MemoryStore;
pub use token_state::{
    clear_persisted_state, persist_token_state, restore_token_state, PersistedTokenState,
};
