//! Shared helpers for unit tests.

use std::sync::Arc;

use crate::bus::BroadcastBus;
use crate::config::Config;
use crate::machine::now_ms;
use crate::storage::{KeyValueStore, MemoryStore, StoreError};
use crate::types::TokenContext;

pub fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

pub fn test_bus() -> Arc<BroadcastBus> {
    Arc::new(BroadcastBus::new())
}

/// Config pointing at a port nothing listens on, so a test that reaches
/// the network fails fast instead of hanging.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.api.base_url = "http://127.0.0.1:9".to_string();
    config.api.request_timeout_seconds = 1;
    config
}

/// Context whose expiry sits `offset_ms` away from now.
pub fn make_context(offset_ms: i64) -> TokenContext {
    TokenContext {
        expires_at: Some(now_ms() + offset_ms),
        ..TokenContext::default()
    }
}

/// Store whose every operation fails.
pub struct FailingStore;

impl FailingStore {
    pub fn new() -> Self {
        Self
    }
}

impl KeyValueStore for FailingStore {
    fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Backend("store offline".to_string()))
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
        Err(StoreError::Backend("store offline".to_string()))
    }

    fn remove(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Backend("store offline".to_string()))
    }
}
