//! token-manager - Client-side auth session lifecycle management
//!
//! This crate keeps a cookie-based auth session alive with:
//! - An explicit token state machine (pure transitions, no IO)
//! - Best-effort persistence across restarts (redb or in-memory)
//! - Proactive refresh ahead of expiry via a heartbeat task
//! - Cross-instance coordination so one rotating refresh cookie is
//!   redeemed exactly once (TTL lock + broadcast of the outcome)
//! - A consumer facade that forces logout after repeated refresh failures
//!
//! One [`TokenService`] manages one token kind; instances sharing a
//! storage namespace and a [`BroadcastBus`] coordinate automatically.

pub mod bus;
pub mod config;
pub mod heartbeat;
pub mod lock;
pub mod machine;
pub mod refresh;
pub mod service;
pub mod storage;
#[cfg(test)]
pub mod testutil;
pub mod types;
pub mod unified;

pub use bus::BroadcastBus;
pub use config::Config;
pub use service::{ServiceError, Subscription, TokenService};
pub use storage::{KeyValueStore, MemoryStore, RedbStore, StoreError};
pub use types::{RefreshOutcome, TokenContext, TokenEvent, TokenKind, TokenState};
pub use unified::UnifiedTokenService;
