//! In-process broadcast channel for refresh coordination signals.
//!
//! Instances sharing one process (windows over one runtime) share the bus
//! via `Arc`. Instances in separate processes coordinate through the lock
//! record alone; the lock treats a missing bus as "no broadcast available"
//! and waiters fall back to their timeout.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// What a refresh signal announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    RefreshStart,
    RefreshSuccess,
    RefreshFail,
}

/// A coordination signal published by the refreshing instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshSignal {
    /// Failure reason, set for `RefreshFail`.
    pub error: Option<String>,
    /// Seconds of validity granted, set for `RefreshSuccess`.
    pub expires_in: Option<u64>,
    /// Publisher's instance id; receivers drop their own signals.
    pub instance_id: String,
    pub kind: SignalKind,
}

impl RefreshSignal {
    pub fn start(instance_id: &str) -> Self {
        Self {
            error: None,
            expires_in: None,
            instance_id: instance_id.to_string(),
            kind: SignalKind::RefreshStart,
        }
    }

    pub fn success(instance_id: &str, expires_in: u64) -> Self {
        Self {
            error: None,
            expires_in: Some(expires_in),
            instance_id: instance_id.to_string(),
            kind: SignalKind::RefreshSuccess,
        }
    }

    pub fn fail(instance_id: &str, error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            expires_in: None,
            instance_id: instance_id.to_string(),
            kind: SignalKind::RefreshFail,
        }
    }
}

/// Fan-out broadcast of [`RefreshSignal`]s to every subscribed instance.
pub struct BroadcastBus {
    tx: broadcast::Sender<RefreshSignal>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self { tx }
    }

    /// Publish to all current subscribers. Signals published while nobody
    /// listens are dropped.
    pub fn publish(&self, signal: RefreshSignal) {
        if self.tx.send(signal).is_err() {
            debug!("Refresh signal published with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshSignal> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}
