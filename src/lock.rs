//! Cross-instance refresh lock.
//!
//! At most one instance redeems the refresh cookie at a time; the cookie
//! rotates on use, so a second concurrent redemption would invalidate the
//! session. The lock is advisory: a JSON record under a fixed storage key,
//! valid for a TTL, with outcomes fanned out over the broadcast bus so
//! non-holders adopt the result without a second network call.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::bus::{BroadcastBus, RefreshSignal, SignalKind};
use crate::config::Config;
use crate::machine::now_ms;
use crate::storage::{keys, KeyValueStore};
use crate::types::RefreshOutcome;

/// Behavior when the lock record cannot be written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageFailurePolicy {
    /// Refuse acquisition; refreshes stall until storage recovers.
    FailClosed,
    /// Treat acquisition as successful; risks a duplicate refresh.
    #[default]
    FailOpen,
}

/// The persisted lock record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    instance_id: String,
    timestamp: i64,
}

type SharedOutcome = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Advisory TTL lock coordinating refreshes across instances.
///
/// Construction never fails; a broken store degrades per the configured
/// [`StorageFailurePolicy`] at acquisition time, and a missing bus leaves
/// waiters with only their timeout.
pub struct RefreshLock {
    bus: Option<Arc<BroadcastBus>>,
    held: AtomicBool,
    instance_id: String,
    pending_wait: Mutex<Option<SharedOutcome>>,
    policy: StorageFailurePolicy,
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    wait_timeout: Duration,
}

impl RefreshLock {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        bus: Option<Arc<BroadcastBus>>,
        config: &Config,
    ) -> Self {
        let policy = if config.policy.lock_fail_closed {
            StorageFailurePolicy::FailClosed
        } else {
            StorageFailurePolicy::FailOpen
        };
        Self {
            bus,
            held: AtomicBool::new(false),
            instance_id: uuid::Uuid::new_v4().to_string(),
            pending_wait: Mutex::new(None),
            policy,
            store,
            ttl: Duration::from_millis(config.timing.lock_ttl_ms),
            wait_timeout: Duration::from_millis(config.timing.lock_wait_timeout_ms),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Try to become the refreshing instance.
    ///
    /// Reacquiring while already the holder renews the record's timestamp.
    /// A stale, corrupt or unreadable record is taken over. On acquisition
    /// a `refresh_start` signal is broadcast.
    pub fn try_acquire(&self) -> bool {
        if let Some(record) = self.read_record() {
            if record.instance_id != self.instance_id {
                if !self.is_stale(&record) {
                    debug!(holder = %record.instance_id, "Refresh lock held by another instance");
                    self.held.store(false, Ordering::SeqCst);
                    return false;
                }
                debug!(holder = %record.instance_id, "Taking over stale refresh lock");
            }
        }

        let written = self.write_own_record();
        let acquired = written || self.policy == StorageFailurePolicy::FailOpen;
        self.held.store(acquired, Ordering::SeqCst);
        if acquired {
            self.publish(RefreshSignal::start(&self.instance_id));
        }
        acquired
    }

    /// Release the lock if this instance holds it. Another instance's
    /// record is left untouched; releasing without holding is a no-op.
    pub fn release(&self) {
        if let Some(record) = self.read_record() {
            if record.instance_id == self.instance_id {
                if let Err(e) = self.store.remove(keys::REFRESH_LOCK) {
                    warn!(error = %e, "Failed to remove refresh lock record");
                }
            }
        }
        self.held.store(false, Ordering::SeqCst);
    }

    /// Whether this instance currently holds the lock.
    ///
    /// Falls back to the last acquisition result when no record can be
    /// read (fail-open acquisitions leave no record behind).
    pub fn is_held(&self) -> bool {
        match self.read_record() {
            Some(record) => record.instance_id == self.instance_id && !self.is_stale(&record),
            None => self.held.load(Ordering::SeqCst),
        }
    }

    /// Whether a different instance holds a live lock.
    pub fn is_other_instance_refreshing(&self) -> bool {
        self.read_record()
            .is_some_and(|r| r.instance_id != self.instance_id && !self.is_stale(&r))
    }

    /// Broadcast a successful refresh and release the lock.
    pub fn notify_success(&self, expires_in: u64) {
        self.publish(RefreshSignal::success(&self.instance_id, expires_in));
        self.release();
    }

    /// Broadcast a failed refresh and release the lock.
    pub fn notify_failure(&self, error: &str) {
        self.publish(RefreshSignal::fail(&self.instance_id, error));
        self.release();
    }

    /// Wait for another instance's refresh outcome.
    ///
    /// Resolves with the first success or failure signal from a different
    /// instance, or with [`RefreshOutcome::timeout`] after the configured
    /// wait. Calls overlapping an unresolved wait share one future and one
    /// bus subscription; without a bus the wait can only time out.
    pub fn wait_for_result(&self) -> impl Future<Output = RefreshOutcome> + Send + 'static {
        let mut pending = lock(&self.pending_wait);
        if let Some(fut) = pending.as_ref() {
            if fut.peek().is_none() {
                return fut.clone();
            }
        }

        let fut = Self::await_result(
            self.bus.as_ref().map(|b| b.subscribe()),
            self.instance_id.clone(),
            self.wait_timeout,
        )
        .boxed()
        .shared();
        *pending = Some(fut.clone());
        fut
    }

    async fn await_result(
        rx: Option<broadcast::Receiver<RefreshSignal>>,
        own_id: String,
        wait_timeout: Duration,
    ) -> RefreshOutcome {
        let listen = async move {
            let mut rx = match rx {
                Some(rx) => rx,
                None => return std::future::pending().await,
            };
            loop {
                match rx.recv().await {
                    Ok(signal) if signal.instance_id == own_id => continue,
                    Ok(signal) => match signal.kind {
                        SignalKind::RefreshStart => continue,
                        SignalKind::RefreshSuccess => {
                            return RefreshOutcome::Success {
                                expires_in: signal.expires_in.unwrap_or(0),
                            }
                        }
                        SignalKind::RefreshFail => {
                            return RefreshOutcome::Failure {
                                error: signal
                                    .error
                                    .unwrap_or_else(|| "Refresh failed".to_string()),
                            }
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Refresh signal receiver lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => return std::future::pending().await,
                }
            }
        };

        match tokio::time::timeout(wait_timeout, listen).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!("Timed out waiting for another instance's refresh");
                RefreshOutcome::timeout()
            }
        }
    }

    fn read_record(&self) -> Option<LockRecord> {
        let raw = match self.store.get(keys::REFRESH_LOCK) {
            Ok(raw) => raw?,
            Err(e) => {
                debug!(error = %e, "Failed to read refresh lock record");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(error = %e, "Discarding corrupt refresh lock record");
                None
            }
        }
    }

    fn is_stale(&self, record: &LockRecord) -> bool {
        // Saturating: the record's timestamp is foreign input.
        now_ms().saturating_sub(record.timestamp) > self.ttl.as_millis() as i64
    }

    fn write_own_record(&self) -> bool {
        let record = LockRecord {
            instance_id: self.instance_id.clone(),
            timestamp: now_ms(),
        };
        let raw = match serde_json::to_string(&record) {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        match self.store.set(keys::REFRESH_LOCK, &raw) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to write refresh lock record");
                false
            }
        }
    }

    fn publish(&self, signal: RefreshSignal) {
        if let Some(bus) = &self.bus {
            bus.publish(signal);
        }
    }
}

impl Drop for RefreshLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
