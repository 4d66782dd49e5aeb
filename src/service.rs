//! Token lifecycle service for one token kind.
//!
//! Owns the state machine, persists every transition, runs the heartbeat
//! and coordinates refreshes with other instances through the lock. All
//! mutation goes through [`TokenService::dispatch`]; reads take a cheap
//! snapshot so callbacks and network calls never run under the state lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::BroadcastBus;
use crate::config::Config;
use crate::heartbeat::Heartbeat;
use crate::lock::RefreshLock;
use crate::machine;
use crate::refresh::RefreshClient;
use crate::storage::{clear_persisted_state, persist_token_state, restore_token_state, KeyValueStore};
use crate::types::{RefreshOutcome, TokenContext, TokenEvent, TokenKind, TokenState};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Observer invoked after every state change.
pub type AuthCallback = Arc<dyn Fn(TokenState, &TokenContext) + Send + Sync>;

/// Handle returned by [`TokenService::subscribe`]; dropping it removes
/// the callback.
pub struct Subscription {
    id: u64,
    service: Weak<TokenService>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(service) = self.service.upgrade() {
            lock(&service.subscribers).remove(&self.id);
        }
    }
}

struct Core {
    context: TokenContext,
    state: TokenState,
}

/// Manages the session lifecycle for one [`TokenKind`].
pub struct TokenService {
    config: Config,
    core: Mutex<Core>,
    heartbeat: Mutex<Option<Heartbeat>>,
    kind: TokenKind,
    lock: RefreshLock,
    next_subscriber_id: AtomicU64,
    refresh_client: RefreshClient,
    refresh_gate: tokio::sync::Mutex<()>,
    store: Arc<dyn KeyValueStore>,
    subscribers: Mutex<HashMap<u64, AuthCallback>>,
}

impl TokenService {
    /// Build a service, restore any persisted session and start the
    /// heartbeat. Must be called from within a Tokio runtime; the
    /// heartbeat task spawns immediately.
    pub fn new(
        kind: TokenKind,
        store: Arc<dyn KeyValueStore>,
        bus: Option<Arc<BroadcastBus>>,
        config: Config,
    ) -> Result<Arc<Self>, ServiceError> {
        let refresh_client = RefreshClient::new(&config.api)?;
        let lock = RefreshLock::new(Arc::clone(&store), bus, &config);

        let service = Arc::new(Self {
            core: Mutex::new(Core {
                context: TokenContext::default(),
                state: TokenState::Idle,
            }),
            heartbeat: Mutex::new(None),
            kind,
            lock,
            next_subscriber_id: AtomicU64::new(0),
            refresh_client,
            refresh_gate: tokio::sync::Mutex::new(()),
            store,
            subscribers: Mutex::new(HashMap::new()),
            config,
        });
        service.restore();
        service.start_heartbeat();
        Ok(service)
    }

    /// Rebuild the in-memory state from storage.
    ///
    /// A persisted session with a future expiry comes back as
    /// `authenticated`; one past expiry comes back as `expiring` so the
    /// next status check tries the refresh cookie. A session without an
    /// expiry is unusable and gets discarded.
    fn restore(&self) {
        let saved = restore_token_state(self.store.as_ref(), self.kind);
        let Some(state) = saved.state else {
            return;
        };
        let Some(expires_at) = saved.expires_at else {
            debug!(kind = %self.kind, state = %state, "Persisted session has no expiry; discarding");
            clear_persisted_state(self.store.as_ref(), self.kind);
            return;
        };

        let mut core = self.lock_core();
        core.context = TokenContext {
            error_message: None,
            expires_at: Some(expires_at),
            last_refresh_attempt: saved.last_refresh_attempt,
            refresh_failure_count: 0,
        };
        if machine::now_ms() >= expires_at {
            core.state = TokenState::Expiring;
            core.context.error_message = Some("Session expired".to_string());
            info!(kind = %self.kind, "Restored expired session; refresh pending");
        } else {
            core.state = TokenState::Authenticated;
            info!(kind = %self.kind, expires_at, "Restored authenticated session");
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let heartbeat = Heartbeat::new(
            Duration::from_millis(self.config.timing.heartbeat_interval_ms),
            move || {
                if let Some(service) = weak.upgrade() {
                    tokio::spawn(async move {
                        service.run_status_check().await;
                    });
                }
            },
        );
        heartbeat.start();
        *lock(&self.heartbeat) = Some(heartbeat);
    }

    /// Feed an event through the machine, persist and notify.
    ///
    /// Events the machine ignores in the current state change nothing and
    /// are logged at debug level only.
    pub fn dispatch(&self, event: TokenEvent) {
        let (state, context) = {
            let mut core = self.lock_core();
            let (next_state, next_context) = machine::transition(core.state, &core.context, &event);
            if next_state == core.state && next_context == core.context {
                debug!(kind = %self.kind, state = %core.state, ?event, "Event ignored in current state");
                return;
            }
            info!(kind = %self.kind, from = %core.state, to = %next_state, "Token state transition");
            core.state = next_state;
            core.context = next_context.clone();
            (next_state, next_context)
        };

        persist_token_state(self.store.as_ref(), self.kind, state, &context);
        self.notify(state, &context);
    }

    fn notify(&self, state: TokenState, context: &TokenContext) {
        let callbacks: Vec<AuthCallback> = lock(&self.subscribers).values().cloned().collect();
        for callback in callbacks {
            callback(state, context);
        }
    }

    /// Register a state observer. The callback fires immediately with the
    /// current state, then on every change until the handle drops.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(TokenState, &TokenContext) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let callback: AuthCallback = Arc::new(callback);
        lock(&self.subscribers).insert(id, Arc::clone(&callback));

        let (state, context) = self.snapshot();
        callback(state, &context);

        Subscription {
            id,
            service: Arc::downgrade(self),
        }
    }

    pub fn state(&self) -> TokenState {
        self.lock_core().state
    }

    pub fn context(&self) -> TokenContext {
        self.lock_core().context.clone()
    }

    pub fn snapshot(&self) -> (TokenState, TokenContext) {
        let core = self.lock_core();
        (core.state, core.context.clone())
    }

    /// Whether an unexpired session exists, refreshing included.
    pub fn has_valid_token(&self) -> bool {
        let core = self.lock_core();
        matches!(
            core.state,
            TokenState::Authenticated | TokenState::Expiring | TokenState::Refreshing
        ) && !machine::is_expired(&core.context)
    }

    pub fn can_make_api_calls(&self) -> bool {
        machine::can_make_api_calls(self.lock_core().state)
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    /// Shared HTTP client, cookie jar included.
    pub fn http_client(&self) -> &reqwest::Client {
        self.refresh_client.http_client()
    }

    pub fn instance_id(&self) -> &str {
        self.lock.instance_id()
    }

    pub fn begin_authentication(&self) {
        self.dispatch(TokenEvent::LoginStarted);
    }

    pub fn set_authenticated(&self, expires_in: u64) {
        self.dispatch(TokenEvent::LoginSucceeded { expires_in });
    }

    pub fn authentication_failed(&self, reason: &str) {
        self.dispatch(TokenEvent::LoginFailed {
            reason: reason.to_string(),
        });
    }

    /// Drop the session and wipe storage.
    pub fn clear_tokens(&self) {
        self.dispatch(TokenEvent::Logout);
        // Logout from idle is ignored by the machine; clear keys anyway.
        clear_persisted_state(self.store.as_ref(), self.kind);
    }

    /// Periodic check driven by the heartbeat.
    pub async fn run_status_check(&self) {
        let (state, context) = self.snapshot();
        match state {
            TokenState::Authenticated
                if machine::is_expired(&context)
                    || machine::needs_refresh(&context, self.refresh_margin_ms()) =>
            {
                debug!(kind = %self.kind, "Session near or past expiry");
                self.dispatch(TokenEvent::Expired);
                self.refresh().await;
            }
            TokenState::Expiring => {
                self.refresh().await;
            }
            _ => {}
        }
    }

    /// Refresh the session, coordinating with other instances.
    ///
    /// Only one refresh runs per instance at a time; latecomers queue on
    /// the gate and adopt the fresh result without a second network call.
    /// When another instance holds the cross-instance lock, this one
    /// dispatches into `refreshing` and waits for the holder's broadcast.
    /// Returns whether a usable session exists afterwards.
    pub async fn refresh(&self) -> bool {
        let _gate = self.refresh_gate.lock().await;

        let (state, context) = self.snapshot();
        match state {
            TokenState::Idle | TokenState::Authenticating => {
                debug!(kind = %self.kind, state = %state, "No session to refresh");
                return false;
            }
            TokenState::Error if context.expires_at.is_none() => {
                debug!(kind = %self.kind, "Failed login cannot be refreshed");
                return false;
            }
            TokenState::Authenticated
                if !machine::is_expired(&context)
                    && !machine::needs_refresh(&context, self.refresh_margin_ms()) =>
            {
                return true;
            }
            _ => {}
        }

        if !self.lock.try_acquire() {
            if self.lock.is_other_instance_refreshing() {
                debug!(kind = %self.kind, "Another instance is refreshing; waiting for its result");
                self.dispatch(TokenEvent::RefreshRequested);
                let outcome = self.lock.wait_for_result().await;
                return self.apply_refresh_outcome(outcome);
            }
            // The holder vanished between the acquire and the check, or
            // storage is down under a fail-closed policy.
            if !self.lock.try_acquire() {
                warn!(kind = %self.kind, "Refresh lock unavailable");
                return false;
            }
        }

        self.dispatch(TokenEvent::RefreshRequested);
        let outcome = self.refresh_client.execute_refresh(self.kind).await;
        match &outcome {
            RefreshOutcome::Success { expires_in } => self.lock.notify_success(*expires_in),
            RefreshOutcome::Failure { error } => self.lock.notify_failure(error),
        }
        self.apply_refresh_outcome(outcome)
    }

    fn apply_refresh_outcome(&self, outcome: RefreshOutcome) -> bool {
        match outcome {
            RefreshOutcome::Success { expires_in } => {
                self.dispatch(TokenEvent::RefreshSucceeded { expires_in });
                true
            }
            RefreshOutcome::Failure { error } => {
                self.dispatch(TokenEvent::RefreshFailed { reason: error });
                false
            }
        }
    }

    /// Make sure a usable session exists, refreshing if it is stale.
    pub async fn ensure_valid_session(&self) -> bool {
        if self.has_valid_token() && !machine::needs_refresh(&self.context(), self.refresh_margin_ms())
        {
            return true;
        }
        self.refresh().await
    }

    /// Wait for any in-flight refresh to settle, then report whether the
    /// session ended authenticated.
    pub async fn wait_for_refresh(&self) -> bool {
        let _gate = self.refresh_gate.lock().await;
        self.state() == TokenState::Authenticated
    }

    /// Stop the heartbeat. The service stays usable for explicit calls.
    pub fn shutdown(&self) {
        if let Some(heartbeat) = lock(&self.heartbeat).take() {
            heartbeat.stop();
        }
        info!(kind = %self.kind, "Token service shut down");
    }

    fn lock_core(&self) -> MutexGuard<'_, Core> {
        lock(&self.core)
    }

    fn refresh_margin_ms(&self) -> i64 {
        self.config.timing.refresh_margin_ms as i64
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
