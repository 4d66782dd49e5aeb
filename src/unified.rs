//! Consumer-facing service for the unified token kind.
//!
//! Wraps a [`TokenService`] and adds the one policy the base service
//! deliberately leaves out: after too many consecutive refresh failures
//! the session is forcibly cleared so the user re-authenticates instead
//! of hammering a dead refresh cookie.

use std::sync::Arc;

use tracing::warn;

use crate::bus::BroadcastBus;
use crate::config::Config;
use crate::service::{ServiceError, Subscription, TokenService};
use crate::storage::KeyValueStore;
use crate::types::{TokenContext, TokenKind, TokenState};

pub struct UnifiedTokenService {
    _policy: Subscription,
    service: Arc<TokenService>,
}

impl UnifiedTokenService {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        bus: Option<Arc<BroadcastBus>>,
        config: Config,
    ) -> Result<Self, ServiceError> {
        let max_failures = config.policy.max_refresh_failures;
        let service = TokenService::new(TokenKind::Unified, store, bus, config)?;

        // A zero cap disables forced logout entirely.
        let weak = Arc::downgrade(&service);
        let policy = service.subscribe(move |state, context| {
            if max_failures == 0 {
                return;
            }
            if state == TokenState::Error && context.refresh_failure_count >= max_failures {
                if let Some(service) = weak.upgrade() {
                    warn!(
                        failures = context.refresh_failure_count,
                        "Refresh failure cap reached; clearing session"
                    );
                    service.clear_tokens();
                }
            }
        });

        Ok(Self {
            _policy: policy,
            service,
        })
    }

    /// Observe auth state changes; fires immediately with the current
    /// state.
    pub fn subscribe_to_auth(
        &self,
        callback: impl Fn(TokenState, &TokenContext) + Send + Sync + 'static,
    ) -> Subscription {
        self.service.subscribe(callback)
    }

    pub fn is_authenticated(&self) -> bool {
        self.service.has_valid_token()
    }

    pub fn state(&self) -> TokenState {
        self.service.state()
    }

    pub async fn refresh_token(&self) -> bool {
        self.service.refresh().await
    }

    pub fn set_authenticated(&self, expires_in: u64) {
        self.service.set_authenticated(expires_in);
    }

    pub fn clear_auth(&self) {
        self.service.clear_tokens();
    }

    /// The underlying service, for operations the facade does not wrap.
    pub fn service(&self) -> &Arc<TokenService> {
        &self.service
    }
}
