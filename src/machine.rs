//! Pure token lifecycle state machine.
//!
//! `transition` is total: every (state, event) pair yields a successor,
//! with unhandled pairs falling through as identity transitions. All I/O
//! (persistence, network, notifications) lives in the service layer, so
//! every rule here is testable with plain values.

use chrono::Utc;

use crate::types::{TokenContext, TokenEvent, TokenState};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Apply one event, returning the successor state and context.
///
/// Unhandled (state, event) combinations return the inputs unchanged.
pub fn transition(
    state: TokenState,
    context: &TokenContext,
    event: &TokenEvent,
) -> (TokenState, TokenContext) {
    use TokenEvent::*;
    use TokenState::*;

    match (state, event) {
        (Idle, LoginStarted) => (Authenticating, TokenContext::default()),
        (Idle | Authenticating | Error, LoginSucceeded { expires_in }) => {
            (Authenticated, authenticated_context(context, *expires_in))
        }
        (Authenticating, LoginFailed { reason }) => (
            Error,
            TokenContext {
                error_message: Some(reason.clone()),
                ..context.clone()
            },
        ),
        (Authenticated, Expired) => (Expiring, context.clone()),
        (Authenticated | Expiring, RefreshRequested) => {
            (Refreshing, refreshing_context(context))
        }
        // A failed session can retry as long as it still has an expiry to
        // anchor to; an error born from a failed login has nothing to
        // refresh.
        (Error, RefreshRequested) if context.expires_at.is_some() => {
            (Refreshing, refreshing_context(context))
        }
        (Refreshing, RefreshSucceeded { expires_in }) => {
            (Authenticated, authenticated_context(context, *expires_in))
        }
        (Refreshing, RefreshFailed { reason }) => (
            Error,
            TokenContext {
                error_message: Some(reason.clone()),
                refresh_failure_count: context.refresh_failure_count.saturating_add(1),
                ..context.clone()
            },
        ),
        (_, Logout) => (Idle, TokenContext::default()),
        _ => (state, context.clone()),
    }
}

fn authenticated_context(context: &TokenContext, expires_in: u64) -> TokenContext {
    // Lifetimes beyond the epoch range clamp to the far future rather
    // than wrapping into the past.
    let lifetime_ms = i64::try_from(expires_in)
        .unwrap_or(i64::MAX)
        .saturating_mul(1000);
    TokenContext {
        error_message: None,
        expires_at: Some(now_ms().saturating_add(lifetime_ms)),
        refresh_failure_count: 0,
        ..context.clone()
    }
}

fn refreshing_context(context: &TokenContext) -> TokenContext {
    TokenContext {
        last_refresh_attempt: Some(now_ms()),
        ..context.clone()
    }
}

/// True when an expiry is known and inside the proactive-refresh margin.
pub fn needs_refresh(context: &TokenContext, margin_ms: i64) -> bool {
    match context.expires_at {
        // Saturating: persisted expiries are not trusted to be sane.
        Some(expires_at) => expires_at.saturating_sub(now_ms()) <= margin_ms,
        None => false,
    }
}

/// True when no expiry is known or the expiry has passed.
pub fn is_expired(context: &TokenContext) -> bool {
    match context.expires_at {
        Some(expires_at) => now_ms() >= expires_at,
        None => true,
    }
}

/// True only while `authenticated` or `expiring`; mid-refresh and error
/// states are excluded.
pub fn can_make_api_calls(state: TokenState) -> bool {
    matches!(state, TokenState::Authenticated | TokenState::Expiring)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::make_context;

    fn all_states() -> [TokenState; 6] {
        [
            TokenState::Idle,
            TokenState::Authenticating,
            TokenState::Authenticated,
            TokenState::Expiring,
            TokenState::Refreshing,
            TokenState::Error,
        ]
    }

    fn sample_events() -> Vec<TokenEvent> {
        vec![
            TokenEvent::LoginStarted,
            TokenEvent::LoginSucceeded { expires_in: 3600 },
            TokenEvent::LoginSucceeded { expires_in: u64::MAX },
            TokenEvent::LoginFailed {
                reason: "bad credentials".to_string(),
            },
            TokenEvent::RefreshRequested,
            TokenEvent::RefreshSucceeded { expires_in: 3600 },
            TokenEvent::RefreshSucceeded { expires_in: u64::MAX },
            TokenEvent::RefreshFailed {
                reason: "network".to_string(),
            },
            TokenEvent::Expired,
            TokenEvent::Logout,
        ]
    }

    #[test]
    fn test_initial_state_is_idle() {
        assert_eq!(TokenState::default(), TokenState::Idle);
        assert_eq!(TokenContext::default().expires_at, None);
    }

    #[test]
    fn test_login_lifecycle() {
        let (state, context) = transition(
            TokenState::Idle,
            &TokenContext::default(),
            &TokenEvent::LoginStarted,
        );
        assert_eq!(state, TokenState::Authenticating);

        let before = now_ms();
        let (state, context) =
            transition(state, &context, &TokenEvent::LoginSucceeded { expires_in: 3600 });
        assert_eq!(state, TokenState::Authenticated);
        let expires_at = context.expires_at.unwrap();
        assert!(expires_at >= before + 3_600_000);
        assert_eq!(context.refresh_failure_count, 0);
        assert_eq!(context.error_message, None);
    }

    #[test]
    fn test_login_succeeds_directly_from_idle() {
        let (state, context) = transition(
            TokenState::Idle,
            &TokenContext::default(),
            &TokenEvent::LoginSucceeded { expires_in: 60 },
        );
        assert_eq!(state, TokenState::Authenticated);
        assert!(context.expires_at.is_some());
    }

    #[test]
    fn test_login_failure_records_reason() {
        let (state, context) = transition(
            TokenState::Authenticating,
            &TokenContext::default(),
            &TokenEvent::LoginFailed {
                reason: "invalid password".to_string(),
            },
        );
        assert_eq!(state, TokenState::Error);
        assert_eq!(context.error_message.as_deref(), Some("invalid password"));
        assert_eq!(context.expires_at, None);
    }

    #[test]
    fn test_near_expiry_enters_expiring() {
        let context = make_context(60_000);
        let (state, after) = transition(TokenState::Authenticated, &context, &TokenEvent::Expired);
        assert_eq!(state, TokenState::Expiring);
        assert_eq!(after, context);
    }

    #[test]
    fn test_refresh_round_trip() {
        let context = make_context(60_000);

        let (state, context) =
            transition(TokenState::Expiring, &context, &TokenEvent::RefreshRequested);
        assert_eq!(state, TokenState::Refreshing);
        assert!(context.last_refresh_attempt.is_some());

        let (state, context) =
            transition(state, &context, &TokenEvent::RefreshSucceeded { expires_in: 14400 });
        assert_eq!(state, TokenState::Authenticated);
        assert!(context.expires_at.unwrap() > now_ms() + 14_000_000);
        assert_eq!(context.refresh_failure_count, 0);
        assert_eq!(context.error_message, None);
    }

    #[test]
    fn test_refresh_also_allowed_while_authenticated() {
        let context = make_context(600_000);
        let (state, _) =
            transition(TokenState::Authenticated, &context, &TokenEvent::RefreshRequested);
        assert_eq!(state, TokenState::Refreshing);
    }

    #[test]
    fn test_consecutive_failures_accumulate() {
        let mut state = TokenState::Expiring;
        let mut context = make_context(-1_000);

        for expected in 1..=3u32 {
            let (next, ctx) = transition(state, &context, &TokenEvent::RefreshRequested);
            assert_eq!(next, TokenState::Refreshing);
            let (next, ctx) = transition(
                next,
                &ctx,
                &TokenEvent::RefreshFailed {
                    reason: format!("attempt {expected} failed"),
                },
            );
            assert_eq!(next, TokenState::Error);
            assert_eq!(ctx.refresh_failure_count, expected);
            assert_eq!(
                ctx.error_message.as_deref(),
                Some(format!("attempt {expected} failed").as_str())
            );
            state = next;
            context = ctx;
        }
    }

    #[test]
    fn test_success_resets_failure_count() {
        let context = TokenContext {
            refresh_failure_count: 2,
            error_message: Some("previous failure".to_string()),
            ..make_context(-1_000)
        };
        let (state, context) = transition(TokenState::Error, &context, &TokenEvent::RefreshRequested);
        assert_eq!(state, TokenState::Refreshing);

        let (state, context) =
            transition(state, &context, &TokenEvent::RefreshSucceeded { expires_in: 3600 });
        assert_eq!(state, TokenState::Authenticated);
        assert_eq!(context.refresh_failure_count, 0);
        assert_eq!(context.error_message, None);
    }

    #[test]
    fn test_error_without_session_cannot_refresh() {
        let context = TokenContext {
            error_message: Some("invalid password".to_string()),
            ..TokenContext::default()
        };
        let (state, after) = transition(TokenState::Error, &context, &TokenEvent::RefreshRequested);
        assert_eq!(state, TokenState::Error);
        assert_eq!(after, context);
    }

    #[test]
    fn test_login_recovers_from_error() {
        let context = TokenContext {
            refresh_failure_count: 2,
            error_message: Some("boom".to_string()),
            ..make_context(-5_000)
        };
        let (state, context) =
            transition(TokenState::Error, &context, &TokenEvent::LoginSucceeded { expires_in: 60 });
        assert_eq!(state, TokenState::Authenticated);
        assert_eq!(context.refresh_failure_count, 0);
        assert_eq!(context.error_message, None);
    }

    #[test]
    fn test_logout_resets_everything_from_any_state() {
        let context = TokenContext {
            refresh_failure_count: 5,
            error_message: Some("boom".to_string()),
            last_refresh_attempt: Some(now_ms()),
            ..make_context(60_000)
        };
        for state in all_states() {
            let (next, ctx) = transition(state, &context, &TokenEvent::Logout);
            assert_eq!(next, TokenState::Idle);
            assert_eq!(ctx, TokenContext::default());
        }
    }

    #[test]
    fn test_idle_logout_is_idempotent() {
        let context = TokenContext::default();
        let (state, after) = transition(TokenState::Idle, &context, &TokenEvent::Logout);
        assert_eq!(state, TokenState::Idle);
        assert_eq!(after, context);
    }

    #[test]
    fn test_unhandled_events_are_identity() {
        let cases = [
            (TokenState::Authenticated, TokenEvent::LoginStarted),
            (TokenState::Idle, TokenEvent::RefreshSucceeded { expires_in: 60 }),
            (TokenState::Idle, TokenEvent::Expired),
            (
                TokenState::Refreshing,
                TokenEvent::Expired,
            ),
            (
                TokenState::Expiring,
                TokenEvent::LoginFailed {
                    reason: "x".to_string(),
                },
            ),
            (TokenState::Refreshing, TokenEvent::RefreshRequested),
        ];
        let context = make_context(60_000);
        for (state, event) in cases {
            let (next, ctx) = transition(state, &context, &event);
            assert_eq!(next, state, "{state} + {event:?}");
            assert_eq!(ctx, context, "{state} + {event:?}");
        }
    }

    #[test]
    fn test_transition_is_total() {
        let before = now_ms();
        let contexts = [TokenContext::default(), make_context(60_000), make_context(-60_000)];
        for state in all_states() {
            for event in sample_events() {
                for context in &contexts {
                    let (next, ctx) = transition(state, context, &event);
                    // The failure counter moves by at most one per event.
                    assert!(
                        ctx.refresh_failure_count <= context.refresh_failure_count + 1,
                        "{state} + {event:?}"
                    );
                    // Entering authenticated always grants an expiry no
                    // earlier than the transition itself and clears the
                    // failure counter.
                    if next == TokenState::Authenticated && state != TokenState::Authenticated {
                        assert_eq!(ctx.refresh_failure_count, 0, "{state} + {event:?}");
                        assert!(
                            ctx.expires_at.is_some_and(|e| e >= before),
                            "{state} + {event:?}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_absurd_lifetime_clamps_to_far_future() {
        let (state, context) = transition(
            TokenState::Idle,
            &TokenContext::default(),
            &TokenEvent::LoginSucceeded { expires_in: u64::MAX },
        );
        assert_eq!(state, TokenState::Authenticated);
        assert!(context.expires_at.unwrap() > now_ms());
        assert!(!is_expired(&context));
        assert!(!needs_refresh(&context, 300_000));

        let (state, context) = transition(
            TokenState::Refreshing,
            &make_context(60_000),
            &TokenEvent::RefreshSucceeded { expires_in: u64::MAX },
        );
        assert_eq!(state, TokenState::Authenticated);
        assert!(!is_expired(&context));
    }

    #[test]
    fn test_needs_refresh_respects_margin() {
        assert!(!needs_refresh(&make_context(600_000), 300_000));
        assert!(needs_refresh(&make_context(240_000), 300_000));
        assert!(needs_refresh(&make_context(-1_000), 300_000));
        assert!(!needs_refresh(&TokenContext::default(), 300_000));
        // Garbage persisted expiries must not wrap the comparison.
        let ancient = TokenContext {
            expires_at: Some(i64::MIN),
            ..TokenContext::default()
        };
        assert!(needs_refresh(&ancient, 300_000));
        assert!(is_expired(&ancient));
    }

    #[test]
    fn test_is_expired() {
        assert!(is_expired(&make_context(-1_000)));
        assert!(!is_expired(&make_context(60_000)));
        // No known expiry counts as expired.
        assert!(is_expired(&TokenContext::default()));
    }

    #[test]
    fn test_can_make_api_calls_only_with_usable_session() {
        assert!(can_make_api_calls(TokenState::Authenticated));
        assert!(can_make_api_calls(TokenState::Expiring));
        assert!(!can_make_api_calls(TokenState::Idle));
        assert!(!can_make_api_calls(TokenState::Authenticating));
        assert!(!can_make_api_calls(TokenState::Refreshing));
        assert!(!can_make_api_calls(TokenState::Error));
    }
}
