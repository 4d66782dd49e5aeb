//! Refresh round-trip against the auth backend.
//!
//! Auth material never touches client-visible storage: the backend keeps
//! the session in HTTP-only cookies, so the client's whole job is a
//! credentialed POST and reading back the granted lifetime. Every failure
//! mode maps into a [`RefreshOutcome`]; this module never returns errors.

use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::types::{RefreshOutcome, TokenKind};

/// Refresh endpoint response body.
///
/// The backend reports failures in-band, `{"success": false, "error": ..}`,
/// regardless of HTTP status.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    error: Option<String>,
    expires_in: Option<u64>,
    #[serde(default)]
    success: bool,
}

/// HTTP client for the refresh endpoint.
///
/// Owns the cookie jar. Embedding apps should reuse this client for their
/// API calls so they carry the rotated session cookie.
pub struct RefreshClient {
    base_url: String,
    http: Client,
}

impl RefreshClient {
    pub fn new(config: &ApiConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .cookie_store(true)
            .timeout(std::time::Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn refresh_url(&self, kind: TokenKind) -> String {
        format!("{}/functions/v1/{}-auth/refresh", self.base_url, kind.as_str())
    }

    /// POST the refresh request, mapping every failure into the outcome.
    pub async fn execute_refresh(&self, kind: TokenKind) -> RefreshOutcome {
        let url = self.refresh_url(kind);
        debug!(kind = %kind, url = %url, "Requesting token refresh");

        let response = match self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Refresh request failed to send");
                return RefreshOutcome::Failure {
                    error: e.to_string(),
                };
            }
        };

        let status = response.status();
        match response.json::<RefreshResponse>().await {
            Ok(body) => match (body.success, body.expires_in) {
                (true, Some(expires_in)) => {
                    debug!(kind = %kind, expires_in, "Token refresh succeeded");
                    RefreshOutcome::Success { expires_in }
                }
                _ => {
                    let error = body
                        .error
                        .unwrap_or_else(|| format!("Refresh failed with status {status}"));
                    warn!(kind = %kind, status = %status, error = %error, "Token refresh rejected");
                    RefreshOutcome::Failure { error }
                }
            },
            Err(_) if !status.is_success() => {
                warn!(kind = %kind, status = %status, "Token refresh failed");
                RefreshOutcome::Failure {
                    error: format!("Refresh failed with status {status}"),
                }
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "Invalid refresh response body");
                RefreshOutcome::Failure {
                    error: format!("Invalid refresh response: {e}"),
                }
            }
        }
    }

    /// The cookie-holding HTTP client.
    pub fn http_client(&self) -> &Client {
        &self.http
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;

    fn client(base_url: &str) -> RefreshClient {
        RefreshClient::new(&ApiConfig {
            base_url: base_url.to_string(),
            request_timeout_seconds: 1,
        })
        .unwrap()
    }

    #[test]
    fn test_refresh_url_per_kind() {
        let client = client("https://auth.example.com/");
        assert_eq!(
            client.refresh_url(TokenKind::Unified),
            "https://auth.example.com/functions/v1/unified-auth/refresh"
        );
        assert_eq!(
            client.refresh_url(TokenKind::Buyer),
            "https://auth.example.com/functions/v1/buyer-auth/refresh"
        );
        assert_eq!(
            client.refresh_url(TokenKind::Producer),
            "https://auth.example.com/functions/v1/producer-auth/refresh"
        );
    }

    #[test]
    fn test_parses_success_body() {
        let body: RefreshResponse =
            serde_json::from_str(r#"{"success": true, "expiresIn": 14400}"#).unwrap();
        assert!(body.success);
        assert_eq!(body.expires_in, Some(14400));
        assert_eq!(body.error, None);
    }

    #[test]
    fn test_parses_failure_body() {
        let body: RefreshResponse =
            serde_json::from_str(r#"{"success": false, "error": "Refresh token revoked"}"#)
                .unwrap();
        assert!(!body.success);
        assert_eq!(body.expires_in, None);
        assert_eq!(body.error.as_deref(), Some("Refresh token revoked"));
    }

    #[test]
    fn test_missing_success_defaults_to_false() {
        let body: RefreshResponse = serde_json::from_str(r#"{"expiresIn": 14400}"#).unwrap();
        assert!(!body.success);
    }

    #[tokio::test]
    async fn test_network_failure_becomes_outcome() {
        // Port 9 (discard) refuses connections on loopback.
        let client = client("http://127.0.0.1:9");
        let outcome = client.execute_refresh(TokenKind::Unified).await;
        assert!(!outcome.is_success());
    }
}
