use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub api: ApiConfig,
    pub policy: PolicyConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL of the auth backend, e.g. "https://auth.example.com".
    pub base_url: String,
    /// Outbound request timeout (seconds).
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Periodic token status check interval (ms).
    pub heartbeat_interval_ms: u64,
    /// Cross-instance refresh lock record TTL (ms).
    pub lock_ttl_ms: u64,
    /// How long a non-refreshing instance waits for the holder's result (ms).
    pub lock_wait_timeout_ms: u64,
    /// Start refreshing this long before expiry (ms).
    pub refresh_margin_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Treat a failed lock write as "not acquired" instead of "acquired".
    pub lock_fail_closed: bool,
    /// Consecutive refresh failures before the unified service forces
    /// logout.
    pub max_refresh_failures: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:54321".to_string(),
            request_timeout_seconds: 10,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 60_000,
            lock_ttl_ms: 30_000,
            lock_wait_timeout_ms: 20_000,
            refresh_margin_ms: 300_000, // 5 minutes
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            lock_fail_closed: false,
            max_refresh_failures: 3,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let base_url =
            std::env::var("TOKEN_API_BASE_URL").unwrap_or_else(|_| ApiConfig::default().base_url);

        let request_timeout_seconds = std::env::var("TOKEN_HTTP_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let heartbeat_interval_ms = std::env::var("TOKEN_HEARTBEAT_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60_000);

        let lock_ttl_ms = std::env::var("TOKEN_LOCK_TTL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30_000);

        let lock_wait_timeout_ms = std::env::var("TOKEN_LOCK_WAIT_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(20_000);

        let refresh_margin_ms = std::env::var("TOKEN_REFRESH_MARGIN_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300_000);

        let max_refresh_failures = std::env::var("TOKEN_MAX_REFRESH_FAILURES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let lock_fail_closed = std::env::var("TOKEN_LOCK_FAIL_CLOSED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let config = Config {
            api: ApiConfig {
                base_url,
                request_timeout_seconds,
            },
            policy: PolicyConfig {
                lock_fail_closed,
                max_refresh_failures,
            },
            timing: TimingConfig {
                heartbeat_interval_ms,
                lock_ttl_ms,
                lock_wait_timeout_ms,
                refresh_margin_ms,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.base_url.is_empty() {
            return Err(ConfigError::ValidationError(
                "TOKEN_API_BASE_URL cannot be empty".to_string(),
            ));
        }

        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "TOKEN_API_BASE_URL must be an http(s) URL, got {}",
                self.api.base_url
            )));
        }

        if self.timing.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "TOKEN_HEARTBEAT_INTERVAL_MS cannot be 0".to_string(),
            ));
        }

        if self.timing.lock_ttl_ms == 0 {
            return Err(ConfigError::ValidationError(
                "TOKEN_LOCK_TTL_MS cannot be 0".to_string(),
            ));
        }

        if self.timing.lock_wait_timeout_ms >= self.timing.lock_ttl_ms {
            tracing::warn!(
                "Lock wait timeout ({} ms) is not below the lock TTL ({} ms). \
                 Waiting instances may take over before the holder finishes.",
                self.timing.lock_wait_timeout_ms,
                self.timing.lock_ttl_ms
            );
        }

        if self.policy.max_refresh_failures == 0 {
            tracing::warn!(
                "TOKEN_MAX_REFRESH_FAILURES is 0; forced logout on repeated refresh failures is disabled"
            );
        }

        Ok(())
    }
}
