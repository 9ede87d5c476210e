//! Runtime configuration
//!
//! Every knob has a default; `SyncConfig::from_env()` overrides them from
//! `SYNC_*` environment variables.

use std::time::Duration;

use thiserror::Error;

/// Default backend event-source endpoint
pub const DEFAULT_URL: &str = "ws://127.0.0.1:8055/websocket";

/// Errors raised while reading configuration
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },

    #[error("SYNC_BACKOFF_CAP_MS ({cap_ms}) is smaller than SYNC_BACKOFF_BASE_MS ({base_ms})")]
    BackoffCapBelowBase { base_ms: u64, cap_ms: u64 },
}

/// Reconnect / retry backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

/// Configuration for the whole sync core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// WebSocket URL of the backend event source
    pub url: String,
    /// Bearer token appended as `access_token` query parameter
    pub access_token: Option<String>,
    pub backoff: BackoffConfig,
    /// Deadline for one transport connect attempt
    pub connect_timeout: Duration,
    /// Deadline for a subscribe/unsubscribe acknowledgement
    pub request_timeout: Duration,
    /// Coalescing window for invalidations of one query key (0 disables)
    pub invalidation_debounce: Duration,
    /// Window during which identical notifications are suppressed
    pub dedup_window: Duration,
    /// Capacity of the change-event channel between connection and demux
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            access_token: None,
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            invalidation_debounce: Duration::from_millis(50),
            dedup_window: Duration::from_secs(2),
            event_buffer: 1024,
        }
    }
}

impl SyncConfig {
    /// Config pointing at `url` with defaults for everything else
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Create from environment variables
    ///
    /// Environment:
    /// - SYNC_URL: backend WebSocket URL (default `ws://127.0.0.1:8055/websocket`)
    /// - SYNC_ACCESS_TOKEN: token sent as `access_token` query parameter
    /// - SYNC_BACKOFF_BASE_MS / SYNC_BACKOFF_CAP_MS: reconnect backoff (1000 / 30000)
    /// - SYNC_CONNECT_TIMEOUT_MS / SYNC_REQUEST_TIMEOUT_MS: deadlines (10000 / 10000)
    /// - SYNC_DEBOUNCE_MS: invalidation coalescing window (50, 0 disables)
    /// - SYNC_DEDUP_WINDOW_MS: notification de-duplication window (2000)
    /// - SYNC_EVENT_BUFFER: change-event channel capacity (1024)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("SYNC_URL").filter(|u| !u.trim().is_empty()) {
            config.url = url.trim().to_string();
        }
        config.access_token = lookup("SYNC_ACCESS_TOKEN").filter(|t| !t.is_empty());

        let millis = |var: &'static str| -> Result<Option<Duration>, ConfigError> {
            parse_u64(&lookup, var).map(|v| v.map(Duration::from_millis))
        };

        if let Some(base) = millis("SYNC_BACKOFF_BASE_MS")? {
            config.backoff.base = non_zero(base, "SYNC_BACKOFF_BASE_MS")?;
        }
        if let Some(cap) = millis("SYNC_BACKOFF_CAP_MS")? {
            config.backoff.cap = non_zero(cap, "SYNC_BACKOFF_CAP_MS")?;
        }
        if config.backoff.cap < config.backoff.base {
            return Err(ConfigError::BackoffCapBelowBase {
                base_ms: config.backoff.base.as_millis() as u64,
                cap_ms: config.backoff.cap.as_millis() as u64,
            });
        }
        if let Some(timeout) = millis("SYNC_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = non_zero(timeout, "SYNC_CONNECT_TIMEOUT_MS")?;
        }
        if let Some(timeout) = millis("SYNC_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = non_zero(timeout, "SYNC_REQUEST_TIMEOUT_MS")?;
        }
        if let Some(window) = millis("SYNC_DEBOUNCE_MS")? {
            config.invalidation_debounce = window;
        }
        if let Some(window) = millis("SYNC_DEDUP_WINDOW_MS")? {
            config.dedup_window = window;
        }
        if let Some(buffer) = parse_u64(&lookup, "SYNC_EVENT_BUFFER")? {
            if buffer == 0 {
                return Err(ConfigError::Zero {
                    var: "SYNC_EVENT_BUFFER",
                });
            }
            config.event_buffer = buffer as usize;
        }

        Ok(config)
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff = BackoffConfig { base, cap };
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_invalidation_debounce(mut self, window: Duration) -> Self {
        self.invalidation_debounce = window;
        self
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }
}

fn parse_u64<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { var, value: raw }),
    }
}

fn non_zero(value: Duration, var: &'static str) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        Err(ConfigError::Zero { var })
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.backoff.base, Duration::from_secs(1));
        assert_eq!(config.backoff.cap, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.invalidation_debounce, Duration::from_millis(50));
        assert_eq!(config.dedup_window, Duration::from_secs(2));
    }

    #[test]
    fn test_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("SYNC_URL", "wss://api.example.com/websocket"),
            ("SYNC_ACCESS_TOKEN", "tok"),
            ("SYNC_BACKOFF_BASE_MS", "250"),
            ("SYNC_BACKOFF_CAP_MS", "5000"),
            ("SYNC_DEBOUNCE_MS", "0"),
            ("SYNC_EVENT_BUFFER", "64"),
        ]))
        .unwrap();

        assert_eq!(config.url, "wss://api.example.com/websocket");
        assert_eq!(config.access_token.as_deref(), Some("tok"));
        assert_eq!(config.backoff.base, Duration::from_millis(250));
        assert_eq!(config.backoff.cap, Duration::from_secs(5));
        assert!(config.invalidation_debounce.is_zero());
        assert_eq!(config.event_buffer, 64);
    }

    #[test]
    fn test_invalid_number() {
        let err = SyncConfig::from_lookup(lookup(&[("SYNC_REQUEST_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                var: "SYNC_REQUEST_TIMEOUT_MS",
                value: "soon".to_string()
            }
        );
    }

    #[test]
    fn test_cap_below_base_rejected() {
        let err = SyncConfig::from_lookup(lookup(&[
            ("SYNC_BACKOFF_BASE_MS", "2000"),
            ("SYNC_BACKOFF_CAP_MS", "1000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::BackoffCapBelowBase { .. }));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let err = SyncConfig::from_lookup(lookup(&[("SYNC_EVENT_BUFFER", "0")])).unwrap_err();
        assert_eq!(err, ConfigError::Zero { var: "SYNC_EVENT_BUFFER" });
    }
}
