//! Client configuration from environment variables.

use std::time::Duration;

use crate::ws::ReconnectConfig;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL for request/response calls, e.g. `http://localhost:5000/api`
    pub api_base_url: String,
    /// Base URL for the three socket connections, e.g. `ws://localhost:5000`
    pub ws_base_url: String,
    /// Timeout applied by the HTTP client to every request
    pub http_timeout: Duration,
    /// Entries older than this are served as stale and refetched. `None` keeps them until invalidated.
    pub cache_max_age: Option<Duration>,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000/api".to_string(),
            ws_base_url: "ws://localhost:5000".to_string(),
            http_timeout: Duration::from_secs(30),
            cache_max_age: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DEVCHAT_API_URL`: request/response base URL (default: "http://localhost:5000/api")
    /// - `DEVCHAT_WS_URL`: socket base URL (default: "ws://localhost:5000")
    /// - `DEVCHAT_HTTP_TIMEOUT_SECS`: HTTP timeout in seconds (default: 30)
    /// - `DEVCHAT_CACHE_TTL_SECS`: cache max age in seconds (default: unset, no expiry)
    /// - `DEVCHAT_RECONNECT_MAX_ATTEMPTS`: socket reconnect attempts, 0 = infinite (default: 10)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |name: &str| -> Option<u64> {
            let raw = lookup(name)?;
            match raw.trim().parse() {
                Ok(n) => Some(n),
                Err(_) => {
                    tracing::warn!(variable = name, value = %raw, "ignoring non-numeric setting");
                    None
                }
            }
        };

        let mut reconnect = defaults.reconnect;
        if let Some(attempts) = number("DEVCHAT_RECONNECT_MAX_ATTEMPTS") {
            reconnect.max_attempts = attempts as u32;
        }

        Self {
            api_base_url: lookup("DEVCHAT_API_URL").unwrap_or(defaults.api_base_url),
            ws_base_url: lookup("DEVCHAT_WS_URL").unwrap_or(defaults.ws_base_url),
            http_timeout: number("DEVCHAT_HTTP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            cache_max_age: number("DEVCHAT_CACHE_TTL_SECS").map(Duration::from_secs),
            reconnect,
        }
    }

    /// Socket URL for one of the named connections
    pub fn ws_url(&self, path: &str) -> String {
        let base = self.ws_base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }
}
