//! Client configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the layer can start with zero
//! configuration against the production backend.

use fitlink_shared::constants::MAX_RECONNECT_ATTEMPTS;

use crate::polling::PollConfig;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base WebSocket URL of the broadcaster (without the app path).
    /// Env: `FITLINK_WS_URL`
    /// Default: `wss://broadcast.fitlink.app`
    pub ws_url: String,

    /// Application key appended to the WebSocket path.
    /// Env: `FITLINK_APP_KEY`
    /// Default: `fitlink`
    pub app_key: String,

    /// Base URL of the REST API.
    /// Env: `FITLINK_API_URL`
    /// Default: `https://api.fitlink.app/api`
    pub api_url: String,

    /// Broadcasting-auth endpoint for private/presence channels.
    /// Env: `FITLINK_AUTH_URL`
    /// Default: `https://api.fitlink.app/broadcasting/auth`
    pub auth_url: String,

    /// Scheduled reconnect attempts before parking.
    /// Env: `FITLINK_MAX_RECONNECT_ATTEMPTS`
    /// Default: `10`
    pub max_reconnect_attempts: u32,

    /// Lobby polling fallback tuning.
    /// Env: `FITLINK_POLL_INTERVAL_MS`, `FITLINK_POLL_MAX_RETRIES`
    pub poll: PollConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://broadcast.fitlink.app".to_string(),
            app_key: "fitlink".to_string(),
            api_url: "https://api.fitlink.app/api".to_string(),
            auth_url: "https://api.fitlink.app/broadcasting/auth".to_string(),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            poll: PollConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("FITLINK_WS_URL") {
            config.ws_url = url;
        }

        if let Ok(key) = std::env::var("FITLINK_APP_KEY") {
            config.app_key = key;
        }

        if let Ok(url) = std::env::var("FITLINK_API_URL") {
            config.api_url = url;
        }

        if let Ok(url) = std::env::var("FITLINK_AUTH_URL") {
            config.auth_url = url;
        }

        if let Ok(val) = std::env::var("FITLINK_MAX_RECONNECT_ATTEMPTS") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.max_reconnect_attempts = n,
                _ => tracing::warn!(
                    value = %val,
                    "Invalid FITLINK_MAX_RECONNECT_ATTEMPTS, using default"
                ),
            }
        }

        if let Ok(val) = std::env::var("FITLINK_POLL_INTERVAL_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => config.poll.interval_ms = ms,
                _ => tracing::warn!(
                    value = %val,
                    "Invalid FITLINK_POLL_INTERVAL_MS, using default"
                ),
            }
        }

        if let Ok(val) = std::env::var("FITLINK_POLL_MAX_RETRIES") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.poll.max_retries = n,
                _ => tracing::warn!(
                    value = %val,
                    "Invalid FITLINK_POLL_MAX_RETRIES, using default"
                ),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// Full WebSocket endpoint, `{ws_url}/app/{app_key}`.
    pub fn ws_endpoint(&self) -> String {
        format!("{}/app/{}", self.ws_url.trim_end_matches('/'), self.app_key)
    }

    pub fn connection_config(&self) -> fitlink_realtime::ConnectionConfig {
        let mut config = fitlink_realtime::ConnectionConfig::new(self.ws_endpoint());
        config.max_reconnect_attempts = self.max_reconnect_attempts;
        config
    }
}
