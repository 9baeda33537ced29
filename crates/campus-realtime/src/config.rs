//! Runtime configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the client can start with zero
//! configuration in development.

use std::time::Duration;

use campus_shared::constants::{
    HEARTBEAT_INTERVAL_SECS, RECONNECT_DELAY_SECS, RECONNECT_MAX_ATTEMPTS, RING_TIMEOUT_SECS,
};

/// Realtime core configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// WebSocket endpoint of the realtime channel.
    /// Env: `CAMPUS_CHANNEL_URL`
    /// Default: `ws://127.0.0.1:9090/realtime`
    pub channel_url: String,

    /// Interval between liveness frames while connected.
    /// Env: `CAMPUS_HEARTBEAT_SECS`
    pub heartbeat_interval: Duration,

    /// Maximum reconnection attempts after an unexpected disconnect.
    /// Env: `CAMPUS_RECONNECT_ATTEMPTS`
    pub reconnect_max_attempts: u32,

    /// Fixed delay between reconnection attempts.
    /// Env: `CAMPUS_RECONNECT_DELAY_SECS`
    pub reconnect_delay: Duration,

    /// How long an unanswered ring persists before teardown.
    /// Env: `CAMPUS_RING_TIMEOUT_SECS`
    pub ring_timeout: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            channel_url: "ws://127.0.0.1:9090/realtime".to_string(),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            reconnect_max_attempts: RECONNECT_MAX_ATTEMPTS,
            reconnect_delay: Duration::from_secs(RECONNECT_DELAY_SECS),
            ring_timeout: Duration::from_secs(RING_TIMEOUT_SECS),
        }
    }
}

impl RealtimeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("CAMPUS_CHANNEL_URL") {
            config.channel_url = url;
        }

        if let Some(secs) = parse_env_u64("CAMPUS_HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("CAMPUS_RECONNECT_ATTEMPTS") {
            if let Ok(n) = val.parse::<u32>() {
                config.reconnect_max_attempts = n;
            } else {
                tracing::warn!(value = %val, "Invalid CAMPUS_RECONNECT_ATTEMPTS, using default");
            }
        }

        if let Some(secs) = parse_env_u64("CAMPUS_RECONNECT_DELAY_SECS") {
            config.reconnect_delay = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_env_u64("CAMPUS_RING_TIMEOUT_SECS") {
            config.ring_timeout = Duration::from_secs(secs);
        }

        config
    }
}

fn parse_env_u64(key: &str) -> Option<u64> {
    let val = std::env::var(key).ok()?;
    match val.parse::<u64>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %val, "Invalid duration value, using default");
            None
        }
    }
}
