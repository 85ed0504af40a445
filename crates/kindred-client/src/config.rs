//! Core configuration loaded from environment variables.
//!
//! Every setting has a default so the core can start with zero
//! configuration for local development and tests.

use std::path::PathBuf;
use std::time::Duration;

use kindred_shared::constants::{
    DEFAULT_DAILY_SWIPES, HEARTBEAT_INTERVAL_SECS, SUBSCRIPTION_LEAK_THRESHOLD, TYPING_TIMEOUT_MS,
};

/// Core configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// SQLite file backing the local store and the retry queue.
    /// Env: `KINDRED_DB_PATH`
    /// Default: platform data directory (see `Database::default_path`).
    pub db_path: Option<PathBuf>,

    /// Endpoint of the authenticated AI proxy.
    /// Env: `KINDRED_AI_PROXY_URL`
    /// Default: none (AI features fall back to placeholders).
    pub ai_proxy_url: Option<String>,

    /// Session token forwarded to the AI proxy as a bearer token.
    /// Env: `KINDRED_AI_TOKEN`
    pub ai_session_token: Option<String>,

    /// Base URL of the development echo endpoint.
    /// Env: `KINDRED_ECHO_URL`
    /// Default: none (echo stays local to the process).
    pub echo_url: Option<String>,

    /// Presence heartbeat period.
    /// Env: `KINDRED_HEARTBEAT_SECS`
    /// Default: `60`
    pub heartbeat_interval: Duration,

    /// How long a typing indicator survives without a refresh.
    pub typing_timeout: Duration,

    /// Live subscription count above which the registry logs a leak warning.
    /// Env: `KINDRED_LEAK_THRESHOLD`
    /// Default: `20`
    pub leak_threshold: usize,

    /// Swipes a non-premium user gets per day.
    /// Env: `KINDRED_DAILY_SWIPE_LIMIT`
    /// Default: `50`
    pub daily_swipe_limit: i64,

    /// Offset from UTC, in minutes, of the day boundary used to refill the
    /// daily swipe quota.
    /// Env: `KINDRED_QUOTA_UTC_OFFSET_MINUTES`
    /// Default: `0`
    pub quota_utc_offset_minutes: i32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            ai_proxy_url: None,
            ai_session_token: None,
            echo_url: None,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            typing_timeout: Duration::from_millis(TYPING_TIMEOUT_MS),
            leak_threshold: SUBSCRIPTION_LEAK_THRESHOLD,
            daily_swipe_limit: DEFAULT_DAILY_SWIPES,
            quota_utc_offset_minutes: 0,
        }
    }
}

impl CoreConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("KINDRED_DB_PATH").filter(|p| !p.is_empty()) {
            config.db_path = Some(PathBuf::from(path));
        }

        config.ai_proxy_url = lookup("KINDRED_AI_PROXY_URL").filter(|v| !v.is_empty());
        config.ai_session_token = lookup("KINDRED_AI_TOKEN").filter(|v| !v.is_empty());
        config.echo_url = lookup("KINDRED_ECHO_URL").filter(|v| !v.is_empty());

        if let Some(val) = lookup("KINDRED_HEARTBEAT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.heartbeat_interval = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid KINDRED_HEARTBEAT_SECS, using default"),
            }
        }

        if let Some(val) = lookup("KINDRED_LEAK_THRESHOLD") {
            if let Ok(n) = val.parse::<usize>() {
                config.leak_threshold = n;
            } else {
                tracing::warn!(value = %val, "Invalid KINDRED_LEAK_THRESHOLD, using default");
            }
        }

        if let Some(val) = lookup("KINDRED_DAILY_SWIPE_LIMIT") {
            match val.parse::<i64>() {
                Ok(n) if n >= 0 => config.daily_swipe_limit = n,
                _ => tracing::warn!(value = %val, "Invalid KINDRED_DAILY_SWIPE_LIMIT, using default"),
            }
        }

        if let Some(val) = lookup("KINDRED_QUOTA_UTC_OFFSET_MINUTES") {
            match val.parse::<i32>() {
                Ok(m) if (-14 * 60..=14 * 60).contains(&m) => config.quota_utc_offset_minutes = m,
                _ => tracing::warn!(
                    value = %val,
                    "Invalid KINDRED_QUOTA_UTC_OFFSET_MINUTES, using UTC"
                ),
            }
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }
}
