//! Local sliding-window admission control.
//!
//! Each key keeps the instants of its admitted attempts. An attempt is
//! admitted when fewer than `max_requests` admitted attempts fall inside the
//! trailing window; rejected attempts are not recorded. State lives in
//! memory only and is per process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use kindred_shared::constants::{MESSAGE_RATE_MAX, RATE_WINDOW_SECS, SWIPE_RATE_MAX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
}

impl RateLimitConfig {
    /// 30 messages per sender per minute.
    pub const MESSAGE: Self = Self {
        max_requests: MESSAGE_RATE_MAX,
        window: Duration::from_secs(RATE_WINDOW_SECS),
    };

    /// 100 swipes per swiper per minute.
    pub const SWIPE: Self = Self {
        max_requests: SWIPE_RATE_MAX,
        window: Duration::from_secs(RATE_WINDOW_SECS),
    };
}

/// Shared limiter, cheap to clone.
#[derive(Clone, Default)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit or reject one attempt for `key`.
    pub fn can_proceed(&self, key: &str, config: RateLimitConfig) -> bool {
        self.can_proceed_at(key, config, Instant::now())
    }

    fn can_proceed_at(&self, key: &str, config: RateLimitConfig, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(|p| p.into_inner());
        let window = windows.entry(key.to_string()).or_default();

        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= config.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() < config.max_requests {
            window.push_back(now);
            true
        } else {
            warn!(key, limit = config.max_requests, "Rate limit exceeded");
            false
        }
    }

    /// Forget keys whose newest admitted attempt is older than `max_window`.
    pub fn purge_stale(&self, max_window: Duration) {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|p| p.into_inner());
        windows.retain(|_, window| {
            window
                .back()
                .is_some_and(|newest| now.duration_since(*newest) < max_window)
        });
    }

    /// Number of keys with recorded attempts.
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
