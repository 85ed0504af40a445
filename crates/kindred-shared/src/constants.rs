/// Application name
pub const APP_NAME: &str = "Kindred";

/// A pending delivery is dropped once it has failed this many retries
pub const MAX_DELIVERY_RETRIES: u32 = 5;

/// A pending delivery is dropped once it is older than this (24 hours)
pub const DELIVERY_TTL_SECS: i64 = 24 * 60 * 60;

/// First retry delay in milliseconds
pub const BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound for any retry / reconnect delay in milliseconds
pub const BACKOFF_CAP_MS: u64 = 30_000;

/// Typing signals clear themselves after this much silence
pub const TYPING_TIMEOUT_MS: u64 = 3_000;

/// Interval of the `last_active` heartbeat
pub const HEARTBEAT_INTERVAL_SECS: u64 = 60;

/// `last_active` younger than this means online
pub const ONLINE_WINDOW_SECS: i64 = 2 * 60;

/// `last_active` younger than this (but not online) means away
pub const AWAY_WINDOW_SECS: i64 = 10 * 60;

/// Live subscription count above which the registry warns about leaks
pub const SUBSCRIPTION_LEAK_THRESHOLD: usize = 20;

/// Local admission control: messages per sender per window
pub const MESSAGE_RATE_MAX: usize = 30;

/// Local admission control: swipes per swiper per window
pub const SWIPE_RATE_MAX: usize = 100;

/// Window shared by both rate limiter presets
pub const RATE_WINDOW_SECS: u64 = 60;

/// Swipes a non-premium user may record per day
pub const DEFAULT_DAILY_SWIPES: i64 = 50;

/// AI proxy calls per user per 24h (enforced server-side)
pub const AI_DAILY_CALL_QUOTA: u32 = 100;

/// Key-value prefix for persisted retry queue entries
pub const RETRY_QUEUE_PREFIX: &str = "retry_queue:";

/// Realtime table names
pub const TABLE_MESSAGES: &str = "messages";
pub const TABLE_MATCHES: &str = "matches";
pub const TABLE_SWIPES: &str = "swipes";
