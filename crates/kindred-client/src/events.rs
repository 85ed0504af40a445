use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;

use kindred_shared::{PresenceStatus, UserId};

/// A subscriber callback. Invoked from background tasks.
pub type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Presence snapshot handed to presence subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceState {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_seen_at: Option<chrono::DateTime<chrono::Utc>>,
    pub typing: bool,
    pub typing_target_id: Option<UserId>,
}

/// Run a subscriber callback. A panicking callback is logged and the
/// subscription stays live.
pub fn deliver<T>(subscription: &str, callback: &Callback<T>, payload: T) -> bool {
    match catch_unwind(AssertUnwindSafe(|| callback(payload))) {
        Ok(()) => true,
        Err(_) => {
            tracing::error!(subscription, "Subscriber callback panicked");
            false
        }
    }
}
