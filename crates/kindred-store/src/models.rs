//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer and embedded in realtime change events.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kindred_shared::{canonical_pair, DeliveryStatus, MessageKind, SwipeAction, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// The slice of a `users` row the core reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    pub bio: Option<String>,
    pub interests: Vec<String>,
    pub is_premium: bool,
    /// Swipes left today for non-premium users.
    pub daily_swipes: i64,
    /// Day the quota was last refilled.
    pub last_swipe_reset: Option<NaiveDate>,
    /// Heartbeat timestamp, fallback signal for presence.
    pub last_active: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(display_name: &str) -> Self {
        Self {
            id: UserId::new(),
            display_name: display_name.to_string(),
            bio: None,
            interests: Vec::new(),
            is_premium: false,
            daily_swipes: 0,
            last_swipe_reset: None,
            last_active: None,
            created_at: Utc::now(),
        }
    }
}

/// Result of the daily swipe quota check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwipeQuota {
    pub is_premium: bool,
    pub remaining: i64,
}

impl SwipeQuota {
    pub fn allows_swipe(&self) -> bool {
        self.is_premium || self.remaining > 0
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single directed chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Client-generated id, reused verbatim on every retry.
    pub id: Uuid,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    /// May be empty for payload-only messages (e.g. a workout plan).
    pub body: String,
    pub kind: MessageKind,
    /// Opaque structured payload: invite details, image reference, plan.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    /// Client-local only; rows read from the store are `Sent`.
    #[serde(default)]
    pub delivery_status: DeliveryStatus,
}

impl Message {
    /// Build a new outbound message with a fresh id, in `Pending` state.
    pub fn new(
        sender_id: UserId,
        recipient_id: UserId,
        body: &str,
        kind: MessageKind,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id,
            recipient_id,
            body: body.to_string(),
            kind,
            metadata,
            created_at: Utc::now(),
            is_read: false,
            delivery_status: DeliveryStatus::Pending,
        }
    }

    /// Whether this message travels between `a` and `b`, in either direction.
    pub fn is_between(&self, a: &UserId, b: &UserId) -> bool {
        (self.sender_id == *a && self.recipient_id == *b)
            || (self.sender_id == *b && self.recipient_id == *a)
    }
}

// ---------------------------------------------------------------------------
// Swipe
// ---------------------------------------------------------------------------

/// A directed like / pass / superlike.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Swipe {
    pub id: Uuid,
    pub swiper_id: UserId,
    pub swiped_id: UserId,
    pub action: SwipeAction,
    pub created_at: DateTime<Utc>,
}

impl Swipe {
    pub fn new(swiper_id: UserId, swiped_id: UserId, action: SwipeAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            swiper_id,
            swiped_id,
            action,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Match
// ---------------------------------------------------------------------------

/// Advisory compatibility data attached to a match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchInsight {
    /// 0..=100
    pub score: u8,
    pub reason: String,
    pub key_factors: Vec<String>,
}

/// A symmetric relationship between two users, stored with `user1_id < user2_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Match {
    pub id: Uuid,
    pub user1_id: UserId,
    pub user2_id: UserId,
    pub matched_at: DateTime<Utc>,
    /// False after an unmatch; rows are never deleted.
    pub is_active: bool,
    pub compatibility_score: u8,
    pub match_reason: String,
    pub key_factors: Vec<String>,
}

impl Match {
    pub fn new(a: UserId, b: UserId, insight: MatchInsight) -> Self {
        let (user1_id, user2_id) = canonical_pair(&a, &b);
        Self {
            id: Uuid::new_v4(),
            user1_id,
            user2_id,
            matched_at: Utc::now(),
            is_active: true,
            compatibility_score: insight.score.min(100),
            match_reason: insight.reason,
            key_factors: insight.key_factors,
        }
    }

    pub fn involves(&self, user: &UserId) -> bool {
        self.user1_id == *user || self.user2_id == *user
    }

    /// The other side of the pair, seen from `user`.
    pub fn partner_of(&self, user: &UserId) -> UserId {
        if self.user1_id == *user {
            self.user2_id
        } else {
            self.user1_id
        }
    }
}
