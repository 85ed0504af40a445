use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{AWAY_WINDOW_SECS, ONLINE_WINDOW_SECS};
use crate::error::SharedError;

// User identity = backend-issued account UUID
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse_str(s: &str) -> Result<Self, SharedError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| SharedError::InvalidId(s.to_string()))
    }

    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic key for an unordered pair of users: `sorted(a, b).join("_")`.
///
/// Both participants compute the same key independently, so it is used for
/// conversation subscriptions, typing channels and persisted retry state.
pub fn pair_key(a: &UserId, b: &UserId) -> String {
    let (lo, hi) = canonical_pair(a, b);
    format!("{lo}_{hi}")
}

/// Order a pair the way the `matches` table stores it (`user1_id < user2_id`).
pub fn canonical_pair(a: &UserId, b: &UserId) -> (UserId, UserId) {
    let (sa, sb) = (a.to_string(), b.to_string());
    if sa <= sb {
        (*a, *b)
    } else {
        (*b, *a)
    }
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = SharedError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(SharedError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Invite,
    AiPlan,
    PhotoComment,
}

string_enum!(MessageKind, "message kind", {
    Text => "text",
    Image => "image",
    Invite => "invite",
    AiPlan => "ai_plan",
    PhotoComment => "photo_comment",
});

/// Client-local delivery state of a message. Never persisted server-side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    #[default]
    Sent,
    Delivered,
    Failed,
}

string_enum!(DeliveryStatus, "delivery status", {
    Pending => "pending",
    Sent => "sent",
    Delivered => "delivered",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SwipeAction {
    Like,
    Pass,
    Superlike,
}

string_enum!(SwipeAction, "swipe action", {
    Like => "like",
    Pass => "pass",
    Superlike => "superlike",
});

impl SwipeAction {
    /// Likes and superlikes count towards a mutual match.
    pub fn is_positive(&self) -> bool {
        matches!(self, Self::Like | Self::Superlike)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

string_enum!(PresenceStatus, "presence status", {
    Online => "online",
    Away => "away",
    Offline => "offline",
});

impl PresenceStatus {
    /// Derive a status from the heartbeat-updated `last_active` column when
    /// no live presence data exists.
    pub fn from_last_active(last_active: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let Some(last_active) = last_active else {
            return Self::Offline;
        };
        let idle = (now - last_active).num_seconds();
        if idle < ONLINE_WINDOW_SECS {
            Self::Online
        } else if idle < AWAY_WINDOW_SECS {
            Self::Away
        } else {
            Self::Offline
        }
    }
}

/// State of the connection to the realtime backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_pair_key_is_symmetric() {
        let a = UserId::new();
        let b = UserId::new();
        assert_eq!(pair_key(&a, &b), pair_key(&b, &a));
        assert!(pair_key(&a, &b).contains('_'));
    }

    #[test]
    fn test_canonical_pair_orders_by_string() {
        let a = UserId::parse_str("00000000-0000-0000-0000-000000000002").unwrap();
        let b = UserId::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
        assert_eq!(canonical_pair(&a, &b), (b, a));
        assert_eq!(canonical_pair(&b, &a), (b, a));
    }

    #[test]
    fn test_enum_text_round_trip() {
        assert_eq!("ai_plan".parse::<MessageKind>().unwrap(), MessageKind::AiPlan);
        assert_eq!(SwipeAction::Superlike.as_str(), "superlike");
        assert!("maybe".parse::<SwipeAction>().is_err());
    }

    #[test]
    fn test_presence_from_last_active() {
        let now = Utc::now();
        let status = |secs| PresenceStatus::from_last_active(Some(now - Duration::seconds(secs)), now);
        assert_eq!(status(30), PresenceStatus::Online);
        assert_eq!(status(5 * 60), PresenceStatus::Away);
        assert_eq!(status(11 * 60), PresenceStatus::Offline);
        assert_eq!(PresenceStatus::from_last_active(None, now), PresenceStatus::Offline);
    }
}
