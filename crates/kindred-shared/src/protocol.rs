use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{pair_key, PresenceStatus, UserId};

/// All events carried by the realtime backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    /// A row changed in a watched table
    Change(ChangeEvent),

    /// Ephemeral typing signal between two users
    Typing(TypingSignal),

    /// Presence join / leave / status update on a presence channel
    Presence(PresenceEvent),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change published by the relational store's change feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    /// The new row, column name -> value
    pub record: serde_json::Value,
}

impl ChangeEvent {
    pub fn insert(table: &str, record: serde_json::Value) -> Self {
        Self {
            table: table.to_string(),
            kind: ChangeKind::Insert,
            record,
        }
    }

    pub fn update(table: &str, record: serde_json::Value) -> Self {
        Self {
            table: table.to_string(),
            kind: ChangeKind::Update,
            record,
        }
    }

    /// String value of a column in the changed row, if present.
    pub fn column(&self, name: &str) -> Option<&str> {
        self.record.get(name).and_then(|v| v.as_str())
    }

    pub fn record_id(&self) -> Option<&str> {
        self.column("id")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingSignal {
    pub from: UserId,
    pub to: UserId,
    pub is_typing: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceEventKind {
    Join,
    Leave,
    Update,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceEvent {
    pub user_id: UserId,
    pub kind: PresenceEventKind,
    pub status: PresenceStatus,
    pub timestamp: DateTime<Utc>,
}

impl RealtimeEvent {
    /// Serialize to the JSON wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the JSON wire format
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Topic carrying change events for one table.
pub fn table_topic(table: &str) -> String {
    format!("table:{table}")
}

/// Per-user presence channel.
pub fn presence_topic(user: &UserId) -> String {
    format!("presence:{user}")
}

/// Pair-keyed channel used for typing signals.
pub fn typing_topic(a: &UserId, b: &UserId) -> String {
    format!("typing:{}", pair_key(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_event_columns() {
        let event = ChangeEvent::insert(
            "messages",
            serde_json::json!({ "id": "m-1", "sender_id": "a", "is_read": false }),
        );
        assert_eq!(event.record_id(), Some("m-1"));
        assert_eq!(event.column("sender_id"), Some("a"));
        assert_eq!(event.column("is_read"), None);
        assert_eq!(event.column("missing"), None);
    }

    #[test]
    fn test_typing_event_wire_format() {
        let signal = RealtimeEvent::Typing(TypingSignal {
            from: UserId::new(),
            to: UserId::new(),
            is_typing: true,
            timestamp: Utc::now(),
        });
        let bytes = signal.to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"type\":\"typing\""));
        assert_eq!(RealtimeEvent::from_bytes(&bytes).unwrap(), signal);
    }

    #[test]
    fn test_typing_topic_is_symmetric() {
        let a = UserId::new();
        let b = UserId::new();
        assert_eq!(typing_topic(&a, &b), typing_topic(&b, &a));
        assert_ne!(presence_topic(&a), presence_topic(&b));
    }
}
