//! Collaborator interfaces the coordinators talk to, plus the local
//! implementation backed by `kindred-store` and the in-process realtime hub.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use kindred_realtime::RealtimeHub;
use kindred_shared::constants::{TABLE_MATCHES, TABLE_MESSAGES, TABLE_SWIPES};
use kindred_shared::{ChangeEvent, UserId};
use kindred_store::{Database, Match, MatchInsight, Message, Swipe, SwipeQuota, UserProfile};

use crate::error::BackendError;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// The relational store as seen by the coordinators.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Insert a message under its client-generated id. A second insert of the
    /// same id fails with [`BackendError::Conflict`].
    async fn insert_message(&self, message: &Message) -> BackendResult<()>;

    /// Both directions of a conversation, oldest first.
    async fn conversation(&self, a: &UserId, b: &UserId) -> BackendResult<Vec<Message>>;

    async fn mark_read(&self, reader: &UserId, partner: &UserId) -> BackendResult<usize>;

    async fn unread_count(&self, user: &UserId) -> BackendResult<u64>;

    async fn profile(&self, user: &UserId) -> BackendResult<UserProfile>;

    async fn touch_last_active(&self, user: &UserId, at: DateTime<Utc>) -> BackendResult<()>;

    /// Daily quota, refilled when the day rolled over since the last refill.
    async fn swipe_quota(&self, user: &UserId) -> BackendResult<SwipeQuota>;

    async fn decrement_daily_swipes(&self, user: &UserId) -> BackendResult<bool>;

    async fn find_swipe(&self, swiper: &UserId, swiped: &UserId) -> BackendResult<Option<Swipe>>;

    /// Record a swipe. A second swipe for the same ordered pair fails with
    /// [`BackendError::Conflict`].
    async fn insert_swipe(&self, swipe: &Swipe) -> BackendResult<()>;

    /// Create the match row for an unordered pair unless one exists, and
    /// return whichever row is stored plus whether this call created it.
    async fn create_match_if_not_exists(
        &self,
        a: &UserId,
        b: &UserId,
        insight: &MatchInsight,
    ) -> BackendResult<(Match, bool)>;

    async fn match_for_pair(&self, a: &UserId, b: &UserId) -> BackendResult<Option<Match>>;

    async fn active_matches(&self, user: &UserId) -> BackendResult<Vec<Match>>;

    async fn deactivate_match(&self, id: Uuid) -> BackendResult<Match>;
}

/// Durable string key-value storage for client-local state.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> BackendResult<Option<String>>;
    fn put(&self, key: &str, value: &str) -> BackendResult<()>;
    fn delete(&self, key: &str) -> BackendResult<bool>;
    fn keys_with_prefix(&self, prefix: &str) -> BackendResult<Vec<String>>;
}

/// Which calendar day the swipe quota belongs to.
#[derive(Debug, Clone, Copy)]
pub struct QuotaPolicy {
    pub daily_limit: i64,
    pub utc_offset_minutes: i32,
}

impl QuotaPolicy {
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        (now + Duration::minutes(i64::from(self.utc_offset_minutes))).date_naive()
    }
}

fn lock(db: &Mutex<Database>) -> MutexGuard<'_, Database> {
    db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Local backend: SQLite tables plus change events on the realtime hub.
///
/// Honors the hub's simulated connection: while the hub is disconnected
/// every call fails with [`BackendError::Unavailable`].
#[derive(Clone)]
pub struct LocalBackend {
    db: Arc<Mutex<Database>>,
    hub: RealtimeHub,
    quota: QuotaPolicy,
}

impl LocalBackend {
    pub fn new(db: Arc<Mutex<Database>>, hub: RealtimeHub, quota: QuotaPolicy) -> Self {
        Self { db, hub, quota }
    }

    pub fn hub(&self) -> &RealtimeHub {
        &self.hub
    }

    pub fn database(&self) -> Arc<Mutex<Database>> {
        self.db.clone()
    }

    fn online(&self) -> BackendResult<MutexGuard<'_, Database>> {
        if !self.hub.is_connected() {
            return Err(BackendError::Unavailable("realtime backend unreachable".into()));
        }
        Ok(lock(&self.db))
    }
}

/// Row shape published on the `messages` change feed.
pub fn message_record(message: &Message) -> serde_json::Value {
    json!({
        "id": message.id.to_string(),
        "sender_id": message.sender_id.to_string(),
        "recipient_id": message.recipient_id.to_string(),
        "content": message.body,
        "message_type": message.kind.as_str(),
        "metadata": message.metadata,
        "is_read": message.is_read,
        "created_at": message.created_at.to_rfc3339(),
    })
}

fn match_record(m: &Match) -> serde_json::Value {
    json!({
        "id": m.id.to_string(),
        "user1_id": m.user1_id.to_string(),
        "user2_id": m.user2_id.to_string(),
        "is_active": m.is_active,
        "compatibility_score": m.compatibility_score,
        "matched_at": m.matched_at.to_rfc3339(),
    })
}

#[async_trait]
impl RelationalStore for LocalBackend {
    async fn insert_message(&self, message: &Message) -> BackendResult<()> {
        self.online()?.insert_message(message)?;
        let routed = self
            .hub
            .emit_change(ChangeEvent::insert(TABLE_MESSAGES, message_record(message)));
        debug!(id = %message.id, routed, "Message row inserted");
        Ok(())
    }

    async fn conversation(&self, a: &UserId, b: &UserId) -> BackendResult<Vec<Message>> {
        Ok(self.online()?.conversation(a, b)?)
    }

    async fn mark_read(&self, reader: &UserId, partner: &UserId) -> BackendResult<usize> {
        Ok(self.online()?.mark_conversation_read(reader, partner)?)
    }

    async fn unread_count(&self, user: &UserId) -> BackendResult<u64> {
        Ok(self.online()?.unread_count(user)?)
    }

    async fn profile(&self, user: &UserId) -> BackendResult<UserProfile> {
        Ok(self.online()?.get_user(user)?)
    }

    async fn touch_last_active(&self, user: &UserId, at: DateTime<Utc>) -> BackendResult<()> {
        Ok(self.online()?.touch_last_active(user, at)?)
    }

    async fn swipe_quota(&self, user: &UserId) -> BackendResult<SwipeQuota> {
        let today = self.quota.today(Utc::now());
        Ok(self
            .online()?
            .swipe_quota(user, today, self.quota.daily_limit)?)
    }

    async fn decrement_daily_swipes(&self, user: &UserId) -> BackendResult<bool> {
        Ok(self.online()?.decrement_daily_swipes(user)?)
    }

    async fn find_swipe(&self, swiper: &UserId, swiped: &UserId) -> BackendResult<Option<Swipe>> {
        Ok(self.online()?.find_swipe(swiper, swiped)?)
    }

    async fn insert_swipe(&self, swipe: &Swipe) -> BackendResult<()> {
        self.online()?.insert_swipe(swipe)?;
        let record = json!({
            "id": swipe.id.to_string(),
            "swiper_id": swipe.swiper_id.to_string(),
            "swiped_id": swipe.swiped_id.to_string(),
            "action": swipe.action.as_str(),
        });
        self.hub.emit_change(ChangeEvent::insert(TABLE_SWIPES, record));
        Ok(())
    }

    async fn create_match_if_not_exists(
        &self,
        a: &UserId,
        b: &UserId,
        insight: &MatchInsight,
    ) -> BackendResult<(Match, bool)> {
        let (record, created) = self.online()?.create_match_if_not_exists(a, b, insight)?;
        if created {
            self.hub
                .emit_change(ChangeEvent::insert(TABLE_MATCHES, match_record(&record)));
        }
        Ok((record, created))
    }

    async fn match_for_pair(&self, a: &UserId, b: &UserId) -> BackendResult<Option<Match>> {
        Ok(self.online()?.match_for_pair(a, b)?)
    }

    async fn active_matches(&self, user: &UserId) -> BackendResult<Vec<Match>> {
        Ok(self.online()?.active_matches_for(user)?)
    }

    async fn deactivate_match(&self, id: Uuid) -> BackendResult<Match> {
        let record = self.online()?.deactivate_match(id)?;
        self.hub
            .emit_change(ChangeEvent::update(TABLE_MATCHES, match_record(&record)));
        Ok(record)
    }
}

/// [`KeyValueStore`] over the `kv` table. Client-local, so it ignores the
/// realtime connection state.
#[derive(Clone)]
pub struct SqliteKv {
    db: Arc<Mutex<Database>>,
}

impl SqliteKv {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }
}

impl KeyValueStore for SqliteKv {
    fn get(&self, key: &str) -> BackendResult<Option<String>> {
        Ok(lock(&self.db).kv_get(key)?)
    }

    fn put(&self, key: &str, value: &str) -> BackendResult<()> {
        Ok(lock(&self.db).kv_put(key, value)?)
    }

    fn delete(&self, key: &str) -> BackendResult<bool> {
        Ok(lock(&self.db).kv_delete(key)?)
    }

    fn keys_with_prefix(&self, prefix: &str) -> BackendResult<Vec<String>> {
        Ok(lock(&self.db).kv_keys_with_prefix(prefix)?)
    }
}
