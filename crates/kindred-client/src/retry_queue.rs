//! Durable queue of outbound messages awaiting confirmed delivery.
//!
//! Entries are grouped per conversation and stored as one JSON array under
//! `retry_queue:{pair_key}` in the client key-value store, so a restart
//! picks up exactly where the last session stopped.
//!
//! An entry is dropped (never resent) once it has failed
//! [`MAX_DELIVERY_RETRIES`] times or is older than [`DELIVERY_TTL_SECS`].

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use kindred_shared::constants::{DELIVERY_TTL_SECS, MAX_DELIVERY_RETRIES, RETRY_QUEUE_PREFIX};
use kindred_shared::{backoff_delay, pair_key, UserId};
use kindred_store::Message;

use crate::backend::{BackendResult, KeyValueStore};
use crate::error::BackendError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub message: Message,
    pub retry_count: u32,
    /// `None` until the first failed retry.
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingDelivery {
    fn new(message: Message, now: DateTime<Utc>) -> Self {
        Self {
            message,
            retry_count: 0,
            last_attempt_at: None,
            enqueued_at: now,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= MAX_DELIVERY_RETRIES
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.enqueued_at > Duration::seconds(DELIVERY_TTL_SECS)
    }

    /// Earliest instant the next attempt may run.
    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        let last = self.last_attempt_at?;
        let delay = Duration::from_std(backoff_delay(self.retry_count)).unwrap_or(Duration::zero());
        Some(last + delay)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at().map_or(true, |at| at <= now)
    }
}

pub struct PersistentRetryQueue {
    kv: Arc<dyn KeyValueStore>,
    // Serializes read-modify-write cycles on the per-conversation arrays.
    guard: Mutex<()>,
}

impl PersistentRetryQueue {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            guard: Mutex::new(()),
        }
    }

    fn storage_key(message: &Message) -> String {
        format!(
            "{RETRY_QUEUE_PREFIX}{}",
            pair_key(&message.sender_id, &message.recipient_id)
        )
    }

    fn load(&self, key: &str) -> BackendResult<Vec<PendingDelivery>> {
        let Some(raw) = self.kv.get(key)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                // An unreadable array cannot be retried; drop it instead of
                // failing every later send in this conversation.
                warn!(key, error = %e, "Discarding corrupt retry queue entry");
                self.kv.delete(key)?;
                Ok(Vec::new())
            }
        }
    }

    fn save(&self, key: &str, entries: &[PendingDelivery]) -> BackendResult<()> {
        if entries.is_empty() {
            self.kv.delete(key)?;
            return Ok(());
        }
        let raw =
            serde_json::to_string(entries).map_err(|e| BackendError::Invalid(e.to_string()))?;
        self.kv.put(key, &raw)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.guard.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Persist `message` before any network attempt. Enqueuing an id that is
    /// already queued is a no-op.
    pub fn enqueue(&self, message: &Message) -> BackendResult<()> {
        self.enqueue_at(message, Utc::now())
    }

    pub fn enqueue_at(&self, message: &Message, now: DateTime<Utc>) -> BackendResult<()> {
        let _guard = self.lock();
        let key = Self::storage_key(message);
        let mut entries = self.load(&key)?;
        if entries.iter().any(|e| e.message.id == message.id) {
            return Ok(());
        }
        entries.push(PendingDelivery::new(message.clone(), now));
        self.save(&key, &entries)?;
        debug!(id = %message.id, "Message queued for delivery");
        Ok(())
    }

    /// Remove a delivered message. Returns whether it was queued.
    pub fn dequeue_succeeded(&self, id: Uuid) -> BackendResult<bool> {
        let _guard = self.lock();
        for key in self.kv.keys_with_prefix(RETRY_QUEUE_PREFIX)? {
            let mut entries = self.load(&key)?;
            let before = entries.len();
            entries.retain(|e| e.message.id != id);
            if entries.len() != before {
                self.save(&key, &entries)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Record a failed attempt. Returns the new retry count, or `None` when
    /// the id is not queued.
    pub fn mark_failed(&self, id: Uuid, now: DateTime<Utc>) -> BackendResult<Option<u32>> {
        let _guard = self.lock();
        for key in self.kv.keys_with_prefix(RETRY_QUEUE_PREFIX)? {
            let mut entries = self.load(&key)?;
            if let Some(entry) = entries.iter_mut().find(|e| e.message.id == id) {
                entry.retry_count += 1;
                entry.last_attempt_at = Some(now);
                let count = entry.retry_count;
                self.save(&key, &entries)?;
                return Ok(Some(count));
            }
        }
        Ok(None)
    }

    /// Prune exhausted and expired entries, then return those whose backoff
    /// has elapsed, oldest first.
    pub fn list_retryable(&self, now: DateTime<Utc>) -> BackendResult<Vec<PendingDelivery>> {
        let _guard = self.lock();
        let mut due = Vec::new();

        for key in self.kv.keys_with_prefix(RETRY_QUEUE_PREFIX)? {
            let entries = self.load(&key)?;
            let before = entries.len();

            let kept: Vec<PendingDelivery> = entries
                .into_iter()
                .filter(|e| {
                    let drop = e.is_exhausted() || e.is_expired(now);
                    if drop {
                        warn!(
                            id = %e.message.id,
                            retries = e.retry_count,
                            "Dropping undeliverable message"
                        );
                    }
                    !drop
                })
                .collect();

            if kept.len() != before {
                self.save(&key, &kept)?;
            }
            due.extend(kept.into_iter().filter(|e| e.is_due(now)));
        }

        due.sort_by_key(|e| e.enqueued_at);
        Ok(due)
    }

    /// Messages still queued for one conversation, oldest first.
    pub fn pending_for(&self, a: &UserId, b: &UserId) -> BackendResult<Vec<Message>> {
        let _guard = self.lock();
        let key = format!("{RETRY_QUEUE_PREFIX}{}", pair_key(a, b));
        Ok(self.load(&key)?.into_iter().map(|e| e.message).collect())
    }

    /// Total queued entries across all conversations.
    pub fn len(&self) -> BackendResult<usize> {
        let _guard = self.lock();
        let mut total = 0;
        for key in self.kv.keys_with_prefix(RETRY_QUEUE_PREFIX)? {
            total += self.load(&key)?.len();
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> BackendResult<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteKv;
    use kindred_shared::MessageKind;
    use kindred_store::Database;

    fn queue() -> PersistentRetryQueue {
        let db = Database::open_in_memory().unwrap();
        PersistentRetryQueue::new(Arc::new(SqliteKv::new(Arc::new(Mutex::new(db)))))
    }

    fn message(a: UserId, b: UserId) -> Message {
        Message::new(a, b, "hello", MessageKind::Text, serde_json::Value::Null)
    }

    #[test]
    fn test_enqueue_is_immediately_retryable() {
        let q = queue();
        let m = message(UserId::new(), UserId::new());
        q.enqueue(&m).unwrap();
        q.enqueue(&m).unwrap();

        let due = q.list_retryable(Utc::now()).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message.id, m.id);
        assert_eq!(due[0].retry_count, 0);
        assert_eq!(due[0].last_attempt_at, None);
    }

    #[test]
    fn test_both_directions_share_one_conversation() {
        let q = queue();
        let (a, b) = (UserId::new(), UserId::new());
        q.enqueue(&message(a, b)).unwrap();
        q.enqueue(&message(b, a)).unwrap();

        assert_eq!(q.pending_for(&b, &a).unwrap().len(), 2);
        assert_eq!(q.len().unwrap(), 2);
    }

    #[test]
    fn test_dequeue_removes_entry() {
        let q = queue();
        let m = message(UserId::new(), UserId::new());
        q.enqueue(&m).unwrap();

        assert!(q.dequeue_succeeded(m.id).unwrap());
        assert!(!q.dequeue_succeeded(m.id).unwrap());
        assert!(q.is_empty().unwrap());
    }

    #[test]
    fn test_backoff_gates_retry() {
        let q = queue();
        let m = message(UserId::new(), UserId::new());
        let t0 = Utc::now();
        q.enqueue_at(&m, t0).unwrap();

        assert_eq!(q.mark_failed(m.id, t0).unwrap(), Some(1));
        // retry_count 1 waits 2s after the last attempt.
        assert!(q.list_retryable(t0 + Duration::milliseconds(1999)).unwrap().is_empty());
        assert_eq!(q.list_retryable(t0 + Duration::seconds(2)).unwrap().len(), 1);

        assert_eq!(q.mark_failed(Uuid::new_v4(), t0).unwrap(), None);
    }

    #[test]
    fn test_exhausted_entry_is_dropped() {
        let q = queue();
        let m = message(UserId::new(), UserId::new());
        let t0 = Utc::now();
        q.enqueue_at(&m, t0).unwrap();
        for _ in 0..MAX_DELIVERY_RETRIES {
            q.mark_failed(m.id, t0).unwrap();
        }

        let later = t0 + Duration::minutes(5);
        assert!(q.list_retryable(later).unwrap().is_empty());
        assert!(q.is_empty().unwrap());
    }

    #[test]
    fn test_expired_entry_is_dropped() {
        let q = queue();
        let m = message(UserId::new(), UserId::new());
        let t0 = Utc::now();
        q.enqueue_at(&m, t0).unwrap();

        assert_eq!(q.list_retryable(t0 + Duration::hours(23)).unwrap().len(), 1);
        assert!(q.list_retryable(t0 + Duration::hours(25)).unwrap().is_empty());
        assert!(q.is_empty().unwrap());
    }

    #[test]
    fn test_corrupt_array_is_discarded() {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let kv = Arc::new(SqliteKv::new(db));
        kv.put("retry_queue:x_y", "not json").unwrap();

        let q = PersistentRetryQueue::new(kv.clone());
        assert!(q.list_retryable(Utc::now()).unwrap().is_empty());
        assert_eq!(kv.get("retry_queue:x_y").unwrap(), None);
    }

    #[test]
    fn test_queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let m = message(UserId::new(), UserId::new());
        {
            let db = Database::open_at(&path).unwrap();
            let q = PersistentRetryQueue::new(Arc::new(SqliteKv::new(Arc::new(Mutex::new(db)))));
            q.enqueue(&m).unwrap();
        }

        let db = Database::open_at(&path).unwrap();
        let q = PersistentRetryQueue::new(Arc::new(SqliteKv::new(Arc::new(Mutex::new(db)))));
        let due = q.list_retryable(Utc::now()).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message, m);
    }
}
