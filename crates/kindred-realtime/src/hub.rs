//! In-process realtime hub.
//!
//! Topics are created lazily on first subscribe and removed once their last
//! subscriber and last tracked presence are gone. Every subscriber owns a
//! bounded queue; events are fanned out with `try_send`, so a slow
//! subscriber drops its own events instead of stalling the publisher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use kindred_shared::protocol::table_topic;
use kindred_shared::{
    ChangeEvent, ConnectionState, PresenceEvent, PresenceEventKind, PresenceStatus,
    RealtimeEvent, UserId,
};

use crate::channel::{Channel, EventStream, RealtimeBackend};
use crate::error::{RealtimeError, Result};
use crate::filter::ChangeFilter;

const DEFAULT_QUEUE_CAPACITY: usize = 256;

struct Subscriber {
    /// Channel handle that opened this stream (nil for bare change feeds).
    owner: Uuid,
    filter: ChangeFilter,
    tx: mpsc::Sender<RealtimeEvent>,
}

#[derive(Default)]
struct Topic {
    subscribers: HashMap<Uuid, Subscriber>,
    roster: HashMap<UserId, PresenceStatus>,
}

impl Topic {
    fn is_idle(&self) -> bool {
        self.subscribers.is_empty() && self.roster.is_empty()
    }
}

struct HubInner {
    topics: Mutex<HashMap<String, Topic>>,
    connection: watch::Sender<ConnectionState>,
    queue_capacity: usize,
}

impl HubInner {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove_subscriber(&self, topic: &str, id: Uuid) {
        let mut topics = self.topics();
        if let Some(t) = topics.get_mut(topic) {
            t.subscribers.remove(&id);
            if t.is_idle() {
                topics.remove(topic);
            }
        }
    }
}

/// Shared handle to the in-process realtime backend.
#[derive(Clone)]
pub struct RealtimeHub {
    inner: Arc<HubInner>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a hub whose subscribers buffer at most `queue_capacity` events.
    pub fn with_capacity(queue_capacity: usize) -> Self {
        let (connection, _) = watch::channel(ConnectionState::Connected);
        Self {
            inner: Arc::new(HubInner {
                topics: Mutex::new(HashMap::new()),
                connection,
                queue_capacity: queue_capacity.max(1),
            }),
        }
    }

    /// Flip the simulated network link. While disconnected nothing is routed
    /// and publishes fail.
    pub fn set_connected(&self, connected: bool) {
        let state = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        let previous = self.inner.connection.send_replace(state);
        if previous != state {
            info!(state = ?state, "Realtime connection state changed");
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connection.borrow() == ConnectionState::Connected
    }

    /// Publish a row change on the table's change feed. Returns the number of
    /// subscribers the event was queued for.
    pub fn emit_change(&self, change: ChangeEvent) -> usize {
        let topic = table_topic(&change.table);
        self.route(&topic, RealtimeEvent::Change(change))
    }

    /// Number of live streams on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics()
            .get(topic)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }

    fn join(&self, topic: &str, owner: Uuid, filter: ChangeFilter) -> EventStream {
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let id = Uuid::new_v4();

        {
            let mut topics = self.inner.topics();
            let entry = topics.entry(topic.to_string()).or_default();
            entry.subscribers.insert(id, Subscriber { owner, filter, tx });
            debug!(
                topic = %topic,
                subscribers = entry.subscribers.len(),
                "Subscriber joined topic"
            );
        }

        let weak = Arc::downgrade(&self.inner);
        let topic_name = topic.to_string();
        EventStream::new(topic, rx, move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_subscriber(&topic_name, id);
            }
        })
    }

    fn route(&self, topic: &str, event: RealtimeEvent) -> usize {
        if !self.is_connected() {
            debug!(topic = %topic, "Disconnected, dropping event");
            return 0;
        }

        let mut topics = self.inner.topics();
        let Some(t) = topics.get_mut(topic) else {
            return 0;
        };

        let mut delivered = 0;
        t.subscribers.retain(|id, sub| {
            if !sub.filter.matches(&event) {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(topic = %topic, subscriber = %id, "Dropping event for slow subscriber");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        delivered
    }

    fn leave_owner(&self, topic: &str, owner: Uuid) {
        let mut topics = self.inner.topics();
        if let Some(t) = topics.get_mut(topic) {
            t.subscribers.retain(|_, sub| sub.owner != owner);
            if t.is_idle() {
                topics.remove(topic);
            }
        }
    }

    fn track(&self, topic: &str, user: UserId, status: PresenceStatus) -> Result<()> {
        if !self.is_connected() {
            return Err(RealtimeError::Disconnected);
        }

        let kind = {
            let mut topics = self.inner.topics();
            let entry = topics.entry(topic.to_string()).or_default();
            match entry.roster.insert(user, status) {
                Some(_) => PresenceEventKind::Update,
                None => PresenceEventKind::Join,
            }
        };

        self.route(
            topic,
            RealtimeEvent::Presence(PresenceEvent {
                user_id: user,
                kind,
                status,
                timestamp: Utc::now(),
            }),
        );
        Ok(())
    }

    fn untrack(&self, topic: &str, user: &UserId) {
        let removed = {
            let mut topics = self.inner.topics();
            match topics.get_mut(topic) {
                Some(t) => {
                    let removed = t.roster.remove(user).is_some();
                    if t.is_idle() {
                        topics.remove(topic);
                    }
                    removed
                }
                None => false,
            }
        };

        if removed {
            self.route(
                topic,
                RealtimeEvent::Presence(PresenceEvent {
                    user_id: *user,
                    kind: PresenceEventKind::Leave,
                    status: PresenceStatus::Offline,
                    timestamp: Utc::now(),
                }),
            );
        }
    }

    fn roster(&self, topic: &str) -> HashMap<UserId, PresenceStatus> {
        self.inner
            .topics()
            .get(topic)
            .map(|t| t.roster.clone())
            .unwrap_or_default()
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeBackend for RealtimeHub {
    fn channel(&self, topic: &str) -> Arc<dyn Channel> {
        Arc::new(HubChannel::new(self.clone(), topic))
    }

    fn changes(&self, table: &str, filter: ChangeFilter) -> EventStream {
        self.join(&table_topic(table), Uuid::nil(), filter)
    }

    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }
}

/// One client-side handle on a hub topic.
pub struct HubChannel {
    hub: RealtimeHub,
    topic: String,
    owner: Uuid,
    tracked: Mutex<Option<UserId>>,
}

impl HubChannel {
    pub fn new(hub: RealtimeHub, topic: &str) -> Self {
        Self {
            hub,
            topic: topic.to_string(),
            owner: Uuid::new_v4(),
            tracked: Mutex::new(None),
        }
    }

    fn tracked(&self) -> MutexGuard<'_, Option<UserId>> {
        self.tracked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Channel for HubChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn subscribe(&self) -> EventStream {
        self.hub.join(&self.topic, self.owner, ChangeFilter::all())
    }

    async fn publish(&self, event: RealtimeEvent) -> Result<()> {
        if !self.hub.is_connected() {
            return Err(RealtimeError::Disconnected);
        }
        self.hub.route(&self.topic, event);
        Ok(())
    }

    async fn track(&self, user: UserId, status: PresenceStatus) -> Result<()> {
        self.hub.track(&self.topic, user, status)?;
        *self.tracked() = Some(user);
        Ok(())
    }

    async fn untrack(&self) -> Result<()> {
        let user = self.tracked().take();
        if let Some(user) = user {
            self.hub.untrack(&self.topic, &user);
        }
        Ok(())
    }

    fn presence(&self) -> HashMap<UserId, PresenceStatus> {
        self.hub.roster(&self.topic)
    }

    async fn unsubscribe(&self) {
        let _ = self.untrack().await;
        self.hub.leave_owner(&self.topic, self.owner);
        debug!(topic = %self.topic, "Channel handle unsubscribed");
    }
}
