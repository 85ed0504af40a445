use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use kindred_shared::{ConnectionState, PresenceStatus, RealtimeEvent, UserId};

use crate::error::Result;
use crate::filter::ChangeFilter;

/// A live stream of events for one subscriber.
///
/// Dropping the stream releases the subscription on the backend side.
pub struct EventStream {
    topic: String,
    rx: mpsc::Receiver<RealtimeEvent>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl EventStream {
    pub fn new(
        topic: &str,
        rx: mpsc::Receiver<RealtimeEvent>,
        on_drop: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event, or `None` once the subscription has been closed.
    pub async fn recv(&mut self) -> Option<RealtimeEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<RealtimeEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(release) = self.on_drop.take() {
            release();
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").field("topic", &self.topic).finish()
    }
}

/// A named pub/sub channel.
#[async_trait]
pub trait Channel: Send + Sync {
    fn topic(&self) -> &str;

    /// Open a new stream of everything published on this channel.
    fn subscribe(&self) -> EventStream;

    /// Broadcast an event to every subscriber of the channel.
    async fn publish(&self, event: RealtimeEvent) -> Result<()>;

    /// Announce `user` in this channel's presence roster (join or update).
    async fn track(&self, user: UserId, status: PresenceStatus) -> Result<()>;

    /// Remove whatever this handle tracked (leave).
    async fn untrack(&self) -> Result<()>;

    /// Current roster snapshot.
    fn presence(&self) -> HashMap<UserId, PresenceStatus>;

    /// Close every stream opened through this handle and leave presence.
    async fn unsubscribe(&self);
}

/// The realtime collaborator as seen by the core.
pub trait RealtimeBackend: Send + Sync {
    fn channel(&self, topic: &str) -> Arc<dyn Channel>;

    /// Filtered change feed for one table.
    fn changes(&self, table: &str, filter: ChangeFilter) -> EventStream;

    fn connection(&self) -> watch::Receiver<ConnectionState>;
}
