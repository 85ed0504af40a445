//! One-to-one messaging: durable send, retry, and live conversation views.
//!
//! Every outbound message is written to the retry queue before the network
//! is touched. A message leaves the queue only once the store has accepted
//! its id; a duplicate-id rejection counts as accepted, since the row is
//! already there.
//!
//! Live views have two producers: the store's change feed and the local
//! echo transport. Both feed one [`MessageSink`] keyed by message id.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kindred_realtime::{ChangeFilter, EventStream, RealtimeBackend};
use kindred_shared::constants::TABLE_MESSAGES;
use kindred_shared::{
    pair_key, ChangeKind, ConnectionState, DeliveryStatus, MessageKind, RealtimeEvent, UserId,
};
use kindred_store::Message;

use crate::ai::{icebreaker_prompt, AiClient, ResponseFormat, DEFAULT_ICEBREAKER};
use crate::backend::RelationalStore;
use crate::dedup::{MessageSink, SeenSet};
use crate::error::{BackendError, CoreError};
use crate::events::{deliver, Callback};
use crate::local_echo::LocalEchoTransport;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::registry::{SubscriptionHandle, SubscriptionRegistry, Teardown};
use crate::retry_queue::PersistentRetryQueue;

/// Result of [`ChatCoordinator::send`].
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The store accepted the message.
    Sent(Message),
    /// The store was unreachable; the message waits in the retry queue.
    Queued(Message),
    /// Rejected locally by the rate limiter. Nothing was queued.
    RateLimited,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub type ConversationCallback = Callback<Vec<Message>>;

pub fn conversation_key(a: &UserId, b: &UserId) -> String {
    format!("chat:{}", pair_key(a, b))
}

struct Conversation {
    key: String,
    user: UserId,
    partner: UserId,
    seen: SeenSet,
    sink: MessageSink,
    callback: ConversationCallback,
}

/// Wake-ups for a live conversation view.
enum LiveSignal {
    /// Our own send or retry touched the conversation; re-read it.
    Refresh,
    /// Another tab (or the echo endpoint) delivered a message.
    Echo(Message),
}

type LiveViews = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<LiveSignal>>>>;

fn route_echo(live: &LiveViews, message: Message) {
    let live = live.lock().unwrap_or_else(|p| p.into_inner());
    match live.get(&pair_key(&message.sender_id, &message.recipient_id)) {
        Some(tx) => {
            let _ = tx.send(LiveSignal::Echo(message));
        }
        None => debug!(id = %message.id, "Echo for a conversation nobody is viewing"),
    }
}

impl Conversation {
    /// Merge a message from the echo transport. Returns `false` for ids the
    /// view already holds.
    fn absorb_echo(&mut self, mut message: Message) -> bool {
        if self.sink.get(&message.id).is_some() || !self.seen.insert(message.id) {
            return false;
        }
        // It reached this tab, so from here it counts as delivered.
        message.delivery_status = DeliveryStatus::Sent;
        self.sink.merge([message])
    }

    /// Whether a `messages` change belongs to this conversation.
    fn owns(&self, change: &kindred_shared::ChangeEvent) -> bool {
        let (Some(sender), Some(recipient)) =
            (change.column("sender_id"), change.column("recipient_id"))
        else {
            return false;
        };
        let (user, partner) = (self.user.to_string(), self.partner.to_string());
        (sender == user && recipient == partner) || (sender == partner && recipient == user)
    }
}

#[derive(Clone)]
pub struct ChatCoordinator {
    store: Arc<dyn RelationalStore>,
    realtime: Arc<dyn RealtimeBackend>,
    queue: Arc<PersistentRetryQueue>,
    limiter: RateLimiter,
    registry: Arc<SubscriptionRegistry>,
    ai: Arc<dyn AiClient>,
    echo: Arc<LocalEchoTransport>,
    // Wakes the live view of a conversation, keyed by pair key.
    live: LiveViews,
    retrying: Arc<tokio::sync::Mutex<()>>,
}

impl ChatCoordinator {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        realtime: Arc<dyn RealtimeBackend>,
        queue: Arc<PersistentRetryQueue>,
        limiter: RateLimiter,
        registry: Arc<SubscriptionRegistry>,
        ai: Arc<dyn AiClient>,
        echo: Arc<LocalEchoTransport>,
    ) -> Self {
        let live: LiveViews = Arc::new(Mutex::new(HashMap::new()));
        let routes = live.clone();
        echo.on_message(Arc::new(move |message: Message| route_echo(&routes, message)));

        Self {
            store,
            realtime,
            queue,
            limiter,
            registry,
            ai,
            echo,
            live,
            retrying: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn queue(&self) -> &Arc<PersistentRetryQueue> {
        &self.queue
    }

    fn poke(&self, a: &UserId, b: &UserId) {
        let live = self.live.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(tx) = live.get(&pair_key(a, b)) {
            let _ = tx.send(LiveSignal::Refresh);
        }
    }

    /// Send a message. Fails only when the local queue cannot be written.
    pub async fn send(
        &self,
        sender: UserId,
        recipient: UserId,
        body: &str,
        kind: MessageKind,
        metadata: serde_json::Value,
    ) -> Result<SendOutcome, CoreError> {
        if !self
            .limiter
            .can_proceed(&format!("{sender}:message"), RateLimitConfig::MESSAGE)
        {
            return Ok(SendOutcome::RateLimited);
        }

        let mut message = Message::new(sender, recipient, body, kind, metadata);
        self.queue.enqueue(&message)?;
        self.poke(&sender, &recipient);
        self.echo.send(&message);

        match self.store.insert_message(&message).await {
            Ok(()) | Err(BackendError::Conflict(_)) => {
                if let Err(e) = self.queue.dequeue_succeeded(message.id) {
                    warn!(id = %message.id, error = %e, "Delivered message left in retry queue");
                }
                message.delivery_status = DeliveryStatus::Sent;
                debug!(id = %message.id, "Message sent");
                Ok(SendOutcome::Sent(message))
            }
            Err(e) => {
                info!(id = %message.id, error = %e, "Send failed, message queued for retry");
                Ok(SendOutcome::Queued(message))
            }
        }
    }

    pub async fn send_text(
        &self,
        sender: UserId,
        recipient: UserId,
        body: &str,
    ) -> Result<SendOutcome, CoreError> {
        self.send(sender, recipient, body, MessageKind::Text, serde_json::Value::Null)
            .await
    }

    /// Attempt every queued message whose backoff has elapsed. Concurrent
    /// calls collapse into the one already running.
    pub async fn retry_pending(&self) -> RetryReport {
        let Ok(_running) = self.retrying.try_lock() else {
            debug!("Retry pass already running");
            return RetryReport::default();
        };

        let entries = match self.queue.list_retryable(Utc::now()) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Could not read retry queue");
                return RetryReport::default();
            }
        };

        let mut report = RetryReport::default();
        for entry in entries {
            report.attempted += 1;
            let id = entry.message.id;
            match self.store.insert_message(&entry.message).await {
                Ok(()) | Err(BackendError::Conflict(_)) => {
                    report.delivered += 1;
                    if let Err(e) = self.queue.dequeue_succeeded(id) {
                        warn!(id = %id, error = %e, "Delivered message left in retry queue");
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    match self.queue.mark_failed(id, Utc::now()) {
                        Ok(retries) => debug!(id = %id, ?retries, error = %e, "Retry failed"),
                        Err(qe) => warn!(id = %id, error = %qe, "Could not record failed retry"),
                    }
                }
            }
            self.poke(&entry.message.sender_id, &entry.message.recipient_id);
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                delivered = report.delivered,
                failed = report.failed,
                "Retry pass finished"
            );
        }
        report
    }

    /// Live view of the conversation between `user` and `partner`. The
    /// callback receives the full ordered list on every change.
    pub async fn subscribe(
        &self,
        user: UserId,
        partner: UserId,
        callback: ConversationCallback,
    ) -> SubscriptionHandle {
        let key = conversation_key(&user, &partner);
        let this = self.clone();
        let subscription_key = key.clone();
        let key = self
            .registry
            .subscribe(&key, move || async move {
                this.open(subscription_key, user, partner, callback).await
            })
            .await;
        SubscriptionHandle::new(key, self.registry.clone())
    }

    async fn open(
        &self,
        key: String,
        user: UserId,
        partner: UserId,
        callback: ConversationCallback,
    ) -> Teardown {
        let feed = self.realtime.changes(
            TABLE_MESSAGES,
            ChangeFilter::eq("sender_id", user)
                .or_eq("recipient_id", user)
                .kinds(&[ChangeKind::Insert]),
        );

        let (poke_tx, poke_rx) = mpsc::unbounded_channel();
        let pair = pair_key(&user, &partner);
        self.live
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(pair.clone(), poke_tx.clone());

        let mut conversation = Conversation {
            key,
            user,
            partner,
            seen: SeenSet::default(),
            sink: MessageSink::default(),
            callback,
        };
        self.refresh(&mut conversation).await;

        let retry = self.clone();
        tokio::spawn(async move {
            retry.retry_pending().await;
        });

        let connection = self.realtime.connection();
        let task = tokio::spawn(self.clone().run(conversation, feed, poke_rx, connection));

        let live = self.live.clone();
        Teardown::new(move || {
            task.abort();
            let mut live = live.lock().unwrap_or_else(|p| p.into_inner());
            if live.get(&pair).is_some_and(|tx| tx.same_channel(&poke_tx)) {
                live.remove(&pair);
            }
        })
    }

    async fn run(
        self,
        mut conversation: Conversation,
        mut feed: EventStream,
        mut pokes: mpsc::UnboundedReceiver<LiveSignal>,
        mut connection: watch::Receiver<ConnectionState>,
    ) {
        let mut watch_connection = true;
        loop {
            tokio::select! {
                event = feed.recv() => match event {
                    Some(RealtimeEvent::Change(change)) => {
                        if !conversation.owns(&change) {
                            continue;
                        }
                        let Some(id) = change.record_id().and_then(|s| Uuid::parse_str(s).ok()) else {
                            continue;
                        };
                        if conversation.seen.contains(&id) {
                            debug!(id = %id, "Duplicate message event dropped");
                            continue;
                        }
                        self.refresh(&mut conversation).await;
                    }
                    Some(_) => {}
                    None => {
                        debug!(key = %conversation.key, "Message feed closed");
                        break;
                    }
                },
                Some(signal) = pokes.recv() => match signal {
                    LiveSignal::Refresh => self.refresh(&mut conversation).await,
                    LiveSignal::Echo(message) => {
                        if !conversation.absorb_echo(message) {
                            continue;
                        }
                        deliver(
                            &conversation.key,
                            &conversation.callback,
                            conversation.sink.snapshot(),
                        );
                    }
                },
                changed = connection.changed(), if watch_connection => {
                    if changed.is_err() {
                        watch_connection = false;
                        continue;
                    }
                    let reconnected = *connection.borrow_and_update() == ConnectionState::Connected;
                    if reconnected {
                        self.refresh(&mut conversation).await;
                    }
                }
            }
        }
    }

    /// Re-fetch the conversation, merge in still-queued messages and hand
    /// the full list to the callback.
    async fn refresh(&self, conversation: &mut Conversation) {
        // Queue first: a message dequeued after this read is already stored.
        let pending = self
            .queue
            .pending_for(&conversation.user, &conversation.partner)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Could not read pending messages");
                Vec::new()
            });

        match self
            .store
            .conversation(&conversation.user, &conversation.partner)
            .await
        {
            Ok(stored) => {
                let alive: HashSet<Uuid> = stored
                    .iter()
                    .chain(pending.iter())
                    .map(|m| m.id)
                    .collect();
                conversation.seen.extend(stored.iter().map(|m| m.id));
                conversation.sink.merge(stored);
                conversation.sink.merge(pending);
                let failed = conversation.sink.fail_missing(&alive);
                if failed > 0 {
                    warn!(key = %conversation.key, failed, "Messages dropped from the retry queue");
                }
            }
            Err(e) => {
                debug!(key = %conversation.key, error = %e, "Conversation fetch failed");
                conversation.sink.merge(pending);
            }
        }

        deliver(
            &conversation.key,
            &conversation.callback,
            conversation.sink.snapshot(),
        );
    }

    /// Mark everything `partner` sent to `reader` as read. Fire-and-forget.
    pub fn mark_read(&self, reader: UserId, partner: UserId) -> JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            match store.mark_read(&reader, &partner).await {
                Ok(count) => debug!(count, "Conversation marked read"),
                Err(e) => warn!(error = %e, "Failed to mark conversation read"),
            }
        })
    }

    pub async fn unread_count(&self, user: &UserId) -> Result<u64, CoreError> {
        Ok(self.store.unread_count(user).await?)
    }

    /// A suggested first message. Never fails: falls back to a fixed line.
    pub async fn icebreaker(&self, sender: &UserId, recipient: &UserId) -> String {
        let profiles = match (
            self.store.profile(sender).await,
            self.store.profile(recipient).await,
        ) {
            (Ok(s), Ok(r)) => (s, r),
            _ => return DEFAULT_ICEBREAKER.to_string(),
        };

        match self
            .ai
            .generate_text(&icebreaker_prompt(&profiles.0, &profiles.1), ResponseFormat::Text)
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => DEFAULT_ICEBREAKER.to_string(),
            Err(e) => {
                warn!(error = %e, "Icebreaker generation failed, using default");
                DEFAULT_ICEBREAKER.to_string()
            }
        }
    }
}
