//! Presence heartbeat, typing indicators and per-user status views.
//!
//! Everything here is best-effort: failures are logged and never retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use kindred_realtime::{Channel, EventStream, RealtimeBackend};
use kindred_shared::protocol::{presence_topic, typing_topic};
use kindred_shared::{PresenceEventKind, PresenceStatus, RealtimeEvent, TypingSignal, UserId};

use crate::backend::RelationalStore;
use crate::error::CoreError;
use crate::events::{deliver, Callback, PresenceState};
use crate::registry::{SubscriptionHandle, SubscriptionRegistry, Teardown};

pub type TypingCallback = Callback<bool>;
pub type PresenceCallback = Callback<PresenceState>;

struct TypingLink {
    channel: Arc<dyn Channel>,
    auto_stop: Option<JoinHandle<()>>,
}

struct Session {
    user: UserId,
    status: PresenceStatus,
    channel: Arc<dyn Channel>,
    heartbeat: JoinHandle<()>,
    typing: HashMap<String, TypingLink>,
    typing_target: Option<UserId>,
}

type SharedSession = Arc<Mutex<Option<Session>>>;

fn lock(session: &SharedSession) -> MutexGuard<'_, Option<Session>> {
    session.lock().unwrap_or_else(|p| p.into_inner())
}

async fn publish_typing(channel: &Arc<dyn Channel>, from: UserId, to: UserId, is_typing: bool) {
    let signal = RealtimeEvent::Typing(TypingSignal {
        from,
        to,
        is_typing,
        timestamp: Utc::now(),
    });
    if let Err(e) = channel.publish(signal).await {
        debug!(error = %e, "Typing signal not delivered");
    }
}

pub struct PresenceCoordinator {
    store: Arc<dyn RelationalStore>,
    realtime: Arc<dyn RealtimeBackend>,
    registry: Arc<SubscriptionRegistry>,
    heartbeat_interval: Duration,
    typing_timeout: Duration,
    session: SharedSession,
}

impl PresenceCoordinator {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        realtime: Arc<dyn RealtimeBackend>,
        registry: Arc<SubscriptionRegistry>,
        heartbeat_interval: Duration,
        typing_timeout: Duration,
    ) -> Self {
        Self {
            store,
            realtime,
            registry,
            heartbeat_interval,
            typing_timeout,
            session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn current_user(&self) -> Option<UserId> {
        lock(&self.session).as_ref().map(|s| s.user)
    }

    /// The signed-in user's own presence as this client last announced it.
    pub fn local_state(&self) -> Option<PresenceState> {
        lock(&self.session).as_ref().map(|s| PresenceState {
            user_id: s.user,
            status: s.status,
            last_seen_at: Some(Utc::now()),
            typing: s.typing_target.is_some(),
            typing_target_id: s.typing_target,
        })
    }

    /// Go online as `user` and start the `last_active` heartbeat. Replaces
    /// any previous session.
    pub async fn initialize(&self, user: UserId) {
        self.teardown().await;

        let channel = self.realtime.channel(&presence_topic(&user));
        if let Err(e) = channel.track(user, PresenceStatus::Online).await {
            warn!(user = %user, error = %e, "Failed to announce presence");
        }

        let store = self.store.clone();
        let period = self.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = store.touch_last_active(&user, Utc::now()).await {
                    debug!(user = %user, error = %e, "Heartbeat write failed");
                }
            }
        });

        *lock(&self.session) = Some(Session {
            user,
            status: PresenceStatus::Online,
            channel,
            heartbeat,
            typing: HashMap::new(),
            typing_target: None,
        });
        info!(user = %user, "Presence initialized");
    }

    /// Re-announce the signed-in user with a new status.
    pub async fn set_status(&self, status: PresenceStatus) -> Result<(), CoreError> {
        let (user, channel) = {
            let mut guard = lock(&self.session);
            let session = guard.as_mut().ok_or(CoreError::NotInitialized)?;
            session.status = status;
            (session.user, session.channel.clone())
        };
        channel.track(user, status).await?;
        debug!(user = %user, status = %status, "Presence status updated");
        Ok(())
    }

    /// Tell `to` whether we are typing. `true` re-arms an automatic stop
    /// after the typing timeout.
    pub async fn send_typing(&self, to: UserId, is_typing: bool) {
        let (from, channel) = {
            let mut guard = lock(&self.session);
            let Some(session) = guard.as_mut() else {
                debug!("Typing signal before presence initialized");
                return;
            };
            let from = session.user;
            let topic = typing_topic(&from, &to);
            let link = session
                .typing
                .entry(topic.clone())
                .or_insert_with(|| TypingLink {
                    channel: self.realtime.channel(&topic),
                    auto_stop: None,
                });

            if let Some(timer) = link.auto_stop.take() {
                timer.abort();
            }

            if is_typing {
                let channel = link.channel.clone();
                let shared = self.session.clone();
                let timeout = self.typing_timeout;
                link.auto_stop = Some(tokio::spawn(async move {
                    sleep(timeout).await;
                    if let Some(s) = lock(&shared).as_mut() {
                        if s.typing_target == Some(to) {
                            s.typing_target = None;
                        }
                    }
                    publish_typing(&channel, from, to, false).await;
                }));
                session.typing_target = Some(to);
            } else if session.typing_target == Some(to) {
                session.typing_target = None;
            }

            (from, link.channel.clone())
        };

        publish_typing(&channel, from, to, is_typing).await;
    }

    /// Follow whether `from` is typing to us. The callback only fires on
    /// transitions.
    pub async fn subscribe_typing(
        &self,
        from: UserId,
        callback: TypingCallback,
    ) -> Result<SubscriptionHandle, CoreError> {
        let me = self.current_user().ok_or(CoreError::NotInitialized)?;
        let topic = typing_topic(&me, &from);
        let realtime = self.realtime.clone();
        let timeout = self.typing_timeout;
        let subscription_key = topic.clone();

        let key = self
            .registry
            .subscribe(&topic, move || async move {
                let stream = realtime.channel(&subscription_key).subscribe();
                let task = tokio::spawn(watch_typing(
                    subscription_key,
                    stream,
                    me,
                    from,
                    timeout,
                    callback,
                ));
                Teardown::new(move || task.abort())
            })
            .await;
        Ok(SubscriptionHandle::new(key, self.registry.clone()))
    }

    /// Live status of `target`. The current state is delivered immediately.
    pub async fn subscribe_user_presence(
        &self,
        target: UserId,
        callback: PresenceCallback,
    ) -> SubscriptionHandle {
        let topic = presence_topic(&target);
        let realtime = self.realtime.clone();
        let store = self.store.clone();
        let subscription_key = topic.clone();

        let key = self
            .registry
            .subscribe(&topic, move || async move {
                let channel = realtime.channel(&subscription_key);
                let stream = channel.subscribe();

                let initial = match channel.presence().get(&target) {
                    Some(&status) => PresenceState {
                        user_id: target,
                        status,
                        last_seen_at: Some(Utc::now()),
                        typing: false,
                        typing_target_id: None,
                    },
                    None => fallback_state(store.as_ref(), target).await,
                };
                deliver(&subscription_key, &callback, initial);

                let task = tokio::spawn(watch_presence(subscription_key, stream, target, callback));
                Teardown::new(move || task.abort())
            })
            .await;
        SubscriptionHandle::new(key, self.registry.clone())
    }

    /// Leave presence, stop the heartbeat and every typing timer.
    pub async fn teardown(&self) {
        let Some(session) = lock(&self.session).take() else {
            return;
        };

        session.heartbeat.abort();
        let mut channels = vec![session.channel.clone()];
        for link in session.typing.into_values() {
            if let Some(timer) = link.auto_stop {
                timer.abort();
            }
            channels.push(link.channel);
        }

        if let Err(e) = session.channel.untrack().await {
            debug!(user = %session.user, error = %e, "Presence leave not delivered");
        }
        futures::future::join_all(channels.iter().map(|c| c.unsubscribe())).await;
        info!(user = %session.user, "Presence torn down");
    }
}

/// Status derived from the heartbeat column when no live data exists.
async fn fallback_state(store: &dyn RelationalStore, target: UserId) -> PresenceState {
    let last_active = match store.profile(&target).await {
        Ok(profile) => profile.last_active,
        Err(e) => {
            debug!(user = %target, error = %e, "No profile for presence fallback");
            None
        }
    };
    PresenceState {
        user_id: target,
        status: PresenceStatus::from_last_active(last_active, Utc::now()),
        last_seen_at: last_active,
        typing: false,
        typing_target_id: None,
    }
}

async fn watch_typing(
    key: String,
    mut stream: EventStream,
    me: UserId,
    from: UserId,
    timeout: Duration,
    callback: TypingCallback,
) {
    let mut typing = false;
    let mut deadline: Option<Instant> = None;

    loop {
        let watchdog = deadline;
        tokio::select! {
            event = stream.recv() => match event {
                Some(RealtimeEvent::Typing(signal)) if signal.from == from && signal.to == me => {
                    if signal.is_typing {
                        deadline = Some(Instant::now() + timeout);
                        if !typing {
                            typing = true;
                            deliver(&key, &callback, true);
                        }
                    } else {
                        deadline = None;
                        if typing {
                            typing = false;
                            deliver(&key, &callback, false);
                        }
                    }
                }
                Some(_) => {}
                None => break,
            },
            _ = async move {
                match watchdog {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                deadline = None;
                if typing {
                    typing = false;
                    deliver(&key, &callback, false);
                }
            }
        }
    }
}

async fn watch_presence(
    key: String,
    mut stream: EventStream,
    target: UserId,
    callback: PresenceCallback,
) {
    while let Some(event) = stream.recv().await {
        let RealtimeEvent::Presence(presence) = event else {
            continue;
        };
        if presence.user_id != target {
            continue;
        }
        let status = match presence.kind {
            PresenceEventKind::Leave => PresenceStatus::Offline,
            PresenceEventKind::Join | PresenceEventKind::Update => presence.status,
        };
        deliver(
            &key,
            &callback,
            PresenceState {
                user_id: target,
                status,
                last_seen_at: Some(presence.timestamp),
                typing: false,
                typing_target_id: None,
            },
        );
    }
    debug!(key = %key, "Presence feed closed");
}
