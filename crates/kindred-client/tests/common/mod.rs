#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Barrier;
use uuid::Uuid;

use kindred_client::ai::{AiClient, DisabledAi, ResponseFormat};
use kindred_client::backend::{BackendResult, LocalBackend, QuotaPolicy, RelationalStore, SqliteKv};
use kindred_client::local_echo::LocalEchoBus;
use kindred_client::{AiError, AppContext, BackendError, Callback, Collaborators, CoreConfig};
use kindred_realtime::RealtimeHub;
use kindred_shared::UserId;
use kindred_store::{Database, Match, MatchInsight, Message, Swipe, SwipeQuota, UserProfile};

/// One shared backend (store + hub) that several clients talk to.
pub struct World {
    pub hub: RealtimeHub,
    pub db: Arc<Mutex<Database>>,
    pub bus: LocalEchoBus,
}

impl World {
    pub fn new() -> Self {
        Self {
            hub: RealtimeHub::new(),
            db: Arc::new(Mutex::new(Database::open_in_memory().unwrap())),
            bus: LocalEchoBus::new(),
        }
    }

    pub fn user(&self, name: &str) -> UserId {
        let profile = UserProfile::new(name);
        self.db.lock().unwrap().upsert_user(&profile).unwrap();
        profile.id
    }

    pub fn client(&self) -> AppContext {
        self.client_with(CoreConfig::default(), Arc::new(DisabledAi))
    }

    pub fn backend(&self) -> LocalBackend {
        let defaults = CoreConfig::default();
        LocalBackend::new(
            self.db.clone(),
            self.hub.clone(),
            QuotaPolicy {
                daily_limit: defaults.daily_swipe_limit,
                utc_offset_minutes: defaults.quota_utc_offset_minutes,
            },
        )
    }

    /// A client with its own retry queue storage and rate limiter.
    pub fn client_with(&self, config: CoreConfig, ai: Arc<dyn AiClient>) -> AppContext {
        let backend = LocalBackend::new(
            self.db.clone(),
            self.hub.clone(),
            QuotaPolicy {
                daily_limit: config.daily_swipe_limit,
                utc_offset_minutes: config.quota_utc_offset_minutes,
            },
        );
        self.client_on(config, Arc::new(backend), ai)
    }

    /// A client talking to the shared hub through `store`.
    pub fn client_on(
        &self,
        config: CoreConfig,
        store: Arc<dyn RelationalStore>,
        ai: Arc<dyn AiClient>,
    ) -> AppContext {
        let local = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        AppContext::new(
            config,
            Collaborators {
                store,
                realtime: Arc::new(self.hub.clone()),
                ai,
                kv: Arc::new(SqliteKv::new(local)),
                echo_bus: self.bus.clone(),
                echo_endpoint: None,
            },
        )
    }
}

/// Answers every prompt with the same text.
pub struct ScriptedAi(pub String);

#[async_trait]
impl AiClient for ScriptedAi {
    async fn generate_text(&self, _prompt: &str, _format: ResponseFormat) -> Result<String, AiError> {
        Ok(self.0.clone())
    }
}

pub fn collector<T: Send + 'static>() -> (Callback<T>, Arc<Mutex<Vec<T>>>) {
    let store = Arc::new(Mutex::new(Vec::new()));
    let sink = store.clone();
    (Arc::new(move |value: T| sink.lock().unwrap().push(value)), store)
}

/// Let spawned subscription tasks drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Wraps the local backend with injectable faults and an insert barrier.
pub struct HookedStore {
    inner: LocalBackend,
    failing_match_lookups: AtomicUsize,
    swipe_gate: Option<Arc<Barrier>>,
}

impl HookedStore {
    pub fn new(inner: LocalBackend) -> Self {
        Self {
            inner,
            failing_match_lookups: AtomicUsize::new(0),
            swipe_gate: None,
        }
    }

    /// The next `count` `match_for_pair` calls fail as unavailable.
    pub fn fail_match_lookups(self, count: usize) -> Self {
        self.failing_match_lookups.store(count, Ordering::SeqCst);
        self
    }

    /// Every `insert_swipe` waits on `gate` after its row is written.
    pub fn gate_swipe_inserts(mut self, gate: Arc<Barrier>) -> Self {
        self.swipe_gate = Some(gate);
        self
    }
}

#[async_trait]
impl RelationalStore for HookedStore {
    async fn insert_message(&self, message: &Message) -> BackendResult<()> {
        self.inner.insert_message(message).await
    }

    async fn conversation(&self, a: &UserId, b: &UserId) -> BackendResult<Vec<Message>> {
        self.inner.conversation(a, b).await
    }

    async fn mark_read(&self, reader: &UserId, partner: &UserId) -> BackendResult<usize> {
        self.inner.mark_read(reader, partner).await
    }

    async fn unread_count(&self, user: &UserId) -> BackendResult<u64> {
        self.inner.unread_count(user).await
    }

    async fn profile(&self, user: &UserId) -> BackendResult<UserProfile> {
        self.inner.profile(user).await
    }

    async fn touch_last_active(&self, user: &UserId, at: DateTime<Utc>) -> BackendResult<()> {
        self.inner.touch_last_active(user, at).await
    }

    async fn swipe_quota(&self, user: &UserId) -> BackendResult<SwipeQuota> {
        self.inner.swipe_quota(user).await
    }

    async fn decrement_daily_swipes(&self, user: &UserId) -> BackendResult<bool> {
        self.inner.decrement_daily_swipes(user).await
    }

    async fn find_swipe(&self, swiper: &UserId, swiped: &UserId) -> BackendResult<Option<Swipe>> {
        self.inner.find_swipe(swiper, swiped).await
    }

    async fn insert_swipe(&self, swipe: &Swipe) -> BackendResult<()> {
        self.inner.insert_swipe(swipe).await?;
        if let Some(gate) = &self.swipe_gate {
            gate.wait().await;
        }
        Ok(())
    }

    async fn create_match_if_not_exists(
        &self,
        a: &UserId,
        b: &UserId,
        insight: &MatchInsight,
    ) -> BackendResult<(Match, bool)> {
        self.inner.create_match_if_not_exists(a, b, insight).await
    }

    async fn match_for_pair(&self, a: &UserId, b: &UserId) -> BackendResult<Option<Match>> {
        let left = self.failing_match_lookups.load(Ordering::SeqCst);
        if left > 0 {
            self.failing_match_lookups.store(left - 1, Ordering::SeqCst);
            return Err(BackendError::Unavailable("injected fault".into()));
        }
        self.inner.match_for_pair(a, b).await
    }

    async fn active_matches(&self, user: &UserId) -> BackendResult<Vec<Match>> {
        self.inner.active_matches(user).await
    }

    async fn deactivate_match(&self, id: Uuid) -> BackendResult<Match> {
        self.inner.deactivate_match(id).await
    }
}
