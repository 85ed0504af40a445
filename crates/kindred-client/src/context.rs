//! Application context shared by the UI layer.
//!
//! [`AppContext`] owns the coordinators and the background loops that keep
//! them healthy: the reconnect watcher that flushes the retry queue when
//! the realtime link comes back, and the maintenance tick that retries
//! queued messages and trims rate limiter state.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use kindred_realtime::{RealtimeBackend, RealtimeHub};
use kindred_shared::{ConnectionState, UserId};
use kindred_store::Database;

use crate::ai::{AiClient, DisabledAi, ProxyAiClient};
use crate::backend::{KeyValueStore, LocalBackend, QuotaPolicy, RelationalStore, SqliteKv};
use crate::chat::ChatCoordinator;
use crate::config::CoreConfig;
use crate::local_echo::{EchoEndpoint, HttpEchoEndpoint, LocalEchoBus, LocalEchoTransport};
use crate::matches::MatchCoordinator;
use crate::presence::PresenceCoordinator;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::registry::SubscriptionRegistry;
use crate::retry_queue::PersistentRetryQueue;

/// The collaborators a context is built from.
pub struct Collaborators {
    pub store: Arc<dyn RelationalStore>,
    pub realtime: Arc<dyn RealtimeBackend>,
    pub ai: Arc<dyn AiClient>,
    pub kv: Arc<dyn KeyValueStore>,
    pub echo_bus: LocalEchoBus,
    pub echo_endpoint: Option<Arc<dyn EchoEndpoint>>,
}

pub struct AppContext {
    config: CoreConfig,
    realtime: Arc<dyn RealtimeBackend>,
    registry: Arc<SubscriptionRegistry>,
    limiter: RateLimiter,
    chat: ChatCoordinator,
    matches: MatchCoordinator,
    presence: PresenceCoordinator,
    echo: Arc<LocalEchoTransport>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A context running on the local SQLite store and in-process hub.
pub struct LocalApp {
    pub context: AppContext,
    pub hub: RealtimeHub,
    pub database: Arc<Mutex<Database>>,
}

impl AppContext {
    pub fn new(config: CoreConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            store,
            realtime,
            ai,
            kv,
            echo_bus,
            echo_endpoint,
        } = collaborators;

        let registry = Arc::new(SubscriptionRegistry::new(config.leak_threshold));
        let limiter = RateLimiter::new();
        let queue = Arc::new(PersistentRetryQueue::new(kv));
        let echo = Arc::new(LocalEchoTransport::new(echo_bus, echo_endpoint));

        let chat = ChatCoordinator::new(
            store.clone(),
            realtime.clone(),
            queue,
            limiter.clone(),
            registry.clone(),
            ai.clone(),
            echo.clone(),
        );
        let matches = MatchCoordinator::new(
            store.clone(),
            realtime.clone(),
            ai,
            limiter.clone(),
            registry.clone(),
        );
        let presence = PresenceCoordinator::new(
            store,
            realtime.clone(),
            registry.clone(),
            config.heartbeat_interval,
            config.typing_timeout,
        );

        Self {
            echo,
            config,
            realtime,
            registry,
            limiter,
            chat,
            matches,
            presence,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build a context over the local database and a fresh in-process hub.
    /// A `db_path` of `:memory:` opens an in-memory database.
    pub fn open_local(config: CoreConfig) -> anyhow::Result<LocalApp> {
        let database = match config.db_path {
            Some(ref path) if path.as_os_str() == ":memory:" => Database::open_in_memory(),
            Some(ref path) => Database::open_at(path),
            None => Database::new(),
        }
        .context("Failed to open the Kindred database")?;
        let database = Arc::new(Mutex::new(database));

        let hub = RealtimeHub::new();
        let backend = LocalBackend::new(
            database.clone(),
            hub.clone(),
            QuotaPolicy {
                daily_limit: config.daily_swipe_limit,
                utc_offset_minutes: config.quota_utc_offset_minutes,
            },
        );

        let ai: Arc<dyn AiClient> = match config.ai_proxy_url {
            Some(ref url) => Arc::new(ProxyAiClient::new(url, config.ai_session_token.clone())),
            None => Arc::new(DisabledAi),
        };
        let echo_endpoint = config
            .echo_url
            .as_deref()
            .map(|url| Arc::new(HttpEchoEndpoint::new(url)) as Arc<dyn EchoEndpoint>);

        let collaborators = Collaborators {
            store: Arc::new(backend),
            realtime: Arc::new(hub.clone()),
            ai,
            kv: Arc::new(SqliteKv::new(database.clone())),
            echo_bus: LocalEchoBus::new(),
            echo_endpoint,
        };

        Ok(LocalApp {
            context: AppContext::new(config, collaborators),
            hub,
            database,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn chat(&self) -> &ChatCoordinator {
        &self.chat
    }

    pub fn matches(&self) -> &MatchCoordinator {
        &self.matches
    }

    pub fn presence(&self) -> &PresenceCoordinator {
        &self.presence
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn echo(&self) -> &LocalEchoTransport {
        &self.echo
    }

    /// Sign `user` in: go online, start the echo transport and the
    /// background loops.
    pub async fn start(&self, user: UserId) {
        self.presence.initialize(user).await;
        self.echo.start();

        let mut connection = self.realtime.connection();
        let chat = self.chat.clone();
        let watcher = tokio::spawn(async move {
            while connection.changed().await.is_ok() {
                let state = *connection.borrow_and_update();
                if state == ConnectionState::Connected {
                    info!("Realtime link restored, flushing retry queue");
                    chat.retry_pending().await;
                } else {
                    warn!("Realtime link lost, sends will be queued");
                }
            }
        });

        let chat = self.chat.clone();
        let limiter = self.limiter.clone();
        let period = self.config.heartbeat_interval;
        let stale_after = RateLimitConfig::MESSAGE
            .window
            .max(RateLimitConfig::SWIPE.window);
        let maintenance = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                chat.retry_pending().await;
                limiter.purge_stale(stale_after);
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.push(watcher);
        tasks.push(maintenance);
        info!(user = %user, "Kindred core started");
    }

    /// Sign out: drop every subscription, leave presence, stop background work.
    pub async fn shutdown(&self) {
        let released = self.registry.unsubscribe_all();
        self.presence.teardown().await;
        self.echo.stop();

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        info!(released, "Kindred core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_store::UserProfile;
    use std::path::PathBuf;

    fn in_memory() -> LocalApp {
        let config = CoreConfig {
            db_path: Some(PathBuf::from(":memory:")),
            ..CoreConfig::default()
        };
        AppContext::open_local(config).unwrap()
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let app = in_memory();
        let user = UserProfile::new("Ada");
        app.database.lock().unwrap().upsert_user(&user).unwrap();

        app.context.start(user.id).await;
        assert_eq!(app.context.presence().current_user(), Some(user.id));

        app.context.shutdown().await;
        assert!(app.context.registry().is_empty());
        assert_eq!(app.context.presence().current_user(), None);
    }

    #[tokio::test]
    async fn test_reconnect_flushes_queue() {
        let app = in_memory();
        let (a, b) = (UserProfile::new("Ada"), UserProfile::new("Bo"));
        {
            let db = app.database.lock().unwrap();
            db.upsert_user(&a).unwrap();
            db.upsert_user(&b).unwrap();
        }
        app.context.start(a.id).await;

        app.hub.set_connected(false);
        app.context.chat().send_text(a.id, b.id, "hello?").await.unwrap();
        assert_eq!(app.context.chat().queue().len().unwrap(), 1);

        app.hub.set_connected(true);
        for _ in 0..50 {
            if app.context.chat().queue().is_empty().unwrap() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(app.context.chat().queue().is_empty().unwrap());
        assert_eq!(app.database.lock().unwrap().unread_count(&b.id).unwrap(), 1);

        app.context.shutdown().await;
    }

    #[test]
    fn test_open_local_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig {
            db_path: Some(dir.path().join("kindred.db")),
            ..CoreConfig::default()
        };
        let app = AppContext::open_local(config).unwrap();
        assert!(app.database.lock().unwrap().path().is_some());
    }
}
