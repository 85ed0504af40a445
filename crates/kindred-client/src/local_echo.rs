//! Development transport that mirrors sent messages between local clients.
//!
//! Every client ("tab") attached to the same [`LocalEchoBus`] sees the
//! messages the others send. When an [`EchoEndpoint`] is configured, sends
//! are also posted to it and its echoes are delivered like bus messages.
//! The transport does no dedup of its own; the chat coordinator merges its
//! output into each live conversation's
//! [`MessageSink`](crate::dedup::MessageSink).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kindred_shared::backoff_delay;
use kindred_store::Message;

use crate::error::EchoError;
use crate::events::{deliver, Callback};

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct EchoFrame {
    origin: Uuid,
    message: Message,
}

/// Process-local broadcast shared by every tab.
#[derive(Clone)]
pub struct LocalEchoBus {
    tx: broadcast::Sender<EchoFrame>,
}

impl LocalEchoBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }
}

impl Default for LocalEchoBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait EchoEndpoint: Send + Sync {
    async fn connect(&self) -> Result<(), EchoError>;
    async fn echo(&self, message: &Message) -> Result<Message, EchoError>;
}

/// [`EchoEndpoint`] over HTTP: `GET {base}/health` and `POST {base}/echo`.
pub struct HttpEchoEndpoint {
    http: reqwest::Client,
    base_url: String,
}

impl HttpEchoEndpoint {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl EchoEndpoint for HttpEchoEndpoint {
    async fn connect(&self) -> Result<(), EchoError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| EchoError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EchoError::Http(response.status().as_u16()));
        }
        Ok(())
    }

    async fn echo(&self, message: &Message) -> Result<Message, EchoError> {
        let response = self
            .http
            .post(format!("{}/echo", self.base_url))
            .json(message)
            .send()
            .await
            .map_err(|e| EchoError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EchoError::Http(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| EchoError::Unreachable(e.to_string()))
    }
}

struct Link {
    endpoint: Arc<dyn EchoEndpoint>,
    connected: AtomicBool,
    attempts: AtomicU32,
    wake: Notify,
}

pub struct LocalEchoTransport {
    tab_id: Uuid,
    bus: LocalEchoBus,
    link: Option<Arc<Link>>,
    callbacks: Arc<Mutex<Vec<Callback<Message>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn dispatch(callbacks: &Mutex<Vec<Callback<Message>>>, message: Message) {
    let callbacks = callbacks.lock().unwrap_or_else(|p| p.into_inner()).clone();
    for callback in &callbacks {
        deliver("local_echo", callback, message.clone());
    }
}

impl LocalEchoTransport {
    pub fn new(bus: LocalEchoBus, endpoint: Option<Arc<dyn EchoEndpoint>>) -> Self {
        Self {
            tab_id: Uuid::new_v4(),
            bus,
            link: endpoint.map(|endpoint| {
                Arc::new(Link {
                    endpoint,
                    connected: AtomicBool::new(false),
                    attempts: AtomicU32::new(0),
                    wake: Notify::new(),
                })
            }),
            callbacks: Arc::new(Mutex::new(Vec::new())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn tab_id(&self) -> Uuid {
        self.tab_id
    }

    /// Start the bus listener and, with an endpoint, the reconnect supervisor.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if !tasks.is_empty() {
            return;
        }

        let mut rx = self.bus.tx.subscribe();
        let tab_id = self.tab_id;
        let callbacks = self.callbacks.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) if frame.origin != tab_id => dispatch(&callbacks, frame.message),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Local echo listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        if let Some(link) = self.link.clone() {
            tasks.push(tokio::spawn(supervise(link)));
        }
    }

    pub fn on_message(&self, callback: Callback<Message>) {
        self.callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(callback);
    }

    pub fn send(&self, message: &Message) {
        let frame = EchoFrame {
            origin: self.tab_id,
            message: message.clone(),
        };
        if self.bus.tx.send(frame).is_err() {
            debug!(id = %message.id, "No tab listening on the local echo bus");
        }

        let Some(link) = self.link.clone() else {
            return;
        };
        if !link.connected.load(Ordering::SeqCst) {
            debug!(id = %message.id, "Echo endpoint down, local bus only");
            return;
        }

        let message = message.clone();
        let callbacks = self.callbacks.clone();
        tokio::spawn(async move {
            match link.endpoint.echo(&message).await {
                Ok(echoed) => dispatch(&callbacks, echoed),
                Err(e) => {
                    warn!(error = %e, "Echo endpoint failed, reconnecting");
                    link.connected.store(false, Ordering::SeqCst);
                    link.wake.notify_one();
                }
            }
        });
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|l| l.connected.load(Ordering::SeqCst))
    }

    /// Consecutive failed connect attempts since the last success.
    pub fn reconnect_attempts(&self) -> u32 {
        self.link
            .as_ref()
            .map_or(0, |l| l.attempts.load(Ordering::SeqCst))
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }
    }
}

impl Drop for LocalEchoTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn supervise(link: Arc<Link>) {
    loop {
        if !link.connected.load(Ordering::SeqCst) {
            match link.endpoint.connect().await {
                Ok(()) => {
                    link.attempts.store(0, Ordering::SeqCst);
                    link.connected.store(true, Ordering::SeqCst);
                    info!("Echo endpoint connected");
                }
                Err(e) => {
                    let attempt = link.attempts.fetch_add(1, Ordering::SeqCst);
                    let delay = backoff_delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Echo connect failed");
                    sleep(delay).await;
                    continue;
                }
            }
        }
        link.wake.notified().await;
    }
}
