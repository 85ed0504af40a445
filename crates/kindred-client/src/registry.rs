//! Keyed registry of live subscriptions.
//!
//! At most one subscription exists per logical key (`chat:{pair}`,
//! `matches:{user}`, ...). Registering a key that is already live tears the
//! old subscription down first, so re-rendering a view never stacks
//! listeners.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, warn};

/// Releases one subscription's resources. Runs at most once.
pub struct Teardown(Box<dyn FnOnce() + Send>);

impl Teardown {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(release))
    }

    fn run(self, key: &str) {
        if catch_unwind(AssertUnwindSafe(self.0)).is_err() {
            error!(key, "Subscription teardown panicked");
        }
    }
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Teardown")
    }
}

pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, Teardown>>,
    leak_threshold: usize,
    leak_warnings: AtomicUsize,
    leak_report: Mutex<Vec<String>>,
}

impl SubscriptionRegistry {
    pub fn new(leak_threshold: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            leak_threshold,
            leak_warnings: AtomicUsize::new(0),
            leak_report: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Teardown>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register the subscription built by `factory` under `key`, tearing
    /// down any subscription already registered there.
    pub async fn subscribe<F, Fut>(&self, key: &str, factory: F) -> String
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Teardown>,
    {
        let previous = self.entries().remove(key);
        if let Some(teardown) = previous {
            debug!(key, "Replacing live subscription");
            teardown.run(key);
        }

        let teardown = factory().await;

        // Another registration for the same key may have finished while the
        // factory was running.
        let displaced = self.entries().insert(key.to_string(), teardown);
        if let Some(teardown) = displaced {
            warn!(key, "Concurrent registration displaced a subscription");
            teardown.run(key);
        }

        let keys = self.keys();
        if keys.len() > self.leak_threshold {
            warn!(
                live = keys.len(),
                threshold = self.leak_threshold,
                keys = ?keys,
                "Possible subscription leak"
            );
            self.leak_warnings.fetch_add(1, Ordering::Relaxed);
            *self.leak_report.lock().unwrap_or_else(|p| p.into_inner()) = keys;
        }

        key.to_string()
    }

    /// Tear down and forget `key`. Returns whether it was registered.
    pub fn unsubscribe(&self, key: &str) -> bool {
        let entry = self.entries().remove(key);
        match entry {
            Some(teardown) => {
                teardown.run(key);
                debug!(key, "Subscription released");
                true
            }
            None => {
                debug!(key, "Unsubscribe for unknown key ignored");
                false
            }
        }
    }

    /// Tear down everything. Returns how many subscriptions were released.
    pub fn unsubscribe_all(&self) -> usize {
        let drained: Vec<(String, Teardown)> = self.entries().drain().collect();
        let count = drained.len();
        for (key, teardown) in drained {
            teardown.run(&key);
        }
        if count > 0 {
            debug!(count, "All subscriptions released");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    /// How many registrations have left more live keys than the threshold.
    pub fn leak_warnings(&self) -> usize {
        self.leak_warnings.load(Ordering::Relaxed)
    }

    /// The live keys at the most recent leak warning.
    pub fn last_leak_report(&self) -> Vec<String> {
        self.leak_report
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Caller-side handle to one registered subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    key: String,
    registry: Arc<SubscriptionRegistry>,
}

impl SubscriptionHandle {
    pub fn new(key: String, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { key, registry }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_live(&self) -> bool {
        self.registry.contains(&self.key)
    }

    /// Release the subscription. Returns `false` when it was already gone.
    pub fn unsubscribe(&self) -> bool {
        self.registry.unsubscribe(&self.key)
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> Teardown {
        let counter = counter.clone();
        Teardown::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_resubscribe_tears_down_previous() {
        let registry = SubscriptionRegistry::new(20);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        registry.subscribe("chat:a_b", || async { counting(&first) }).await;
        registry.subscribe("chat:a_b", || async { counting(&second) }).await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_runs_teardown_once() {
        let registry = SubscriptionRegistry::new(20);
        let torn = Arc::new(AtomicUsize::new(0));
        registry.subscribe("matches:u", || async { counting(&torn) }).await;

        assert!(registry.unsubscribe("matches:u"));
        assert!(!registry.unsubscribe("matches:u"));
        assert_eq!(torn.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let registry = SubscriptionRegistry::new(20);
        let torn = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b", "c"] {
            registry.subscribe(key, || async { counting(&torn) }).await;
        }

        assert_eq!(registry.unsubscribe_all(), 3);
        assert_eq!(torn.load(Ordering::SeqCst), 3);
        assert!(registry.keys().is_empty());
    }

    #[tokio::test]
    async fn test_leak_warning_names_every_key() {
        let registry = SubscriptionRegistry::new(2);
        let torn = Arc::new(AtomicUsize::new(0));
        for key in ["chat:a_b", "matches:a"] {
            registry.subscribe(key, || async { counting(&torn) }).await;
        }
        assert_eq!(registry.leak_warnings(), 0);

        registry.subscribe("typing:b", || async { counting(&torn) }).await;
        assert_eq!(registry.leak_warnings(), 1);
        assert_eq!(
            registry.last_leak_report(),
            vec!["chat:a_b", "matches:a", "typing:b"]
        );
        // Over the threshold is a warning, not a refusal.
        assert_eq!(registry.len(), 3);
        assert!(registry.contains("typing:b"));
        assert_eq!(torn.load(Ordering::SeqCst), 0);

        registry.unsubscribe("typing:b");
        registry.subscribe("typing:b", || async { counting(&torn) }).await;
        assert_eq!(registry.leak_warnings(), 2);
    }

    #[tokio::test]
    async fn test_panicking_teardown_still_removes_key() {
        let registry = SubscriptionRegistry::new(20);
        registry
            .subscribe("typing:x", || async { Teardown::new(|| panic!("teardown failed")) })
            .await;

        assert!(registry.unsubscribe("typing:x"));
        assert!(!registry.contains("typing:x"));
    }

    #[tokio::test]
    async fn test_handle_releases_its_key() {
        let registry = Arc::new(SubscriptionRegistry::new(1));
        let torn = Arc::new(AtomicUsize::new(0));
        let key = registry.subscribe("presence:u", || async { counting(&torn) }).await;
        let handle = SubscriptionHandle::new(key, registry.clone());

        assert!(handle.is_live());
        assert!(handle.unsubscribe());
        assert!(!handle.is_live());
        assert_eq!(torn.load(Ordering::SeqCst), 1);
    }
}
