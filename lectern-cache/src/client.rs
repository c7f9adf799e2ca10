//! The query client: one shared cache context per application.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use lectern_core::{
    CacheConfig, CacheEntry, ConfigError, KeyPrefix, MutationError, QueryOptions, ResourceKey,
};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::{FetchCoordinator, InvalidationSignal};
use crate::fetcher::ResourceFetcher;
use crate::mutation::MutationExecutor;
use crate::registry::{SubscriberRegistry, Unsubscribe};
use crate::store::{CacheStats, ResourceCache};

struct ClientInner {
    config: CacheConfig,
    registry: Arc<SubscriberRegistry>,
    cache: Arc<ResourceCache>,
    coordinator: FetchCoordinator,
    mutations: MutationExecutor,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ClientInner {
    fn stop_sweeper(&self) {
        let handle = match self.sweeper.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

/// Shared handle to a query cache.
///
/// Cloning is cheap; every clone talks to the same cache. Create one per
/// application (or per test) and dispose it when done.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    /// Validate `config` and build a client.
    ///
    /// When called inside a tokio runtime, a background sweeper evicts
    /// unobserved entries every `sweep_interval`. Outside a runtime no
    /// sweeper runs and [`sweep`](Self::sweep) must be called by hand.
    pub fn create(config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(SubscriberRegistry::new());
        let cache = Arc::new(ResourceCache::new(Arc::clone(&registry)));
        let coordinator = FetchCoordinator::new(Arc::clone(&cache), config.retry.clone());
        let mutations = MutationExecutor::new(coordinator.clone());

        let client = Self {
            inner: Arc::new(ClientInner {
                config,
                registry,
                cache,
                coordinator,
                mutations,
                sweeper: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        };
        client.start_sweeper();
        info!(
            gc_grace_secs = client.inner.config.gc_grace.as_secs(),
            sweep_interval_secs = client.inner.config.sweep_interval.as_secs(),
            "Query client created"
        );
        Ok(client)
    }

    fn start_sweeper(&self) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("No tokio runtime, eviction sweeper not started");
            return;
        };
        let cache = Arc::downgrade(&self.inner.cache);
        let interval = self.inner.config.sweep_interval;
        let grace = self.inner.config.gc_grace;
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = Weak::upgrade(&cache) else {
                    break;
                };
                cache.sweep(grace);
            }
        });
        match self.inner.sweeper.lock() {
            Ok(mut guard) => *guard = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
    }

    /// Stop the sweeper and drop every entry and subscriber.
    ///
    /// Later calls are no-ops; mutations fail with
    /// [`MutationError::Disposed`].
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.stop_sweeper();
        self.inner.coordinator.clear();
        self.inner.cache.clear();
        self.inner.registry.clear();
        info!("Query client disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Observe `key`. `on_change` receives every later snapshot.
    ///
    /// Subscribing counts as mounting: a stale or missing entry is fetched
    /// in the background. Dropping the returned [`Subscription`] releases it.
    pub fn subscribe<F>(
        &self,
        key: &ResourceKey,
        fetcher: Arc<dyn ResourceFetcher>,
        options: QueryOptions,
        on_change: F,
    ) -> Subscription
    where
        F: Fn(&CacheEntry) + Send + Sync + 'static,
    {
        if self.is_disposed() {
            return Subscription {
                key: key.clone(),
                handle: Unsubscribe::released(key.canonical().clone()),
                client: Weak::new(),
            };
        }

        let inner = &self.inner;
        inner.cache.register(key, &options, Some(Arc::clone(&fetcher)));
        let handle = inner.registry.subscribe(key.canonical(), Arc::new(on_change));
        inner.cache.mark_observed(key);
        debug!(
            key = %key,
            subscribers = inner.registry.subscriber_count(key.canonical()),
            "Subscribed"
        );
        inner.coordinator.prefetch(key, fetcher, &options);

        Subscription {
            key: key.clone(),
            handle,
            client: Arc::downgrade(inner),
        }
    }

    /// Fresh data for `key`, from cache when possible.
    pub async fn query(
        &self,
        key: &ResourceKey,
        fetcher: Arc<dyn ResourceFetcher>,
        options: QueryOptions,
    ) -> CacheEntry {
        if self.is_disposed() {
            return CacheEntry::idle(options.stale_after);
        }
        self.inner.coordinator.ensure_fresh(key, fetcher, &options).await
    }

    /// Fetch `key` even if it is fresh or already being fetched.
    pub async fn refetch(
        &self,
        key: &ResourceKey,
        fetcher: Arc<dyn ResourceFetcher>,
        options: QueryOptions,
    ) -> CacheEntry {
        if self.is_disposed() {
            return CacheEntry::idle(options.stale_after);
        }
        self.inner.coordinator.refetch(key, fetcher, &options).await
    }

    pub fn invalidate(&self, prefix: &KeyPrefix) -> InvalidationSignal {
        if self.is_disposed() {
            return InvalidationSignal {
                prefix: prefix.clone(),
                matched: Vec::new(),
                refetched: Vec::new(),
            };
        }
        self.inner.coordinator.invalidate(prefix)
    }

    /// Run a write, then invalidate `affected` if it succeeded.
    pub async fn mutate<T, E, Fut>(&self, mutation: Fut, affected: &[KeyPrefix]) -> Result<T, MutationError>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Into<MutationError>,
    {
        if self.is_disposed() {
            return Err(MutationError::Disposed);
        }
        self.inner.mutations.execute(mutation, affected).await
    }

    pub async fn mutate_reporting<T, E, Fut>(
        &self,
        mutation: Fut,
        affected: &[KeyPrefix],
    ) -> Result<(T, Vec<InvalidationSignal>), MutationError>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Into<MutationError>,
    {
        if self.is_disposed() {
            return Err(MutationError::Disposed);
        }
        self.inner.mutations.execute_reporting(mutation, affected).await
    }

    /// Store `data` for `key` as if it had just been fetched.
    pub fn seed(&self, key: &ResourceKey, data: Value, options: QueryOptions) -> CacheEntry {
        if self.is_disposed() {
            return CacheEntry::idle(options.stale_after);
        }
        self.inner.cache.seed(key, data, &options)
    }

    pub fn get(&self, key: &ResourceKey) -> Option<CacheEntry> {
        self.inner.cache.get(key)
    }

    pub fn evict(&self, key: &ResourceKey) -> bool {
        self.inner.cache.evict(key)
    }

    /// Drop every entry. Subscribers stay registered and refill on their
    /// next query.
    pub fn clear(&self) {
        self.inner.coordinator.clear();
        self.inner.cache.clear();
    }

    /// Evict unobserved entries past their grace window now.
    pub fn sweep(&self) -> Vec<ResourceKey> {
        self.inner.cache.sweep(self.inner.config.gc_grace)
    }

    pub fn is_fetching(&self, key: &ResourceKey) -> bool {
        self.inner.coordinator.is_in_flight(key)
    }

    pub fn subscriber_count(&self, key: &ResourceKey) -> usize {
        self.inner.registry.subscriber_count(key.canonical())
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }
}

/// A binding's hold on one key.
///
/// Dropping it unsubscribes. Once a key has no subscribers left, its grace
/// window starts.
pub struct Subscription {
    key: ResourceKey,
    handle: Unsubscribe,
    client: Weak<ClientInner>,
}

impl Subscription {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// The entry as it is right now.
    pub fn current(&self) -> Option<CacheEntry> {
        self.client.upgrade()?.cache.get(&self.key)
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_released()
    }

    /// Returns `true` only the first time.
    pub fn unsubscribe(&self) -> bool {
        if !self.handle.unsubscribe() {
            return false;
        }
        if let Some(inner) = self.client.upgrade() {
            if !inner.registry.has_subscribers(self.key.canonical()) {
                inner.cache.mark_unobserved(&self.key);
            }
        }
        debug!(key = %self.key, "Unsubscribed");
        true
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}
