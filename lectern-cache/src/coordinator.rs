//! Fetch coordination.
//!
//! At most one fetch per key runs on behalf of non-forced callers; they all
//! await the same shared result. Forced fetches (explicit refetch,
//! invalidation) start a new fetch and take over the in-flight record. The
//! superseded fetch keeps running, and the cache's watermark check drops its
//! result if something newer already landed.
//!
//! Fetches run on their own task, so a result is stored even when every
//! caller has gone away.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use lectern_core::{
    CacheEntry, CanonicalKey, FetchError, KeyPrefix, QueryOptions, ResourceKey, RetryPolicy,
    Watermark,
};
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::fetcher::ResourceFetcher;
use crate::store::{EntryPatch, ResourceCache};

type SharedFetch = Shared<BoxFuture<'static, CacheEntry>>;

struct InFlight {
    watermark: Watermark,
    result: SharedFetch,
}

/// What `start` decided.
enum Started {
    Ready(CacheEntry),
    Pending(SharedFetch),
}

impl Started {
    async fn wait(self) -> CacheEntry {
        match self {
            Self::Ready(entry) => entry,
            Self::Pending(fetch) => fetch.await,
        }
    }
}

/// Emitted once per prefix by `invalidate` and by successful mutations.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationSignal {
    pub prefix: KeyPrefix,
    /// Keys marked stale.
    pub matched: Vec<ResourceKey>,
    /// Observed keys a refetch was started for.
    pub refetched: Vec<ResourceKey>,
}

#[derive(Clone)]
pub struct FetchCoordinator {
    cache: Arc<ResourceCache>,
    in_flight: Arc<DashMap<CanonicalKey, InFlight>>,
    default_retry: RetryPolicy,
}

impl FetchCoordinator {
    pub fn new(cache: Arc<ResourceCache>, default_retry: RetryPolicy) -> Self {
        Self {
            cache,
            in_flight: Arc::new(DashMap::new()),
            default_retry,
        }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Return fresh data for `key`, fetching only when needed.
    ///
    /// A fresh success is returned without a network call. Otherwise the
    /// caller joins the fetch already running for the key, or starts one.
    pub async fn ensure_fresh(
        &self,
        key: &ResourceKey,
        fetcher: Arc<dyn ResourceFetcher>,
        options: &QueryOptions,
    ) -> CacheEntry {
        self.cache.register(key, options, Some(Arc::clone(&fetcher)));
        self.start(key, fetcher, options, false).wait().await
    }

    /// Fetch `key` regardless of freshness or fetches in flight.
    pub async fn refetch(
        &self,
        key: &ResourceKey,
        fetcher: Arc<dyn ResourceFetcher>,
        options: &QueryOptions,
    ) -> CacheEntry {
        self.cache.register(key, options, Some(Arc::clone(&fetcher)));
        self.start(key, fetcher, options, true).wait().await
    }

    /// Refetch `key` with the fetcher it was last queried with.
    ///
    /// Returns `None` when the key was never queried through this
    /// coordinator.
    pub async fn refetch_registered(&self, key: &ResourceKey) -> Option<CacheEntry> {
        let (fetcher, options) = self.cache.query_for(key)?;
        Some(self.start(key, fetcher, &options, true).wait().await)
    }

    /// Start the fetch for `key` without waiting for it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn prefetch(&self, key: &ResourceKey, fetcher: Arc<dyn ResourceFetcher>, options: &QueryOptions) {
        self.cache.register(key, options, Some(Arc::clone(&fetcher)));
        let _ = self.start(key, fetcher, options, false);
    }

    /// Mark every key under `prefix` stale and refetch the observed ones.
    ///
    /// Must be called from within a tokio runtime.
    pub fn invalidate(&self, prefix: &KeyPrefix) -> InvalidationSignal {
        let outcome = self.cache.invalidate(prefix);
        let mut refetched = Vec::with_capacity(outcome.observed.len());
        for target in outcome.observed {
            let _ = self.start(&target.key, target.fetcher, &target.options, true);
            refetched.push(target.key);
        }
        InvalidationSignal {
            prefix: prefix.clone(),
            matched: outcome.matched,
            refetched,
        }
    }

    pub fn is_in_flight(&self, key: &ResourceKey) -> bool {
        self.in_flight.contains_key(key.canonical())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Forget in-flight records. The tasks themselves run to completion.
    pub fn clear(&self) {
        self.in_flight.clear();
    }

    fn current(&self, key: &ResourceKey, options: &QueryOptions) -> CacheEntry {
        self.cache
            .get(key)
            .unwrap_or_else(|| CacheEntry::idle(options.stale_after))
    }

    fn start(
        &self,
        key: &ResourceKey,
        fetcher: Arc<dyn ResourceFetcher>,
        options: &QueryOptions,
        force: bool,
    ) -> Started {
        if !options.enabled {
            trace!(key = %key, "Query disabled, not fetching");
            return Started::Ready(self.current(key, options));
        }

        let (shared, watermark) = match self.in_flight.entry(key.canonical().clone()) {
            Entry::Occupied(existing) if !force => {
                self.cache.record_join();
                trace!(key = %key, "Joining fetch in flight");
                return Started::Pending(existing.get().result.clone());
            }
            entry => {
                if !force {
                    if let Some(current) = self.cache.get(key) {
                        if current.is_success() && !current.is_stale {
                            self.cache.record_hit();
                            return Started::Ready(current);
                        }
                    }
                }
                self.cache.record_miss();
                let watermark = self.cache.clock().tick();
                let retry = options
                    .retry
                    .clone()
                    .unwrap_or_else(|| self.default_retry.clone());
                let shared = self.spawn_fetch(key.clone(), fetcher, retry, watermark, options.stale_after);
                let record = InFlight {
                    watermark,
                    result: shared.clone(),
                };
                match entry {
                    Entry::Occupied(mut superseded) => {
                        debug!(
                            key = %key,
                            superseded = superseded.get().watermark.sequence(),
                            watermark = watermark.sequence(),
                            "Forced fetch supersedes fetch in flight"
                        );
                        superseded.insert(record);
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(record);
                    }
                }
                (shared, watermark)
            }
        };

        debug!(key = %key, watermark = watermark.sequence(), force, "Fetch started");
        self.cache.set(key, EntryPatch::Loading { watermark });
        Started::Pending(shared)
    }

    fn spawn_fetch(
        &self,
        key: ResourceKey,
        fetcher: Arc<dyn ResourceFetcher>,
        retry: RetryPolicy,
        watermark: Watermark,
        stale_after: Duration,
    ) -> SharedFetch {
        let cache = Arc::clone(&self.cache);
        let in_flight = Arc::clone(&self.in_flight);
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            let key = task_key;
            let outcome = AssertUnwindSafe(fetch_with_retry(&key, fetcher.as_ref(), &retry))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err((FetchError::network("fetcher panicked"), 1)));

            let patch = match outcome {
                Ok(data) => EntryPatch::Resolved { data, watermark },
                Err((error, attempts)) => {
                    warn!(key = %key, attempts, error = %error, "Fetch failed");
                    EntryPatch::Failed {
                        error,
                        attempts,
                        watermark,
                    }
                }
            };
            if !cache.set(&key, patch) {
                debug!(key = %key, watermark = watermark.sequence(), "Fetch result superseded");
            }
            // Only after the result is stored, so late joiners never miss it.
            in_flight.remove_if(key.canonical(), |_, record| record.watermark == watermark);
            cache
                .get(&key)
                .unwrap_or_else(|| CacheEntry::idle(stale_after))
        });

        let cache = Arc::clone(&self.cache);
        async move {
            match handle.await {
                Ok(entry) => entry,
                Err(join_error) => {
                    error!(key = %key, error = %join_error, "Fetch task did not complete");
                    cache
                        .get(&key)
                        .unwrap_or_else(|| CacheEntry::idle(stale_after))
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// Run `fetcher` until it succeeds, fails permanently, or the policy is
/// exhausted. The error carries the number of attempts made.
async fn fetch_with_retry(
    key: &ResourceKey,
    fetcher: &dyn ResourceFetcher,
    retry: &RetryPolicy,
) -> Result<Value, (FetchError, u32)> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match fetcher.fetch(key).await {
            Ok(data) => return Ok(data),
            Err(err) if err.is_retryable() && attempt < retry.max_attempts() => {
                let delay = retry.backoff_for(attempt - 1);
                warn!(
                    key = %key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying fetch"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err((err, attempt)),
        }
    }
}
