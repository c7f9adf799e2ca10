//! Keyed entry storage.
//!
//! Every write goes through [`ResourceCache::set`] (or `seed`, `invalidate`,
//! `evict`, `clear`). Fetch results carry the watermark taken when their
//! fetch started, and the slot only accepts results newer than the last one
//! it applied. Subscribers are notified after the slot lock is released,
//! with a version that orders the notification against concurrent ones.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lectern_core::{
    CacheEntry, CanonicalKey, FetchError, KeyPrefix, QueryOptions, QueryStatus, ResourceKey,
    Watermark, WatermarkClock,
};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::fetcher::ResourceFetcher;
use crate::registry::SubscriberRegistry;

/// A change to merge into an entry.
#[derive(Debug, Clone)]
pub enum EntryPatch {
    /// A fetch started. Previous data stays visible.
    Loading { watermark: Watermark },
    /// A fetch (or direct write) produced data.
    Resolved { data: Value, watermark: Watermark },
    /// A fetch gave up after `attempts` tries.
    Failed {
        error: FetchError,
        attempts: u32,
        watermark: Watermark,
    },
}

impl EntryPatch {
    pub fn watermark(&self) -> Watermark {
        match self {
            Self::Loading { watermark }
            | Self::Resolved { watermark, .. }
            | Self::Failed { watermark, .. } => *watermark,
        }
    }
}

/// A subscribed key the coordinator should refetch after invalidation.
#[derive(Clone)]
pub struct RefetchTarget {
    pub key: ResourceKey,
    pub fetcher: Arc<dyn ResourceFetcher>,
    pub options: QueryOptions,
}

impl std::fmt::Debug for RefetchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefetchTarget")
            .field("key", &self.key)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`ResourceCache::invalidate`].
#[derive(Debug, Default)]
pub struct Invalidation {
    /// Every stored key the prefix selected, now stale.
    pub matched: Vec<ResourceKey>,
    /// The matched keys that are observed and can be refetched.
    pub observed: Vec<RefetchTarget>,
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Fresh entries served without a network call.
    pub hits: u64,
    /// Calls that started a network fetch.
    pub misses: u64,
    /// Calls that joined a fetch already in flight.
    pub deduplicated: u64,
    /// Results and writes rejected as superseded.
    pub discarded: u64,
    pub evictions: u64,
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    deduplicated: AtomicU64,
    discarded: AtomicU64,
    evictions: AtomicU64,
}

struct Slot {
    key: ResourceKey,
    status: QueryStatus,
    data: Option<Value>,
    error: Option<FetchError>,
    failure_count: u32,
    last_fetched_at: Option<DateTime<Utc>>,
    fetched_at: Option<Instant>,
    options: QueryOptions,
    fetcher: Option<Arc<dyn ResourceFetcher>>,
    /// Newest result applied. Starts at the slot's floor.
    resolved: Watermark,
    /// Newest fetch started.
    started: Watermark,
    invalidated_at: Option<Watermark>,
    unobserved_since: Option<Instant>,
}

impl Slot {
    fn new(key: ResourceKey, options: QueryOptions, floor: Watermark, now: Instant) -> Self {
        Self {
            key,
            status: QueryStatus::Idle,
            data: None,
            error: None,
            failure_count: 0,
            last_fetched_at: None,
            fetched_at: None,
            options,
            fetcher: None,
            resolved: floor,
            started: floor,
            invalidated_at: None,
            unobserved_since: Some(now),
        }
    }

    fn is_stale(&self, now: Instant) -> bool {
        if self.invalidated_at.is_some() {
            return true;
        }
        match self.fetched_at {
            Some(at) => now.saturating_duration_since(at) >= self.options.stale_after,
            None => true,
        }
    }

    fn snapshot(&self, now: Instant) -> CacheEntry {
        CacheEntry {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            last_fetched_at: self.last_fetched_at,
            stale_after: self.options.stale_after,
            is_stale: self.is_stale(now),
            failure_count: self.failure_count,
        }
    }

    fn apply(&mut self, patch: EntryPatch, now: Instant) -> bool {
        match patch {
            EntryPatch::Loading { watermark } => {
                if !watermark.is_newer_than(&self.resolved) || !watermark.is_newer_than(&self.started) {
                    return false;
                }
                self.started = watermark;
                self.status = QueryStatus::Loading;
            }
            EntryPatch::Resolved { data, watermark } => {
                if !watermark.is_newer_than(&self.resolved) {
                    return false;
                }
                self.resolved = watermark;
                // A newer fetch still running keeps the entry loading.
                if !self.started.is_newer_than(&watermark) {
                    self.started = watermark;
                    self.status = QueryStatus::Success;
                }
                self.data = Some(data);
                self.error = None;
                self.failure_count = 0;
                self.fetched_at = Some(now);
                self.last_fetched_at = Some(Utc::now());
                self.invalidated_at = self.invalidated_at.filter(|at| at.is_newer_than(&watermark));
            }
            EntryPatch::Failed {
                error,
                attempts,
                watermark,
            } => {
                if !watermark.is_newer_than(&self.resolved) || self.started.is_newer_than(&watermark) {
                    return false;
                }
                self.resolved = watermark;
                self.status = QueryStatus::Error;
                self.error = Some(error);
                self.failure_count = attempts;
            }
        }
        true
    }
}

/// Concurrent map from canonical key to entry.
pub struct ResourceCache {
    slots: DashMap<CanonicalKey, Slot>,
    registry: Arc<SubscriberRegistry>,
    clock: WatermarkClock,
    /// Results older than the last `clear` never land.
    cleared_at: AtomicU64,
    /// Version stamped on every applied change, for ordered delivery.
    deliveries: AtomicU64,
    counters: Counters,
}

impl ResourceCache {
    pub fn new(registry: Arc<SubscriberRegistry>) -> Self {
        Self {
            slots: DashMap::new(),
            registry,
            clock: WatermarkClock::new(),
            cleared_at: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &WatermarkClock {
        &self.clock
    }

    fn floor(&self) -> Watermark {
        Watermark::from_sequence(self.cleared_at.load(Ordering::SeqCst))
    }

    pub fn get(&self, key: &ResourceKey) -> Option<CacheEntry> {
        self.slots
            .get(key.canonical())
            .map(|slot| slot.snapshot(Instant::now()))
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.slots.contains_key(key.canonical())
    }

    /// Ensure a slot exists for `key` and record how it is queried.
    ///
    /// The most recent caller's options and fetcher win.
    pub fn register(
        &self,
        key: &ResourceKey,
        options: &QueryOptions,
        fetcher: Option<Arc<dyn ResourceFetcher>>,
    ) -> CacheEntry {
        let now = Instant::now();
        let floor = self.floor();
        let mut slot = self
            .slots
            .entry(key.canonical().clone())
            .or_insert_with(|| Slot::new(key.clone(), options.clone(), floor, now));
        slot.options = options.clone();
        if fetcher.is_some() {
            slot.fetcher = fetcher;
        }
        slot.snapshot(now)
    }

    /// Merge `patch` into the entry for `key`. Returns whether the patch
    /// was applied.
    ///
    /// Only a starting fetch creates a missing entry; a result for a key
    /// that was cleared or evicted meanwhile is dropped.
    pub fn set(&self, key: &ResourceKey, patch: EntryPatch) -> bool {
        let now = Instant::now();
        let watermark = patch.watermark();
        let floor = self.floor();
        let (version, snapshot) = {
            let mut slot = match self.slots.entry(key.canonical().clone()) {
                Entry::Occupied(occupied) => occupied.into_ref(),
                Entry::Vacant(vacant)
                    if matches!(patch, EntryPatch::Loading { .. }) && watermark.is_newer_than(&floor) =>
                {
                    vacant.insert(Slot::new(key.clone(), QueryOptions::always_stale(), floor, now))
                }
                Entry::Vacant(_) => return self.discard(key, watermark),
            };
            if !slot.apply(patch, now) {
                return self.discard(key, watermark);
            }
            // Stamped under the slot lock so versions follow apply order.
            let version = self.deliveries.fetch_add(1, Ordering::SeqCst) + 1;
            (version, slot.snapshot(now))
        };
        self.registry.notify(key.canonical(), version, &snapshot);
        true
    }

    fn discard(&self, key: &ResourceKey, watermark: Watermark) -> bool {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        trace!(key = %key, watermark = watermark.sequence(), "Discarded superseded write");
        false
    }

    /// Write `data` as a fresh success, superseding any fetch in flight.
    pub fn seed(&self, key: &ResourceKey, data: Value, options: &QueryOptions) -> CacheEntry {
        let now = Instant::now();
        let floor = self.floor();
        self.slots
            .entry(key.canonical().clone())
            .or_insert_with(|| Slot::new(key.clone(), options.clone(), floor, now));
        let watermark = self.clock.tick();
        self.set(key, EntryPatch::Resolved { data, watermark });
        debug!(key = %key, "Seeded cache entry");
        self.get(key).unwrap_or_else(|| CacheEntry::idle(options.stale_after))
    }

    /// Mark every key selected by `prefix` stale.
    pub fn invalidate(&self, prefix: &KeyPrefix) -> Invalidation {
        let mark = self.clock.tick();
        let mut outcome = Invalidation::default();
        for mut item in self.slots.iter_mut() {
            let slot = item.value_mut();
            if !prefix.matches(&slot.key) {
                continue;
            }
            slot.invalidated_at = Some(mark);
            outcome.matched.push(slot.key.clone());
            if !slot.options.enabled || !self.registry.has_subscribers(slot.key.canonical()) {
                continue;
            }
            if let Some(fetcher) = &slot.fetcher {
                outcome.observed.push(RefetchTarget {
                    key: slot.key.clone(),
                    fetcher: Arc::clone(fetcher),
                    options: slot.options.clone(),
                });
            }
        }
        debug!(
            prefix = %prefix,
            matched = outcome.matched.len(),
            observed = outcome.observed.len(),
            "Invalidated cache entries"
        );
        outcome
    }

    pub fn evict(&self, key: &ResourceKey) -> bool {
        let evicted = self.slots.remove(key.canonical()).is_some();
        if evicted {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Evicted cache entry");
        }
        evicted
    }

    /// Drop every entry. Fetches still in flight will not repopulate them.
    pub fn clear(&self) {
        let mark = self.clock.tick();
        self.cleared_at.store(mark.sequence(), Ordering::SeqCst);
        let dropped = self.slots.len();
        self.slots.clear();
        debug!(dropped, "Cleared cache");
    }

    pub fn mark_observed(&self, key: &ResourceKey) {
        if let Some(mut slot) = self.slots.get_mut(key.canonical()) {
            slot.unobserved_since = None;
        }
    }

    pub fn mark_unobserved(&self, key: &ResourceKey) {
        if let Some(mut slot) = self.slots.get_mut(key.canonical()) {
            slot.unobserved_since.get_or_insert_with(Instant::now);
        }
    }

    /// Evict entries that have gone unobserved for longer than their grace
    /// window. Entries with a fetch running are kept.
    pub fn sweep(&self, default_grace: Duration) -> Vec<ResourceKey> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.slots.retain(|_, slot| {
            if self.registry.has_subscribers(slot.key.canonical()) {
                slot.unobserved_since = None;
                return true;
            }
            if slot.status == QueryStatus::Loading {
                return true;
            }
            let since = *slot.unobserved_since.get_or_insert(now);
            let grace = slot.options.gc_after.unwrap_or(default_grace);
            if now.saturating_duration_since(since) >= grace {
                evicted.push(slot.key.clone());
                false
            } else {
                true
            }
        });
        if !evicted.is_empty() {
            self.counters
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            debug!(count = evicted.len(), "Swept unobserved cache entries");
        }
        evicted
    }

    /// The fetcher and options last registered for `key`.
    pub fn query_for(&self, key: &ResourceKey) -> Option<(Arc<dyn ResourceFetcher>, QueryOptions)> {
        let slot = self.slots.get(key.canonical())?;
        let fetcher = slot.fetcher.as_ref()?;
        Some((Arc::clone(fetcher), slot.options.clone()))
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.slots.iter().map(|item| item.key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn record_hit(&self) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_join(&self) {
        self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            deduplicated: self.counters.deduplicated.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entry_count: self.slots.len() as u64,
        }
    }
}
