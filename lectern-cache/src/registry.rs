//! Subscriber registry.
//!
//! Tracks which UI bindings observe which keys and delivers entry snapshots
//! to them. Delivery is synchronous and in subscription order. No lock is
//! held while callbacks run, so a callback may freely call back into the
//! cache.
//!
//! Every snapshot carries the version the cache stamped on it when the
//! change was applied. A subscriber only ever sees versions go up: an older
//! snapshot that loses a race with a newer one is dropped, and a snapshot
//! that arrives while the subscriber's callback is running is handed to
//! that callback's caller to deliver once it returns.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dashmap::DashMap;
use lectern_core::{CacheEntry, CanonicalKey};

/// Callback invoked with the latest snapshot of an observed key.
pub type ChangeCallback = Arc<dyn Fn(&CacheEntry) + Send + Sync>;

/// Identifies one subscription within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

#[derive(Default)]
struct DeliveryState {
    /// Newest version accepted for this subscriber.
    seen: u64,
    /// Accepted but not yet handed to the callback.
    pending: Option<CacheEntry>,
    /// A thread is inside the delivery loop.
    delivering: bool,
}

struct Subscriber {
    id: SubscriberId,
    on_change: ChangeCallback,
    released: Arc<AtomicBool>,
    state: Mutex<DeliveryState>,
}

impl Subscriber {
    fn state(&self) -> MutexGuard<'_, DeliveryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Accept `entry` if it is newer than anything this subscriber has
    /// seen, then run the callback unless another call is already doing so.
    fn deliver(&self, version: u64, entry: &CacheEntry) -> bool {
        {
            let mut state = self.state();
            if self.is_released() || version <= state.seen {
                return false;
            }
            state.seen = version;
            state.pending = Some(entry.clone());
            if state.delivering {
                return true;
            }
            state.delivering = true;
        }

        let _running = Running(self);
        loop {
            let next = {
                let mut state = self.state();
                match state.pending.take() {
                    Some(next) if !self.is_released() => next,
                    _ => {
                        state.delivering = false;
                        return true;
                    }
                }
            };
            (self.on_change)(&next);
        }
    }
}

/// Resets the delivery loop if a callback panics, so the subscriber keeps
/// receiving later snapshots.
struct Running<'a>(&'a Subscriber);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut state = self.0.state();
            state.pending = None;
            state.delivering = false;
        }
    }
}

#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: DashMap<CanonicalKey, Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `on_change` for `key`.
    ///
    /// The returned handle unsubscribes when dropped.
    pub fn subscribe(self: &Arc<Self>, key: &CanonicalKey, on_change: ChangeCallback) -> Unsubscribe {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let released = Arc::new(AtomicBool::new(false));
        self.subscribers
            .entry(key.clone())
            .or_default()
            .push(Arc::new(Subscriber {
                id,
                on_change,
                released: Arc::clone(&released),
                state: Mutex::new(DeliveryState::default()),
            }));
        Unsubscribe {
            registry: Arc::downgrade(self),
            key: key.clone(),
            id,
            released,
        }
    }

    /// Deliver `entry`, stamped with `version`, to every subscriber of
    /// `key`. Returns how many subscribers accepted it.
    ///
    /// Versions must grow in the order changes were applied to the key.
    pub fn notify(&self, key: &CanonicalKey, version: u64, entry: &CacheEntry) -> usize {
        let subscribers: Vec<Arc<Subscriber>> = match self.subscribers.get(key) {
            Some(subs) => subs.iter().map(Arc::clone).collect(),
            None => return 0,
        };
        subscribers
            .iter()
            .filter(|subscriber| subscriber.deliver(version, entry))
            .count()
    }

    pub fn subscriber_count(&self, key: &CanonicalKey) -> usize {
        self.subscribers.get(key).map(|subs| subs.len()).unwrap_or(0)
    }

    pub fn has_subscribers(&self, key: &CanonicalKey) -> bool {
        self.subscriber_count(key) > 0
    }

    /// Drop every subscriber. Outstanding handles become no-ops and pending
    /// deliveries are abandoned.
    pub fn clear(&self) {
        for subs in self.subscribers.iter() {
            for subscriber in subs.iter() {
                subscriber.released.store(true, Ordering::SeqCst);
            }
        }
        self.subscribers.clear();
    }

    fn remove(&self, key: &CanonicalKey, id: SubscriberId) -> bool {
        let removed = match self.subscribers.get_mut(key) {
            Some(mut subs) => {
                let before = subs.len();
                subs.retain(|s| s.id != id);
                subs.len() != before
            }
            None => false,
        };
        self.subscribers.remove_if(key, |_, subs| subs.is_empty());
        removed
    }
}

/// Handle that releases one subscription.
///
/// Releasing twice is a no-op. Dropping the handle releases it, so a binding
/// that unwinds still cleans up. Once released, the callback is not invoked
/// again, even for a change that was already being delivered.
pub struct Unsubscribe {
    registry: Weak<SubscriberRegistry>,
    key: CanonicalKey,
    id: SubscriberId,
    released: Arc<AtomicBool>,
}

impl Unsubscribe {
    /// A handle that is already released. Used by disposed clients.
    pub(crate) fn released(key: CanonicalKey) -> Self {
        Self {
            registry: Weak::new(),
            key,
            id: SubscriberId(u64::MAX),
            released: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn key(&self) -> &CanonicalKey {
        &self.key
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Release the subscription. Returns `true` only for the call that
    /// actually removed it.
    pub fn unsubscribe(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        match self.registry.upgrade() {
            Some(registry) => registry.remove(&self.key, self.id),
            None => false,
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}
