//! Lectern query cache.
//!
//! Keeps server-derived data keyed by resource and parameters, collapses
//! concurrent reads of the same key into one request, serves stale data while
//! revalidating, and refreshes exactly the keys a successful write affects.
//!
//! # Architecture
//!
//! ```text
//! QueryClient
//!   ├── FetchCoordinator ── ResourceFetcher (REST, mocks)
//!   ├── MutationExecutor ── invalidate(prefix) ─┐
//!   └── ResourceCache <─────────────────────────┘
//!         └── SubscriberRegistry ── on_change callbacks
//! ```

pub mod client;
pub mod coordinator;
pub mod fetcher;
pub mod mutation;
pub mod registry;
pub mod store;

pub use client::{QueryClient, Subscription};
pub use coordinator::{FetchCoordinator, InvalidationSignal};
pub use fetcher::{fetcher_fn, FnFetcher, ResourceFetcher};
pub use mutation::MutationExecutor;
pub use registry::{ChangeCallback, SubscriberId, SubscriberRegistry, Unsubscribe};
pub use store::{CacheStats, EntryPatch, Invalidation, RefetchTarget, ResourceCache};

pub use lectern_core::{
    build_key, CacheConfig, CacheEntry, FetchError, KeyPrefix, MutationError, QueryOptions,
    QueryStatus, ResourceKey, RetryPolicy,
};
