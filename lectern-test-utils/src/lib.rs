//! Lectern Test Utilities
//!
//! Shared test infrastructure for the Lectern workspace:
//! - Mock fetchers (scripted and gated)
//! - A subscriber that records every snapshot it receives
//! - Proptest generators for parameter bags and policies
//! - Fixtures and assertions for common cache scenarios

pub use lectern_cache::{QueryClient, ResourceFetcher, Subscription};
pub use lectern_core::{
    CacheConfig, CacheEntry, FetchError, KeyPrefix, QueryOptions, QueryStatus, ResourceKey,
    RetryPolicy,
};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{oneshot, watch};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// MOCK FETCHERS
// ============================================================================

/// Fetcher that replays a script of responses.
///
/// Each call pops the next response; the last one repeats once the script
/// runs out. Every call is counted and its key recorded.
#[derive(Debug)]
pub struct MockFetcher {
    script: Mutex<VecDeque<Result<Value, FetchError>>>,
    last: Mutex<Option<Result<Value, FetchError>>>,
    delay: Duration,
    requested: Mutex<Vec<ResourceKey>>,
}

impl MockFetcher {
    pub fn scripted(responses: Vec<Result<Value, FetchError>>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            last: Mutex::new(None),
            delay: Duration::ZERO,
            requested: Mutex::new(Vec::new()),
        }
    }

    /// Always succeeds with `value`.
    pub fn ok(value: Value) -> Self {
        Self::scripted(vec![Ok(value)])
    }

    /// Always fails with `error`.
    pub fn failing(error: FetchError) -> Self {
        Self::scripted(vec![Err(error)])
    }

    /// Sleep for `delay` before answering. Pair with a paused tokio clock.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> usize {
        lock(&self.requested).len()
    }

    pub fn requested_keys(&self) -> Vec<ResourceKey> {
        lock(&self.requested).clone()
    }

    fn next_response(&self) -> Result<Value, FetchError> {
        let next = lock(&self.script).pop_front();
        let mut last = lock(&self.last);
        match next {
            Some(response) => {
                *last = Some(response.clone());
                response
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(FetchError::network("mock script is empty"))),
        }
    }
}

#[async_trait]
impl ResourceFetcher for MockFetcher {
    async fn fetch(&self, key: &ResourceKey) -> Result<Value, FetchError> {
        lock(&self.requested).push(key.clone());
        let response = self.next_response();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        response
    }
}

/// Fetcher whose calls block until the test releases them.
///
/// Calls are numbered from zero in the order they start, and can be
/// released in any order, which makes out-of-order completion testable.
#[derive(Debug)]
pub struct GatedFetcher {
    gates: Mutex<Vec<Option<oneshot::Sender<Result<Value, FetchError>>>>>,
    started: watch::Sender<usize>,
}

impl Default for GatedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl GatedFetcher {
    pub fn new() -> Self {
        let (started, _) = watch::channel(0);
        Self {
            gates: Mutex::new(Vec::new()),
            started,
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> usize {
        lock(&self.gates).len()
    }

    /// Wait until at least `count` calls have started.
    pub async fn wait_for_calls(&self, count: usize) {
        let mut started = self.started.subscribe();
        let _ = started.wait_for(|n| *n >= count).await;
    }

    /// Answer call number `call`. Returns `false` if it was already answered
    /// or never started.
    pub fn release(&self, call: usize, response: Result<Value, FetchError>) -> bool {
        let gate = lock(&self.gates).get_mut(call).and_then(Option::take);
        match gate {
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl ResourceFetcher for GatedFetcher {
    async fn fetch(&self, _key: &ResourceKey) -> Result<Value, FetchError> {
        let (sender, receiver) = oneshot::channel();
        {
            let mut gates = lock(&self.gates);
            gates.push(Some(sender));
            self.started.send_replace(gates.len());
        }
        receiver
            .await
            .unwrap_or_else(|_| Err(FetchError::network("gate dropped")))
    }
}

// ============================================================================
// RECORDING SUBSCRIBER
// ============================================================================

/// Collects every snapshot delivered to it.
#[derive(Debug, Clone, Default)]
pub struct RecordingSubscriber {
    entries: Arc<Mutex<Vec<CacheEntry>>>,
}

impl RecordingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback to hand to `QueryClient::subscribe`.
    pub fn callback(&self) -> impl Fn(&CacheEntry) + Send + Sync + 'static {
        let entries = Arc::clone(&self.entries);
        move |entry: &CacheEntry| lock(&entries).push(entry.clone())
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        lock(&self.entries).clone()
    }

    pub fn statuses(&self) -> Vec<QueryStatus> {
        lock(&self.entries).iter().map(|e| e.status).collect()
    }

    pub fn last(&self) -> Option<CacheEntry> {
        lock(&self.entries).last().cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and policies.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{Map, Number};

    /// A resource name, sometimes hierarchical.
    pub fn arb_resource_name() -> impl Strategy<Value = String> {
        "[a-z][a-zA-Z]{0,10}(/[a-z]{1,6})?"
    }

    /// A scalar that survives canonicalization.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| Value::Number(Number::from(n))),
            "[a-zA-Z0-9 _-]{1,12}".prop_map(Value::String),
        ]
    }

    /// A parameter bag of scalars, short lists and one level of
    /// nesting.
    pub fn arb_param_bag() -> impl Strategy<Value = Map<String, Value>> {
        let leaf = prop_oneof![
            4 => arb_scalar(),
            1 => prop::collection::vec(arb_scalar(), 0..4).prop_map(Value::Array),
            1 => prop::collection::btree_map("[a-z]{1,6}", arb_scalar(), 1..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ];
        prop::collection::btree_map("[a-z][a-zA-Z]{0,7}", leaf, 0..6)
            .prop_map(|m| m.into_iter().collect())
    }

    /// Values that canonicalization removes.
    pub fn arb_empty_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            Just(Value::String(String::new())),
            Just(Value::Object(Map::new())),
        ]
    }

    /// Parameters made only of removable values, keyed with a `pad_` prefix
    /// so they never collide with [`arb_param_bag`] keys.
    pub fn arb_padding() -> impl Strategy<Value = Map<String, Value>> {
        prop::collection::btree_map("pad_[a-z]{1,4}", arb_empty_value(), 0..4)
            .prop_map(|m| m.into_iter().collect())
    }

    pub fn arb_retry_policy() -> impl Strategy<Value = RetryPolicy> {
        (0u32..5, 1u64..2_000, 1u64..60, 1.0f64..4.0).prop_map(
            |(retries, initial_ms, cap_secs, multiplier)| {
                let initial = Duration::from_millis(initial_ms);
                let cap = Duration::from_secs(cap_secs).max(initial);
                RetryPolicy::new(retries, initial, cap, multiplier)
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common test scenarios.

    use super::*;
    use serde_json::json;

    pub fn intro_ts_key() -> ResourceKey {
        ResourceKey::from_json("course", &json!({"slug": "intro-ts"}))
            .unwrap_or_else(|e| panic!("fixture key is valid: {e}"))
    }

    pub fn intro_ts_course() -> Value {
        json!({"id": 42, "title": "Intro TS"})
    }

    pub fn orders_key(status: &str) -> ResourceKey {
        ResourceKey::from_json("orders", &json!({ "status": status }))
            .unwrap_or_else(|e| panic!("fixture key is valid: {e}"))
    }

    /// Options with a one minute staleness window.
    pub fn one_minute() -> QueryOptions {
        QueryOptions::new(Duration::from_secs(60))
    }

    /// Client config with no retries so failure tests finish at once.
    pub fn no_retry_config() -> CacheConfig {
        CacheConfig::new().with_retry(RetryPolicy::none())
    }

    pub fn client() -> QueryClient {
        QueryClient::create(no_retry_config())
            .unwrap_or_else(|e| panic!("fixture config is valid: {e}"))
    }

    /// A client whose background sweeper never fires within a test, for
    /// tests that drive `sweep` by hand.
    pub fn quiet_client() -> QueryClient {
        let config = no_retry_config().with_sweep_interval(Duration::from_secs(24 * 60 * 60));
        QueryClient::create(config).unwrap_or_else(|e| panic!("fixture config is valid: {e}"))
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertions for cache state.

    use super::*;

    pub fn assert_status(entry: &CacheEntry, expected: QueryStatus) {
        assert_eq!(
            entry.status, expected,
            "Expected status {:?}, got {:?} (error: {:?})",
            expected, entry.status, entry.error
        );
    }

    /// `expected` must appear in `recorded` in order, gaps allowed.
    pub fn assert_status_sequence(recorded: &[QueryStatus], expected: &[QueryStatus]) {
        let mut remaining = expected.iter().peekable();
        for status in recorded {
            if remaining.peek() == Some(&status) {
                remaining.next();
            }
        }
        assert!(
            remaining.peek().is_none(),
            "Expected {:?} to appear in order within {:?}",
            expected,
            recorded
        );
    }

    pub fn assert_fresh_success(entry: &CacheEntry) {
        assert_status(entry, QueryStatus::Success);
        assert!(!entry.is_stale, "Expected a fresh entry, got a stale one");
    }
}
