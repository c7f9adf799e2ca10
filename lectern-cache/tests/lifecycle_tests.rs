//! Subscription, eviction, retry and dispose tests.

use std::sync::Arc;
use std::time::Duration;

use lectern_cache::{QueryClient, ResourceFetcher};
use lectern_core::{CacheConfig, FetchError, MutationError, QueryOptions, QueryStatus, RetryPolicy};
use lectern_test_utils::assertions::assert_status;
use lectern_test_utils::{fixtures, GatedFetcher, MockFetcher, RecordingSubscriber};
use serde_json::json;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_unobserved_entry_evicted_after_grace() {
    let client = fixtures::quiet_client();
    let key = fixtures::intro_ts_key();
    let mock = MockFetcher::ok(fixtures::intro_ts_course()).shared();

    let sub = client.subscribe(&key, mock.clone(), fixtures::one_minute(), |_| {});
    client.query(&key, mock.clone(), fixtures::one_minute()).await;

    tokio::time::advance(Duration::from_secs(600)).await;
    assert!(client.sweep().is_empty(), "observed entries are never evicted");

    drop(sub);
    tokio::time::advance(Duration::from_secs(299)).await;
    assert!(client.sweep().is_empty());
    assert!(client.get(&key).is_some());

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(client.sweep(), vec![key.clone()]);
    assert!(client.get(&key).is_none());
    assert_eq!(client.stats().evictions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_background_sweeper_evicts() {
    let config = CacheConfig::new()
        .with_gc_grace(Duration::from_secs(60))
        .with_sweep_interval(Duration::from_secs(10))
        .with_retry(RetryPolicy::none());
    let client = QueryClient::create(config).unwrap();
    let key = fixtures::intro_ts_key();
    client.seed(&key, fixtures::intro_ts_course(), fixtures::one_minute());

    tokio::time::sleep(Duration::from_secs(90)).await;

    assert!(client.get(&key).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_per_entry_grace_overrides_default() {
    let client = fixtures::quiet_client();
    let short = lectern_core::ResourceKey::bare("adminAccounts").unwrap();
    let options = fixtures::one_minute().with_gc_after(Duration::from_secs(30));
    client.seed(&short, json!([]), options);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(client.sweep(), vec![short]);
}

#[tokio::test(start_paused = true)]
async fn test_loading_entry_survives_sweep() {
    let client = fixtures::quiet_client();
    let key = fixtures::intro_ts_key();
    let gate = GatedFetcher::new().shared();

    let pending = tokio::spawn({
        let client = client.clone();
        let key = key.clone();
        let fetcher: Arc<dyn ResourceFetcher> = gate.clone();
        async move { client.query(&key, fetcher, fixtures::one_minute()).await }
    });
    gate.wait_for_calls(1).await;

    tokio::time::advance(Duration::from_secs(3600)).await;
    assert!(client.sweep().is_empty());

    gate.release(0, Ok(json!({})));
    assert_status(&pending.await.unwrap(), QueryStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_is_idempotent() {
    let client = fixtures::client();
    let key = fixtures::intro_ts_key();
    let mock = MockFetcher::ok(json!({})).shared();

    let first = client.subscribe(&key, mock.clone(), fixtures::one_minute(), |_| {});
    let second = client.subscribe(&key, mock.clone(), fixtures::one_minute(), |_| {});
    assert_eq!(client.subscriber_count(&key), 2);

    assert!(first.unsubscribe());
    assert!(!first.unsubscribe());
    assert!(!first.is_active());
    assert_eq!(client.subscriber_count(&key), 1);

    drop(first);
    assert_eq!(client.subscriber_count(&key), 1);
    drop(second);
    assert_eq!(client.subscriber_count(&key), 0);
}

#[tokio::test(start_paused = true)]
async fn test_result_stored_after_subscriber_leaves() {
    let client = fixtures::client();
    let key = fixtures::intro_ts_key();
    let gate = GatedFetcher::new().shared();
    let recorder = RecordingSubscriber::new();

    let sub = client.subscribe(&key, gate.clone(), fixtures::one_minute(), recorder.callback());
    gate.wait_for_calls(1).await;
    drop(sub);

    gate.release(0, Ok(fixtures::intro_ts_course()));
    let entry = client.query(&key, gate.clone(), fixtures::one_minute()).await;

    assert_eq!(entry.data, Some(fixtures::intro_ts_course()));
    assert_eq!(recorder.statuses(), vec![QueryStatus::Loading]);
    assert_eq!(gate.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_query_never_fetches() {
    let client = fixtures::client();
    let key = fixtures::intro_ts_key();
    let mock = MockFetcher::ok(json!({})).shared();
    let disabled = fixtures::one_minute().enabled(false);

    let _sub = client.subscribe(&key, mock.clone(), disabled.clone(), |_| {});
    let entry = client.query(&key, mock.clone(), disabled.clone()).await;
    let refetched = client.refetch(&key, mock.clone(), disabled).await;

    assert!(entry.is_idle());
    assert!(refetched.is_idle());
    assert_eq!(mock.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_is_bounded_with_backoff() {
    let config = CacheConfig::new().with_retry(RetryPolicy::new(
        3,
        Duration::from_secs(1),
        Duration::from_secs(30),
        2.0,
    ));
    let client = QueryClient::create(config).unwrap();
    let key = fixtures::intro_ts_key();
    let mock = MockFetcher::failing(FetchError::network("connection refused")).shared();

    let started = Instant::now();
    let entry = client.query(&key, mock.clone(), fixtures::one_minute()).await;

    assert_status(&entry, QueryStatus::Error);
    assert_eq!(mock.calls(), 4);
    assert_eq!(entry.failure_count, 4);
    // 1s + 2s + 4s of backoff.
    assert!(started.elapsed() >= Duration::from_secs(7));
}

#[tokio::test(start_paused = true)]
async fn test_single_retry_then_success() {
    let client = fixtures::client();
    let key = fixtures::intro_ts_key();
    let mock = MockFetcher::scripted(vec![
        Err(FetchError::http(503, "warming up")),
        Ok(fixtures::intro_ts_course()),
    ])
    .shared();
    let options = QueryOptions::new(Duration::from_secs(60)).with_retry(RetryPolicy::new(
        1,
        Duration::from_millis(200),
        Duration::from_secs(1),
        2.0,
    ));

    let entry = client.query(&key, mock.clone(), options).await;

    assert_status(&entry, QueryStatus::Success);
    assert_eq!(entry.failure_count, 0);
    assert_eq!(mock.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_stops_everything() {
    let client = fixtures::client();
    let key = fixtures::intro_ts_key();
    let mock = MockFetcher::ok(fixtures::intro_ts_course()).shared();
    let _sub = client.subscribe(&key, mock.clone(), fixtures::one_minute(), |_| {});
    client.query(&key, mock.clone(), fixtures::one_minute()).await;

    client.dispose();

    assert!(client.is_disposed());
    assert_eq!(client.stats().entry_count, 0);
    assert_eq!(client.subscriber_count(&key), 0);
    assert!(client.query(&key, mock.clone(), fixtures::one_minute()).await.is_idle());
    assert_eq!(mock.calls(), 1);

    let result = client
        .mutate(async { Ok::<_, MutationError>(()) }, &[])
        .await;
    assert_eq!(result, Err(MutationError::Disposed));
}

#[tokio::test(start_paused = true)]
async fn test_clear_drops_entries_but_keeps_client_usable() {
    let client = fixtures::client();
    let key = lectern_core::ResourceKey::bare("currentUser").unwrap();
    let mock = MockFetcher::ok(json!({"id": 1})).shared();

    client.query(&key, mock.clone(), fixtures::one_minute()).await;
    client.clear();
    assert!(client.get(&key).is_none());

    let again = client.query(&key, mock.clone(), fixtures::one_minute()).await;
    assert_status(&again, QueryStatus::Success);
    assert_eq!(mock.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_subscriber_ends_on_latest_state() {
    let client = fixtures::client();
    let key = fixtures::intro_ts_key();
    let mock = MockFetcher::ok(fixtures::intro_ts_course()).shared();
    let options = QueryOptions::always_stale();
    let recorder = RecordingSubscriber::new();
    let record = recorder.callback();

    let _sub = client.subscribe(&key, mock.clone(), options.clone(), move |entry| {
        if entry.status == QueryStatus::Loading {
            std::thread::sleep(Duration::from_micros(200));
        }
        record(entry);
    });
    client.query(&key, mock.clone(), options.clone()).await;

    for round in 0..200 {
        let entry = client.refetch(&key, mock.clone(), options.clone()).await;
        assert_status(&entry, QueryStatus::Success);
        let last = recorder.last().expect("subscriber saw at least one snapshot");
        assert_eq!(
            last.status,
            QueryStatus::Success,
            "round {round}: subscriber's last snapshot is older than the cache"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_released_subscription_receives_nothing() {
    let client = fixtures::client();
    let key = fixtures::intro_ts_key();
    let mock = MockFetcher::ok(fixtures::intro_ts_course()).shared();
    let options = QueryOptions::always_stale();
    let recorder = RecordingSubscriber::new();

    let sub = client.subscribe(&key, mock.clone(), options.clone(), recorder.callback());
    client.query(&key, mock.clone(), options.clone()).await;
    assert!(sub.unsubscribe());
    let delivered = recorder.len();

    for _ in 0..20 {
        client.refetch(&key, mock.clone(), options.clone()).await;
    }
    assert_eq!(recorder.len(), delivered);
    assert!(!sub.is_active());
}
