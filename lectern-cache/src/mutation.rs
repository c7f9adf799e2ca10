//! Write execution with targeted invalidation.

use std::future::Future;

use lectern_core::{KeyPrefix, MutationError};
use tracing::{info, warn};

use crate::coordinator::{FetchCoordinator, InvalidationSignal};

/// Runs writes and invalidates what they affect.
///
/// A write is never retried. Only a successful write touches the cache.
#[derive(Clone)]
pub struct MutationExecutor {
    coordinator: FetchCoordinator,
}

impl MutationExecutor {
    pub fn new(coordinator: FetchCoordinator) -> Self {
        Self { coordinator }
    }

    /// Await `mutation`; on success invalidate every prefix in `affected`.
    pub async fn execute<T, E, Fut>(&self, mutation: Fut, affected: &[KeyPrefix]) -> Result<T, MutationError>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Into<MutationError>,
    {
        self.execute_reporting(mutation, affected)
            .await
            .map(|(value, _signals)| value)
    }

    /// Like [`execute`](Self::execute), also returning one signal per prefix.
    pub async fn execute_reporting<T, E, Fut>(
        &self,
        mutation: Fut,
        affected: &[KeyPrefix],
    ) -> Result<(T, Vec<InvalidationSignal>), MutationError>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Into<MutationError>,
    {
        let value = match mutation.await {
            Ok(value) => value,
            Err(err) => {
                let err = err.into();
                warn!(error = %err, "Mutation failed, cache left untouched");
                return Err(err);
            }
        };

        let signals: Vec<InvalidationSignal> = affected
            .iter()
            .map(|prefix| self.coordinator.invalidate(prefix))
            .collect();
        for signal in &signals {
            info!(
                prefix = %signal.prefix,
                matched = signal.matched.len(),
                refetched = signal.refetched.len(),
                "Mutation invalidated cache entries"
            );
        }
        Ok((value, signals))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SubscriberRegistry;
    use crate::store::ResourceCache;
    use lectern_core::{FetchError, QueryOptions, ResourceKey, RetryPolicy};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn executor() -> (MutationExecutor, Arc<ResourceCache>) {
        let cache = Arc::new(ResourceCache::new(Arc::new(SubscriberRegistry::new())));
        let coordinator = FetchCoordinator::new(Arc::clone(&cache), RetryPolicy::none());
        (MutationExecutor::new(coordinator), cache)
    }

    fn seeded(cache: &ResourceCache, resource: &str) -> ResourceKey {
        let key = ResourceKey::bare(resource).unwrap();
        cache.seed(&key, json!([]), &QueryOptions::never_stale());
        key
    }

    #[tokio::test]
    async fn test_success_invalidates_each_prefix() {
        let (executor, cache) = executor();
        let course = seeded(&cache, "course");
        let courses = seeded(&cache, "courses");
        let payments = seeded(&cache, "adminPayments");

        let affected = [
            KeyPrefix::resource("course").unwrap(),
            KeyPrefix::resource("courses").unwrap(),
        ];
        let (value, signals) = executor
            .execute_reporting(async { Ok::<_, MutationError>(7) }, &affected)
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].matched, vec![course.clone()]);
        assert!(cache.get(&course).unwrap().is_stale);
        assert!(cache.get(&courses).unwrap().is_stale);
        assert!(!cache.get(&payments).unwrap().is_stale);
    }

    #[tokio::test]
    async fn test_failure_leaves_cache_untouched() {
        let (executor, cache) = executor();
        let course = seeded(&cache, "course");
        let before = cache.get(&course).unwrap();
        let attempts = AtomicUsize::new(0);

        let err = executor
            .execute(
                async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FetchError::http(409, "version conflict"))
                },
                &[KeyPrefix::resource("course").unwrap()],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MutationError::Rejected { status: 409, .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&course).unwrap(), before);
    }
}
