//! The read side of the remote API, as seen by the cache.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use lectern_core::{FetchError, ResourceKey};
use serde_json::Value;

/// Loads the payload for one resource key.
///
/// Implementations perform a single attempt. Retries, de-duplication and
/// storage are the coordinator's job.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, key: &ResourceKey) -> Result<Value, FetchError>;
}

/// Adapts an async closure into a [`ResourceFetcher`].
pub struct FnFetcher<F> {
    f: F,
}

impl<F> FnFetcher<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ResourceFetcher for FnFetcher<F>
where
    F: Fn(ResourceKey) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, FetchError>> + Send,
{
    async fn fetch(&self, key: &ResourceKey) -> Result<Value, FetchError> {
        (self.f)(key.clone()).await
    }
}

/// Shorthand for `Arc::new(FnFetcher::new(f))`.
pub fn fetcher_fn<F, Fut>(f: F) -> Arc<dyn ResourceFetcher>
where
    F: Fn(ResourceKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
    Arc::new(FnFetcher::new(f))
}
