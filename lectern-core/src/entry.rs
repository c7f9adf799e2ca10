//! Cache entry snapshots handed to UI bindings.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::FetchError;

/// Lifecycle state of a cached query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// Known to the cache but never fetched (or disabled).
    Idle,
    /// A fetch is running. Previous `data` is still served.
    Loading,
    Success,
    Error,
}

impl QueryStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// Point-in-time copy of a cache entry.
///
/// Bindings render from `{status, data, error}`. Mutating a snapshot has no
/// effect on the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub status: QueryStatus,
    /// Last successfully fetched payload, kept through refetches and errors.
    pub data: Option<Value>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<FetchError>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_millis")]
    pub stale_after: Duration,
    /// Invalidated, or older than `stale_after`.
    pub is_stale: bool,
    /// Attempts consumed by the most recent failed fetch.
    pub failure_count: u32,
}

impl CacheEntry {
    /// A fresh entry that has never been fetched.
    pub fn idle(stale_after: Duration) -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
            last_fetched_at: None,
            stale_after,
            is_stale: true,
            failure_count: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Deserialize the payload into a binding's own type.
    ///
    /// Returns `Ok(None)` when no data has been fetched yet.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, FetchError> {
        match &self.data {
            None => Ok(None),
            Some(value) => T::deserialize(value)
                .map(Some)
                .map_err(|e| FetchError::decode(e.to_string())),
        }
    }
}

fn serialize_error<S: Serializer>(error: &Option<FetchError>, serializer: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(err) => serializer.serialize_some(&err.to_string()),
        None => serializer.serialize_none(),
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}
