//! Configuration types

use std::time::Duration;

use crate::error::ConfigError;

/// Bounded retry with exponential backoff for failed fetches.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            multiplier,
        }
    }

    /// Fail on the first error.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (0-based), capped at `max_backoff`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let cap = self.max_backoff.as_millis() as f64;
        Duration::from_millis(millis.min(cap).max(0.0) as u64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(ConfigError::InvalidValue {
                field: "retry.multiplier".to_string(),
                reason: "must be a finite number >= 1.0".to_string(),
            });
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_backoff".to_string(),
                reason: "must be >= initial_backoff".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Per-query settings supplied by a binding.
///
/// The staleness window has no default: each binding states how long its
/// data stays fresh.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub stale_after: Duration,
    /// Overrides the client's eviction grace window.
    pub gc_after: Option<Duration>,
    /// Overrides the client's retry policy.
    pub retry: Option<RetryPolicy>,
    /// Disabled queries never hit the network.
    pub enabled: bool,
}

impl QueryOptions {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            gc_after: None,
            retry: None,
            enabled: true,
        }
    }

    /// Data that never goes stale on its own; only invalidation refreshes it.
    pub fn never_stale() -> Self {
        Self::new(Duration::MAX)
    }

    /// Data that is stale as soon as it lands.
    pub fn always_stale() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn with_gc_after(mut self, gc_after: Duration) -> Self {
        self.gc_after = Some(gc_after);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn without_retry(self) -> Self {
        self.with_retry(RetryPolicy::none())
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Client-wide cache settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// How long an entry without subscribers survives before eviction.
    pub gc_grace: Duration,
    /// How often the sweeper looks for evictable entries.
    pub sweep_interval: Duration,
    /// Retry policy for queries that don't set their own.
    pub retry: RetryPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            gc_grace: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gc_grace(mut self, grace: Duration) -> Self {
        self.gc_grace = grace;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "sweep_interval".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        self.retry.validate()
    }
}
