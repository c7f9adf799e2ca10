//! Lectern core types.
//!
//! Shared vocabulary for the query cache: canonical resource keys, cache
//! entry snapshots, watermarks, the error taxonomy, and configuration.

pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod watermark;

pub use config::{CacheConfig, QueryOptions, RetryPolicy};
pub use entry::{CacheEntry, QueryStatus};
pub use error::{
    ConfigError, FetchError, InvalidKeyError, LecternError, LecternResult, MutationError,
};
pub use key::{build_key, CanonicalKey, KeyPrefix, ParamValue, Params, ResourceKey};
pub use watermark::{Watermark, WatermarkClock};
