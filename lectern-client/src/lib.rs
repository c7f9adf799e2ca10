//! Lectern client: the REST side of the query cache.
//!
//! - [`api_client`]: `reqwest` client for the LMS API, envelope decoding, and
//!   [`RestFetcher`], which plugs a GET endpoint into the cache.
//! - [`lms`]: typed queries and mutations with their keys, freshness windows
//!   and invalidations.
//! - [`config`] / [`telemetry`]: TOML configuration and tracing setup.

pub mod api_client;
pub mod config;
pub mod error;
pub mod lms;
pub mod telemetry;

pub use api_client::{decode_envelope, ApiClientError, ApiEnvelope, RestClient, RestFetcher};
pub use config::{ClientConfig, ConfigError, LoggingConfig};
pub use error::{ClientError, ClientResult};
pub use lms::{Lms, Loaded};
pub use telemetry::init_tracing;
