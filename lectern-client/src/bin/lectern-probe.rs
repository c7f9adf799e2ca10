//! Fetch one resource through the cache and print the resulting entry.
//!
//! ```text
//! lectern-probe --config lectern.toml courses/intro-ts '{"preview":true}'
//! ```
//!
//! The first positional argument is an endpoint path relative to `/api/v1`
//! and doubles as the resource name. The optional JSON object becomes the
//! key's parameters and the query string.

use lectern_cache::QueryClient;
use lectern_client::{init_tracing, ClientConfig, ClientError, ClientResult, RestClient, RestFetcher};
use lectern_core::{QueryOptions, ResourceKey};
use serde_json::Value;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("lectern-probe: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> ClientResult<()> {
    let config = ClientConfig::load()?;
    init_tracing(&config.logging)?;

    let (path, params) = positional_args()?;
    let key = ResourceKey::from_json(path.trim_matches('/'), &params)?;

    let client = QueryClient::create(config.cache_config())?;
    let rest = RestClient::new(&config)?;
    let fetcher = RestFetcher::new(rest, path).shared();

    let entry = client
        .query(&key, fetcher, QueryOptions::always_stale().without_retry())
        .await;
    let rendered = serde_json::to_string_pretty(&entry).map_err(|e| ClientError::Api(e.into()))?;
    println!("{}", rendered);

    tracing::info!(key = %key, status = ?entry.status, stats = ?client.stats(), "Probe complete");
    client.dispose();
    Ok(())
}

fn positional_args() -> ClientResult<(String, Value)> {
    let mut positional = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            args.next();
        } else if !arg.starts_with("--config=") {
            positional.push(arg);
        }
    }

    let mut positional = positional.into_iter();
    let path = positional.next().ok_or_else(|| usage("missing endpoint path"))?;
    let params = match positional.next() {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| usage(&format!("parameters: {}", e)))?,
        None => Value::Null,
    };
    Ok((path, params))
}

fn usage(reason: &str) -> ClientError {
    ClientError::Config(lectern_client::ConfigError::InvalidValue {
        field: "arguments",
        reason: format!("{} (usage: lectern-probe --config <path> <endpoint> [params-json])", reason),
    })
}
