//! REST client for the LMS API and its bridge into the cache.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use lectern_cache::ResourceFetcher;
use lectern_core::{FetchError, MutationError, ResourceKey};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::{AuthConfig, ClientConfig};

const API_PREFIX: [&str; 2] = ["api", "v1"];

#[derive(Debug, thiserror::Error)]
pub enum ApiClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Request rejected with status {status}: {message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(String),
}

impl From<ApiClientError> for FetchError {
    fn from(err: ApiClientError) -> Self {
        match err {
            ApiClientError::Http(e) if e.is_decode() => FetchError::decode(e.to_string()),
            ApiClientError::Http(e) => match e.status() {
                Some(status) => FetchError::http(status.as_u16(), e.to_string()),
                None => FetchError::network(e.to_string()),
            },
            ApiClientError::Rejected {
                status,
                code,
                message,
            } => FetchError::Http {
                status,
                code,
                message,
            },
            ApiClientError::Serde(e) => FetchError::decode(e.to_string()),
            ApiClientError::Config(reason) => FetchError::decode(format!("Invalid request: {}", reason)),
        }
    }
}

impl From<ApiClientError> for MutationError {
    fn from(err: ApiClientError) -> Self {
        FetchError::from(err).into()
    }
}

/// The server's response wrapper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Unwrap a response body into its payload.
///
/// Enveloped bodies (objects carrying `success`) yield their `data`. Bare
/// JSON bodies are passed through. A non-2xx status or `success: false`
/// becomes [`ApiClientError::Rejected`].
pub fn decode_envelope(status: u16, body: &str) -> Result<Value, ApiClientError> {
    let ok_status = (200..300).contains(&status);
    if body.trim().is_empty() {
        return if ok_status {
            Ok(Value::Null)
        } else {
            Err(rejected(status, None, None))
        };
    }

    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) if ok_status => return Err(ApiClientError::Serde(e)),
        Err(_) => return Err(rejected(status, None, Some(truncate(body)))),
    };

    if !is_envelope(&value) {
        if ok_status {
            return Ok(value);
        }
        let code = value.get("code").and_then(Value::as_str).map(str::to_string);
        let message = value.get("message").and_then(Value::as_str).map(str::to_string);
        return Err(rejected(status, code, message));
    }

    let envelope: ApiEnvelope = serde_json::from_value(value)?;
    if ok_status && envelope.success != Some(false) {
        return Ok(envelope.data.unwrap_or(Value::Null));
    }

    // A 2xx carrying `success: false` takes its status from the envelope.
    let status = if ok_status {
        envelope.status.filter(|s| *s >= 400).unwrap_or(400)
    } else {
        status
    };
    Err(rejected(status, envelope.code, envelope.message))
}

fn is_envelope(value: &Value) -> bool {
    value.as_object().is_some_and(|obj| obj.contains_key("success"))
}

fn rejected(status: u16, code: Option<String>, message: Option<String>) -> ApiClientError {
    ApiClientError::Rejected {
        status,
        code,
        message: message.unwrap_or_else(|| format!("HTTP {}", status)),
    }
}

fn truncate(body: &str) -> String {
    const LIMIT: usize = 200;
    let body = body.trim();
    match body.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: Url,
    auth_header: Arc<RwLock<HeaderMap>>,
}

impl RestClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let base_url = Url::parse(config.api_base_url.trim())
            .map_err(|e| ApiClientError::Config(format!("api_base_url: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiClientError::Config(format!(
                "api_base_url {} cannot be a base URL",
                base_url
            )));
        }

        let auth_header = build_auth_headers(&config.auth)?;
        Ok(Self {
            client,
            base_url,
            auth_header: Arc::new(RwLock::new(auth_header)),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Replace (or with `None`, remove) the bearer token on every clone of
    /// this client.
    pub fn set_bearer_token(&self, token: Option<&str>) -> Result<(), ApiClientError> {
        let value = token.map(bearer_value).transpose()?;
        let mut headers = self.auth_header.write().unwrap_or_else(PoisonError::into_inner);
        match value {
            Some(value) => {
                headers.insert(AUTHORIZATION, value);
            }
            None => {
                headers.remove(AUTHORIZATION);
            }
        }
        Ok(())
    }

    pub fn has_bearer_token(&self) -> bool {
        self.auth_header
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(AUTHORIZATION)
    }

    /// Resolve `path` (relative to `/api/v1`) against the base URL.
    pub fn endpoint(&self, path: &str) -> Result<Url, ApiClientError> {
        self.endpoint_segments(path.split('/').filter(|s| !s.is_empty()))
    }

    fn endpoint_segments<I, S>(&self, segments: I) -> Result<Url, ApiClientError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ApiClientError::Config(format!("{} cannot be a base URL", self.base_url)))?;
            path.pop_if_empty().extend(API_PREFIX).extend(segments);
        }
        Ok(url)
    }

    pub async fn get_json<T, Q>(&self, path: &str, query: Option<&Q>) -> Result<T, ApiClientError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let url = self.endpoint(path)?;
        let mut request = self.client.get(url);
        if let Some(query) = query {
            request = request.query(query);
        }
        self.execute(Method::GET, request).await
    }

    pub async fn post_json<T, B>(&self, path: &str, body: &B) -> Result<T, ApiClientError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.endpoint(path)?;
        self.execute(Method::POST, self.client.post(url).json(body)).await
    }

    pub async fn put_json<T, B>(&self, path: &str, body: &B) -> Result<T, ApiClientError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.endpoint(path)?;
        self.execute(Method::PUT, self.client.put(url).json(body)).await
    }

    pub async fn patch_json<T, B>(&self, path: &str, body: &B) -> Result<T, ApiClientError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.endpoint(path)?;
        self.execute(Method::PATCH, self.client.patch(url).json(body)).await
    }

    pub async fn delete_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiClientError> {
        let url = self.endpoint(path)?;
        self.execute(Method::DELETE, self.client.delete(url)).await
    }

    /// GET the resource a key describes, with `template` placeholders filled
    /// from the key and the remaining parameters sent as the query string.
    pub async fn get_for_key(&self, template: &str, key: &ResourceKey) -> Result<Value, ApiClientError> {
        let (segments, query) = resolve_path(template, key)?;
        let url = self.endpoint_segments(&segments)?;
        let request = self.client.get(url).query(&query);
        self.execute(Method::GET, request).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        request: RequestBuilder,
    ) -> Result<T, ApiClientError> {
        let headers = self
            .auth_header
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let started = Instant::now();
        let response = request.headers(headers).send().await?;
        let status = response.status().as_u16();
        let url = response.url().clone();
        let body = response.text().await?;
        debug!(
            method = %method,
            url = %url,
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "API request complete"
        );

        let data = decode_envelope(status, &body).inspect_err(|e| {
            warn!(method = %method, url = %url, error = %e, "API request failed");
        })?;
        Ok(serde_json::from_value(data)?)
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.has_bearer_token())
            .finish()
    }
}

/// Split a path template into URL segments, filling `{name}` segments from
/// the key's parameters. Parameters not used by the path become query pairs.
pub fn resolve_path(template: &str, key: &ResourceKey) -> Result<(Vec<String>, Vec<(String, String)>), ApiClientError> {
    let mut params = key.params_json();
    let mut segments = Vec::new();
    for segment in template.split('/').filter(|s| !s.is_empty()) {
        match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(name) => {
                let value = params.remove(name).ok_or_else(|| {
                    ApiClientError::Config(format!("key {} has no {:?} parameter for {}", key, name, template))
                })?;
                segments.push(scalar_text(&value));
            }
            None => segments.push(segment.to_string()),
        }
    }
    Ok((segments, query_pairs(&params)))
}

/// Flatten parameters into query pairs. Lists repeat their name, nested
/// mappings are sent as JSON text.
pub fn query_pairs(params: &Map<String, Value>) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (name, value) in params {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items.iter().filter(|item| !item.is_null()) {
                    pairs.push((name.clone(), scalar_text(item)));
                }
            }
            other => pairs.push((name.clone(), scalar_text(other))),
        }
    }
    pairs
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn bearer_value(token: &str) -> Result<HeaderValue, ApiClientError> {
    let mut value =
        HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| ApiClientError::Config(e.to_string()))?;
    value.set_sensitive(true);
    Ok(value)
}

fn build_auth_headers(auth: &AuthConfig) -> Result<HeaderMap, ApiClientError> {
    let mut headers = HeaderMap::new();
    if let Some(api_key) = &auth.api_key {
        let mut value = HeaderValue::from_str(api_key).map_err(|e| ApiClientError::Config(e.to_string()))?;
        value.set_sensitive(true);
        headers.insert(HeaderName::from_static("x-api-key"), value);
    }
    if let Some(token) = &auth.bearer_token {
        headers.insert(AUTHORIZATION, bearer_value(token)?);
    }
    Ok(headers)
}

/// Serves cache reads from a GET endpoint.
pub struct RestFetcher {
    rest: RestClient,
    template: String,
}

impl RestFetcher {
    pub fn new(rest: RestClient, template: impl Into<String>) -> Self {
        Self {
            rest,
            template: template.into(),
        }
    }

    pub fn shared(self) -> Arc<dyn ResourceFetcher> {
        Arc::new(self)
    }

    pub fn template(&self) -> &str {
        &self.template
    }
}

#[async_trait]
impl ResourceFetcher for RestFetcher {
    async fn fetch(&self, key: &ResourceKey) -> Result<Value, FetchError> {
        self.rest
            .get_for_key(&self.template, key)
            .await
            .map_err(FetchError::from)
    }
}
