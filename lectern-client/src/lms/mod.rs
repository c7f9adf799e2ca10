//! Typed LMS bindings over the query cache.
//!
//! Each query knows its key, endpoint and freshness window (see [`keys`]);
//! each write knows which keys it makes stale. Payloads stay untyped inside
//! the cache and are deserialized here.

pub mod keys;
pub mod types;

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use lectern_cache::{QueryClient, Subscription};
use lectern_core::{CacheEntry, FetchError, KeyPrefix, MutationError, QueryStatus};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::api_client::{RestClient, RestFetcher};
use crate::config::ClientConfig;
use crate::error::ClientResult;
use keys::QuerySpec;
use types::{
    Account, AccountActionRequest, AccountFilter, CourseDetail, CourseFilter, CourseSummary,
    CourseVersion, CurrentUser, EnrollRequest, Enrollment, LoginRequest, LoginResponse, Page,
    Payment, PaymentFilter, UpdateCourseRequest,
};

/// A cache entry with its payload decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<T> {
    pub status: QueryStatus,
    pub data: Option<T>,
    pub error: Option<FetchError>,
    pub is_stale: bool,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

impl<T: DeserializeOwned> Loaded<T> {
    pub fn from_entry(entry: &CacheEntry) -> Result<Self, FetchError> {
        Ok(Self {
            status: entry.status,
            data: entry.data_as()?,
            error: entry.error.clone(),
            is_stale: entry.is_stale,
            last_fetched_at: entry.last_fetched_at,
        })
    }
}

impl<T> Loaded<T> {
    /// The payload if there is one, otherwise the fetch error if there is
    /// one. Data from an earlier success wins over a later error.
    pub fn into_result(self) -> Result<Option<T>, FetchError> {
        match (self.data, self.error) {
            (Some(data), _) => Ok(Some(data)),
            (None, Some(error)) => Err(error),
            (None, None) => Ok(None),
        }
    }
}

#[derive(Clone)]
pub struct Lms {
    client: QueryClient,
    rest: RestClient,
    refresh_token: Arc<Mutex<Option<String>>>,
}

impl Lms {
    pub fn new(client: QueryClient, rest: RestClient) -> Self {
        Self {
            client,
            rest,
            refresh_token: Arc::new(Mutex::new(None)),
        }
    }

    /// Build the cache and REST client from one configuration.
    ///
    /// Inside a tokio runtime this also starts the eviction sweeper.
    pub fn from_config(config: &ClientConfig) -> ClientResult<Self> {
        let client = QueryClient::create(config.cache_config())?;
        let rest = RestClient::new(config)?;
        Ok(Self::new(client, rest))
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Run `spec` through the cache and decode the result.
    pub async fn fetch<T: DeserializeOwned>(&self, spec: &QuerySpec) -> ClientResult<Loaded<T>> {
        let fetcher = RestFetcher::new(self.rest.clone(), spec.path).shared();
        let entry = self.client.query(&spec.key, fetcher, spec.options.clone()).await;
        Ok(Loaded::from_entry(&entry)?)
    }

    /// Observe `spec`. `on_change` receives every decoded snapshot; entries
    /// whose payload does not decode are delivered as errors.
    pub fn watch<T, F>(&self, spec: &QuerySpec, on_change: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(Result<Loaded<T>, FetchError>) + Send + Sync + 'static,
    {
        let fetcher = RestFetcher::new(self.rest.clone(), spec.path).shared();
        self.client
            .subscribe(&spec.key, fetcher, spec.options.clone(), move |entry| {
                on_change(Loaded::from_entry(entry))
            })
    }

    pub async fn current_user(&self) -> ClientResult<Loaded<CurrentUser>> {
        self.fetch(&keys::current_user()?).await
    }

    pub async fn admin_accounts(&self, filter: &AccountFilter) -> ClientResult<Loaded<Page<Account>>> {
        self.fetch(&keys::admin_accounts(filter)?).await
    }

    pub async fn admin_account(&self, id: i64) -> ClientResult<Loaded<Account>> {
        self.fetch(&keys::admin_account(id)?).await
    }

    pub async fn course(&self, slug: &str) -> ClientResult<Loaded<CourseDetail>> {
        self.fetch(&keys::course(slug)?).await
    }

    pub async fn courses(&self, filter: &CourseFilter) -> ClientResult<Loaded<Page<CourseSummary>>> {
        self.fetch(&keys::courses(filter)?).await
    }

    pub async fn student_enrollments(&self, page: u32, size: u32) -> ClientResult<Loaded<Page<Enrollment>>> {
        self.fetch(&keys::student_enrollments(page, size)?).await
    }

    pub async fn admin_payments(&self, filter: &PaymentFilter) -> ClientResult<Loaded<Page<Payment>>> {
        self.fetch(&keys::admin_payments(filter)?).await
    }

    pub async fn course_versions(&self, course_id: i64) -> ClientResult<Loaded<Vec<CourseVersion>>> {
        self.fetch(&keys::course_versions(course_id)?).await
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub async fn update_course(&self, id: i64, body: &UpdateCourseRequest) -> ClientResult<CourseDetail> {
        let path = format!("/teacher/courses/{}", id);
        let affected = keys::after_course_update()?;
        let updated = self
            .client
            .mutate(self.rest.put_json::<CourseDetail, _>(&path, body), &affected)
            .await?;
        Ok(updated)
    }

    pub async fn suspend_account(&self, id: i64, reason: &str) -> ClientResult<Account> {
        self.account_action(id, "suspend", reason).await
    }

    pub async fn unlock_account(&self, id: i64, reason: &str) -> ClientResult<Account> {
        self.account_action(id, "unlock", reason).await
    }

    async fn account_action(&self, id: i64, action: &str, reason: &str) -> ClientResult<Account> {
        let path = format!("/admin/accounts/{}/{}", id, action);
        let body = AccountActionRequest {
            reason: reason.to_string(),
        };
        let affected = keys::after_account_action(id)?;
        let account = self
            .client
            .mutate(self.rest.post_json::<Account, _>(&path, &body), &affected)
            .await?;
        info!(account_id = id, action, "Account action applied");
        Ok(account)
    }

    pub async fn enroll(&self, course_id: i64) -> ClientResult<Enrollment> {
        let affected = keys::after_enrollment()?;
        let enrollment = self
            .client
            .mutate(
                self.rest.post_json::<Enrollment, _>("/enrollments", &EnrollRequest { course_id }),
                &affected,
            )
            .await?;
        Ok(enrollment)
    }

    pub async fn refund_payment(&self, id: i64) -> ClientResult<Payment> {
        let path = format!("/admin/payments/{}/refund", id);
        let affected = keys::after_refund()?;
        let payment = self
            .client
            .mutate(self.rest.post_json::<Payment, _>(&path, &json!({})), &affected)
            .await?;
        Ok(payment)
    }

    /// Authenticate, attach the access token to later requests and seed the
    /// current user so it is served without another round trip.
    pub async fn login(&self, credentials: &LoginRequest) -> ClientResult<LoginResponse> {
        let response = self
            .client
            .mutate(self.rest.post_json::<LoginResponse, _>("/auth/login", credentials), &[])
            .await?;

        self.rest.set_bearer_token(Some(&response.access_token))?;
        *self.refresh_token.lock().unwrap_or_else(PoisonError::into_inner) = response.refresh_token.clone();

        let spec = keys::current_user()?;
        self.client.seed(&spec.key, to_value(&response.user)?, spec.options);
        info!(user_id = response.user.id, role = %response.user.role, "Logged in");
        Ok(response)
    }

    /// End the session. Local state is dropped whether or not the server
    /// acknowledges the logout; the server's answer is still returned.
    pub async fn logout(&self) -> ClientResult<()> {
        let refresh_token = self
            .refresh_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let result = match refresh_token {
            Some(token) => {
                let body = json!({ "refreshToken": token });
                self.client
                    .mutate(self.rest.post_json::<Value, _>("/auth/logout", &body), &[])
                    .await
                    .map(|_| ())
            }
            None => Ok(()),
        };

        self.rest.set_bearer_token(None)?;
        self.client.clear();
        match &result {
            Ok(()) => info!("Logged out"),
            Err(e) => warn!(error = %e, "Logout request failed; local session cleared anyway"),
        }
        Ok(result?)
    }

    /// Invalidate arbitrary prefixes, for writes made outside these bindings.
    pub fn invalidate(&self, prefixes: &[KeyPrefix]) {
        for prefix in prefixes {
            self.client.invalidate(prefix);
        }
    }
}

impl std::fmt::Debug for Lms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lms").field("rest", &self.rest).finish_non_exhaustive()
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, MutationError> {
    serde_json::to_value(value).map_err(|e| MutationError::Decode { reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(data: Option<Value>, error: Option<FetchError>) -> CacheEntry {
        CacheEntry {
            status: if error.is_some() { QueryStatus::Error } else { QueryStatus::Success },
            data,
            error,
            last_fetched_at: None,
            stale_after: Duration::from_secs(60),
            is_stale: false,
            failure_count: 0,
        }
    }

    #[test]
    fn test_loaded_decodes_payload() {
        let loaded: Loaded<CourseDetail> = Loaded::from_entry(&entry(
            Some(json!({"id": 42, "title": "Intro TS", "slug": "intro-ts"})),
            None,
        ))
        .unwrap();
        assert_eq!(loaded.status, QueryStatus::Success);
        assert_eq!(loaded.into_result().unwrap().map(|c| c.id), Some(42));
    }

    #[test]
    fn test_loaded_rejects_wrong_shape() {
        let result: Result<Loaded<CourseDetail>, _> = Loaded::from_entry(&entry(Some(json!([1, 2])), None));
        assert!(matches!(result, Err(FetchError::Decode { .. })));
    }

    #[test]
    fn test_previous_data_wins_over_error() {
        let loaded: Loaded<Vec<i64>> = Loaded::from_entry(&entry(
            Some(json!([1, 2])),
            Some(FetchError::http(502, "bad gateway")),
        ))
        .unwrap();
        assert_eq!(loaded.into_result().unwrap(), Some(vec![1, 2]));

        let loaded: Loaded<Vec<i64>> =
            Loaded::from_entry(&entry(None, Some(FetchError::http(404, "missing")))).unwrap();
        assert!(loaded.into_result().is_err());

        let idle: Loaded<Vec<i64>> = Loaded::from_entry(&CacheEntry::idle(Duration::ZERO)).unwrap();
        assert_eq!(idle.into_result().unwrap(), None);
    }
}
