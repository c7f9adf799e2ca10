//! LMS bindings against a local HTTP server.
//!
//! Each test serves a small slice of the LMS API with axum and drives the
//! bindings through a real `reqwest` client and query cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use lectern_client::lms::keys;
use lectern_client::lms::types::{AccountFilter, CourseDetail, LoginRequest, UpdateCourseRequest};
use lectern_client::{ClientConfig, ClientError, Lms, Loaded, RestFetcher};
use lectern_core::{FetchError, LecternError, MutationError, QueryStatus};
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct Backend {
    course_hits: Arc<AtomicUsize>,
    course_title: Arc<Mutex<String>>,
    flaky_hits: Arc<AtomicUsize>,
    account_hits: Arc<AtomicUsize>,
    me_hits: Arc<AtomicUsize>,
    last_accounts_query: Arc<Mutex<HashMap<String, String>>>,
    last_authorization: Arc<Mutex<Option<String>>>,
}

fn ok(data: Value) -> Response {
    Json(json!({
        "success": true,
        "status": 200,
        "code": "OK",
        "message": "ok",
        "data": data
    }))
    .into_response()
}

fn fail(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "status": status.as_u16(),
            "code": code,
            "message": message
        })),
    )
        .into_response()
}

async fn get_course(State(backend): State<Backend>, Path(slug): Path<String>) -> Response {
    match slug.as_str() {
        "intro-ts" => {
            backend.course_hits.fetch_add(1, Ordering::SeqCst);
            let title = backend.course_title.lock().unwrap().clone();
            ok(json!({"id": 42, "title": title, "slug": "intro-ts"}))
        }
        "flaky" => {
            if backend.flaky_hits.fetch_add(1, Ordering::SeqCst) == 0 {
                fail(StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", "warming up")
            } else {
                ok(json!({"id": 7, "title": "Flaky", "slug": "flaky"}))
            }
        }
        _ => {
            backend.course_hits.fetch_add(1, Ordering::SeqCst);
            fail(StatusCode::NOT_FOUND, "COURSE_NOT_FOUND", "no such course")
        }
    }
}

async fn update_course(
    State(backend): State<Backend>,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> Response {
    let Some(title) = body.get("title").and_then(Value::as_str) else {
        return fail(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION", "title is required");
    };
    *backend.course_title.lock().unwrap() = title.to_string();
    ok(json!({"id": id, "title": title, "slug": "intro-ts"}))
}

async fn list_accounts(State(backend): State<Backend>, Query(query): Query<HashMap<String, String>>) -> Response {
    *backend.last_accounts_query.lock().unwrap() = query;
    ok(json!({
        "items": [{"id": 3, "email": "kim@example.edu", "role": "STUDENT", "status": "ACTIVE"}],
        "page": 0,
        "size": 20,
        "totalItems": 1,
        "totalPages": 1
    }))
}

async fn get_account(State(backend): State<Backend>, Path(id): Path<i64>) -> Response {
    backend.account_hits.fetch_add(1, Ordering::SeqCst);
    ok(json!({"id": id, "email": "kim@example.edu", "role": "STUDENT", "status": "ACTIVE"}))
}

async fn suspend_account(Path(id): Path<i64>) -> Response {
    if id == 3 {
        ok(json!({"id": 3, "email": "kim@example.edu", "role": "STUDENT", "status": "SUSPENDED"}))
    } else {
        fail(StatusCode::NOT_FOUND, "ACCOUNT_NOT_FOUND", "no such account")
    }
}

async fn login(Json(body): Json<Value>) -> Response {
    if body.get("password").and_then(Value::as_str) != Some("correct horse") {
        return fail(StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS", "Invalid email or password");
    }
    ok(json!({
        "accessToken": "access-1",
        "refreshToken": "refresh-1",
        "user": {"id": 5, "email": "kim@example.edu", "role": "STUDENT"}
    }))
}

async fn me(State(backend): State<Backend>, headers: HeaderMap) -> Response {
    backend.me_hits.fetch_add(1, Ordering::SeqCst);
    *backend.last_authorization.lock().unwrap() = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ok(json!({"id": 5, "email": "kim@example.edu", "role": "STUDENT"}))
}

async fn logout() -> Response {
    fail(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "session store unavailable")
}

async fn serve(backend: Backend) -> String {
    let router = Router::new()
        .route("/api/v1/courses/:slug", get(get_course))
        .route("/api/v1/teacher/courses/:id", put(update_course))
        .route("/api/v1/admin/accounts", get(list_accounts))
        .route("/api/v1/admin/accounts/:id", get(get_account))
        .route("/api/v1/admin/accounts/:id/suspend", post(suspend_account))
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/me", get(me))
        .route("/api/v1/auth/logout", post(logout))
        .with_state(backend);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn lms(base_url: &str) -> Lms {
    let config = ClientConfig::from_toml(&format!(
        r#"
api_base_url = "{base_url}"
request_timeout_ms = 5000

[auth]

[cache]
gc_grace_secs = 300
sweep_interval_secs = 3600

[cache.retry]
max_retries = 0
initial_backoff_ms = 0
max_backoff_ms = 0
multiplier = 1.0

[logging]
filter = "info"
json = false
"#
    ))
    .unwrap();
    config.validate().unwrap();
    Lms::from_config(&config).unwrap()
}

fn backend_with_course() -> Backend {
    let backend = Backend::default();
    *backend.course_title.lock().unwrap() = "Intro TS".to_string();
    backend
}

#[tokio::test]
async fn test_course_is_fetched_once_while_fresh() {
    let backend = backend_with_course();
    let lms = lms(&serve(backend.clone()).await);

    let first = lms.course("intro-ts").await.unwrap();
    let second = lms.course("intro-ts").await.unwrap();

    assert_eq!(first.status, QueryStatus::Success);
    assert_eq!(first.data.as_ref().map(|c| c.title.as_str()), Some("Intro TS"));
    assert_eq!(first, second);
    assert_eq!(backend.course_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_course_update_refreshes_watcher() {
    let backend = backend_with_course();
    let lms = lms(&serve(backend.clone()).await);
    let seen: Arc<Mutex<Vec<Loaded<CourseDetail>>>> = Arc::default();

    let _watch = lms.watch(&keys::course("intro-ts").unwrap(), {
        let seen = Arc::clone(&seen);
        move |loaded: Result<Loaded<CourseDetail>, FetchError>| seen.lock().unwrap().push(loaded.unwrap())
    });
    lms.course("intro-ts").await.unwrap();

    let body = UpdateCourseRequest {
        title: Some("Intro TypeScript".to_string()),
        ..Default::default()
    };
    let updated = lms.update_course(42, &body).await.unwrap();
    assert_eq!(updated.title, "Intro TypeScript");

    // Joins the refetch started by the invalidation.
    let refreshed = lms.course("intro-ts").await.unwrap();
    assert_eq!(refreshed.data.map(|c| c.title), Some("Intro TypeScript".to_string()));
    assert_eq!(backend.course_hits.load(Ordering::SeqCst), 2);

    let statuses: Vec<QueryStatus> = seen.lock().unwrap().iter().map(|l| l.status).collect();
    assert_eq!(
        statuses,
        vec![
            QueryStatus::Loading,
            QueryStatus::Success,
            QueryStatus::Loading,
            QueryStatus::Success
        ]
    );
    let during_refetch = seen.lock().unwrap()[2].clone();
    assert_eq!(during_refetch.data.map(|c| c.title), Some("Intro TS".to_string()));
}

#[tokio::test]
async fn test_missing_course_is_not_retried() {
    let backend = backend_with_course();
    let lms = lms(&serve(backend.clone()).await);

    let loaded = lms.course("no-such-course").await.unwrap();

    assert_eq!(loaded.status, QueryStatus::Error);
    match loaded.into_result() {
        Err(FetchError::Http { status, code, .. }) => {
            assert_eq!(status, 404);
            assert_eq!(code.as_deref(), Some("COURSE_NOT_FOUND"));
        }
        other => panic!("expected a 404, got {:?}", other),
    }
    assert_eq!(backend.course_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unavailable_course_retried_once() {
    let backend = backend_with_course();
    let lms = lms(&serve(backend.clone()).await);

    let loaded = lms.course("flaky").await.unwrap();

    assert_eq!(loaded.status, QueryStatus::Success);
    assert_eq!(loaded.error, None);
    assert_eq!(backend.flaky_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_account_filter_sent_as_query_string() {
    let backend = Backend::default();
    let lms = lms(&serve(backend.clone()).await);

    let filter = AccountFilter {
        page: 0,
        size: 20,
        filter: Some("role:STUDENT".to_string()),
    };
    let page = lms.admin_accounts(&filter).await.unwrap().into_result().unwrap().unwrap();

    assert_eq!(page.items[0].id, 3);
    let query = backend.last_accounts_query.lock().unwrap().clone();
    assert_eq!(query.get("page").map(String::as_str), Some("0"));
    assert_eq!(query.get("size").map(String::as_str), Some("20"));
    assert_eq!(query.get("filter").map(String::as_str), Some("role:STUDENT"));
}

#[tokio::test]
async fn test_rejected_suspend_leaves_account_cached() {
    let backend = Backend::default();
    let lms = lms(&serve(backend.clone()).await);
    lms.admin_account(99).await.unwrap();

    let err = lms.suspend_account(99, "spam").await.unwrap_err();

    assert!(matches!(
        err,
        ClientError::Lectern(LecternError::Mutation(MutationError::Rejected { status: 404, .. }))
    ));
    let entry = lms.client().get(&keys::admin_account(99).unwrap().key).unwrap();
    assert!(!entry.is_stale);
    assert_eq!(backend.account_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_suspend_marks_account_and_listing_stale() {
    let backend = Backend::default();
    let lms = lms(&serve(backend.clone()).await);
    lms.admin_account(3).await.unwrap();
    lms.admin_account(4).await.unwrap();
    lms.admin_accounts(&AccountFilter::default()).await.unwrap();

    let account = lms.suspend_account(3, "spam").await.unwrap();
    assert_eq!(account.status, "SUSPENDED");

    let client = lms.client();
    assert!(client.get(&keys::admin_account(3).unwrap().key).unwrap().is_stale);
    assert!(!client.get(&keys::admin_account(4).unwrap().key).unwrap().is_stale);
    assert!(client
        .get(&keys::admin_accounts(&AccountFilter::default()).unwrap().key)
        .unwrap()
        .is_stale);
}

#[tokio::test]
async fn test_login_seeds_user_and_logout_always_clears() {
    let backend = Backend::default();
    let lms = lms(&serve(backend.clone()).await);

    let wrong = LoginRequest {
        email: "kim@example.edu".to_string(),
        password: "hunter2".to_string(),
    };
    assert!(lms.login(&wrong).await.is_err());
    assert!(!lms.rest().has_bearer_token());

    let credentials = LoginRequest {
        email: "kim@example.edu".to_string(),
        password: "correct horse".to_string(),
    };
    let response = lms.login(&credentials).await.unwrap();
    assert_eq!(response.user.id, 5);
    assert!(lms.rest().has_bearer_token());

    let user = lms.current_user().await.unwrap();
    assert_eq!(user.data.map(|u| u.email), Some("kim@example.edu".to_string()));
    assert_eq!(backend.me_hits.load(Ordering::SeqCst), 0);

    let spec = keys::current_user().unwrap();
    let fetcher = RestFetcher::new(lms.rest().clone(), spec.path).shared();
    let refetched = lms.client().refetch(&spec.key, fetcher, spec.options.clone()).await;
    assert_eq!(refetched.status, QueryStatus::Success);
    assert_eq!(backend.me_hits.load(Ordering::SeqCst), 1);
    assert_eq!(
        backend.last_authorization.lock().unwrap().as_deref(),
        Some("Bearer access-1")
    );

    // The server fails the logout; the local session goes anyway.
    let result = lms.logout().await;
    assert!(result.is_err());
    assert!(!lms.rest().has_bearer_token());
    assert!(lms.client().get(&spec.key).is_none());
    assert_eq!(lms.client().stats().entry_count, 0);
}
