//! Resource keys, endpoints and freshness settings of the LMS queries.

use std::time::Duration;

use lectern_core::{InvalidKeyError, KeyPrefix, QueryOptions, ResourceKey, RetryPolicy};
use serde::Serialize;
use serde_json::Value;

use super::types::{AccountFilter, CourseFilter, PaymentFilter};

pub const CURRENT_USER: &str = "currentUser";
pub const ADMIN_ACCOUNTS: &str = "adminAccounts";
pub const ADMIN_ACCOUNT: &str = "adminAccount";
pub const COURSE: &str = "course";
pub const COURSES: &str = "courses";
pub const ENROLLMENTS: &str = "enrollments";
pub const ADMIN_PAYMENTS: &str = "adminPayments";
pub const COURSE_VERSIONS: &str = "course-versions";

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

/// Everything needed to run one query: its key, the GET endpoint it reads
/// (with `{param}` placeholders filled from the key) and its options.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub key: ResourceKey,
    pub path: &'static str,
    pub options: QueryOptions,
}

impl QuerySpec {
    fn new(key: ResourceKey, path: &'static str, options: QueryOptions) -> Self {
        Self { key, path, options }
    }
}

fn filter_key<F: Serialize>(resource: &str, filter: &F) -> Result<ResourceKey, InvalidKeyError> {
    // Filters are plain structs of scalars, so serialization cannot fail.
    let params = serde_json::to_value(filter).unwrap_or(Value::Null);
    ResourceKey::from_json(resource, &params)
}

pub fn current_user() -> Result<QuerySpec, InvalidKeyError> {
    Ok(QuerySpec::new(
        ResourceKey::bare(CURRENT_USER)?,
        "/auth/me",
        QueryOptions::new(5 * MINUTE)
            .with_gc_after(10 * MINUTE)
            .without_retry(),
    ))
}

pub fn admin_accounts(filter: &AccountFilter) -> Result<QuerySpec, InvalidKeyError> {
    Ok(QuerySpec::new(
        filter_key(ADMIN_ACCOUNTS, filter)?,
        "/admin/accounts",
        QueryOptions::new(30 * SECOND).with_gc_after(5 * MINUTE),
    ))
}

pub fn admin_account(id: i64) -> Result<QuerySpec, InvalidKeyError> {
    Ok(QuerySpec::new(
        ResourceKey::new(ADMIN_ACCOUNT, [("id", id)])?,
        "/admin/accounts/{id}",
        QueryOptions::new(30 * SECOND).with_gc_after(5 * MINUTE),
    ))
}

pub fn course(slug: &str) -> Result<QuerySpec, InvalidKeyError> {
    Ok(QuerySpec::new(
        ResourceKey::new(COURSE, [("slug", slug)])?,
        "/courses/{slug}",
        QueryOptions::new(MINUTE).with_retry(RetryPolicy::new(1, SECOND, 30 * SECOND, 2.0)),
    ))
}

pub fn courses(filter: &CourseFilter) -> Result<QuerySpec, InvalidKeyError> {
    Ok(QuerySpec::new(
        filter_key(COURSES, filter)?,
        "/courses",
        QueryOptions::new(30 * SECOND),
    ))
}

pub fn student_enrollments(page: u32, size: u32) -> Result<QuerySpec, InvalidKeyError> {
    Ok(QuerySpec::new(
        ResourceKey::new(ENROLLMENTS, [("page", page), ("size", size)])?,
        "/students/me/enrollments",
        QueryOptions::new(MINUTE),
    ))
}

pub fn admin_payments(filter: &PaymentFilter) -> Result<QuerySpec, InvalidKeyError> {
    Ok(QuerySpec::new(
        filter_key(ADMIN_PAYMENTS, filter)?,
        "/admin/payments",
        QueryOptions::new(MINUTE),
    ))
}

pub fn course_versions(course_id: i64) -> Result<QuerySpec, InvalidKeyError> {
    Ok(QuerySpec::new(
        ResourceKey::new(COURSE_VERSIONS, [("courseId", course_id)])?,
        "/courses/{courseId}/versions",
        QueryOptions::new(5 * MINUTE),
    ))
}

/// Keys a course edit makes stale.
pub fn after_course_update() -> Result<Vec<KeyPrefix>, InvalidKeyError> {
    Ok(vec![KeyPrefix::resource(COURSE)?, KeyPrefix::resource(COURSES)?])
}

/// Keys an account moderation action makes stale.
pub fn after_account_action(id: i64) -> Result<Vec<KeyPrefix>, InvalidKeyError> {
    Ok(vec![
        KeyPrefix::resource(ADMIN_ACCOUNTS)?,
        KeyPrefix::scoped(ADMIN_ACCOUNT, [("id", id)])?,
    ])
}

pub fn after_enrollment() -> Result<Vec<KeyPrefix>, InvalidKeyError> {
    Ok(vec![KeyPrefix::resource(ENROLLMENTS)?, KeyPrefix::resource(COURSE)?])
}

pub fn after_refund() -> Result<Vec<KeyPrefix>, InvalidKeyError> {
    Ok(vec![KeyPrefix::resource(ADMIN_PAYMENTS)?])
}
