//! Request and response bodies of the LMS API.
//!
//! Only the fields the bindings rely on are modelled; unknown fields in
//! responses are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total_items: u64,
    pub total_pages: u32,
    #[serde(default)]
    pub has_next: bool,
    #[serde(default)]
    pub has_previous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub user: CurrentUser,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    pub role: String,
    pub status: String,
}

/// Body of account moderation actions.
#[derive(Debug, Clone, Serialize)]
pub struct AccountActionRequest {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseSummary {
    pub id: i64,
    pub title: String,
    pub slug: String,
    #[serde(default)]
    pub short_description: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseDetail {
    pub id: i64,
    pub title: String,
    pub slug: String,
    #[serde(default)]
    pub short_description: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub teacher_id: Option<i64>,
    #[serde(default)]
    pub is_closed: Option<bool>,
}

/// Partial course update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCourseRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseVersion {
    pub id: i64,
    #[serde(default)]
    pub version_number: Option<u32>,
    pub status: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: i64,
    pub course_id: i64,
    #[serde(default)]
    pub course_title: Option<String>,
    pub status: String,
    #[serde(default)]
    pub enrolled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollRequest {
    pub course_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: i64,
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
    pub status: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// `GET /admin/accounts` parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccountFilter {
    pub page: u32,
    pub size: u32,
    /// Backend filter expression.
    pub filter: Option<String>,
}

/// `GET /courses` parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CourseFilter {
    pub page: u32,
    pub size: u32,
    pub q: Option<String>,
    pub sort: Option<String>,
    pub category: Option<String>,
}

/// `GET /admin/payments` parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PaymentFilter {
    pub page: u32,
    pub size: u32,
    pub status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_decodes_backend_shape() {
        let page: Page<CourseSummary> = serde_json::from_value(json!({
            "items": [{"id": 42, "title": "Intro TS", "slug": "intro-ts", "price": 0}],
            "page": 0,
            "size": 20,
            "totalItems": 1,
            "totalPages": 1,
            "hasNext": false
        }))
        .unwrap();
        assert_eq!(page.items[0].slug, "intro-ts");
        assert_eq!(page.total_items, 1);
        assert!(!page.has_previous);
    }

    #[test]
    fn test_update_request_omits_absent_fields() {
        let body = UpdateCourseRequest {
            title: Some("Intro TypeScript".to_string()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&body).unwrap(), json!({"title": "Intro TypeScript"}));
    }

    #[test]
    fn test_enrollment_timestamp_parses() {
        let enrollment: Enrollment = serde_json::from_value(json!({
            "id": 7,
            "courseId": 42,
            "status": "ACTIVE",
            "enrolledAt": "2024-03-01T09:30:00Z"
        }))
        .unwrap();
        assert_eq!(enrollment.course_id, 42);
        assert!(enrollment.enrolled_at.is_some());
    }
}
