//! Error types for Lectern operations

use thiserror::Error;

/// Malformed resource descriptors. Programmer errors, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidKeyError {
    #[error("Resource name must not be empty")]
    EmptyResourceName,

    #[error("Resource name {name:?} contains an empty segment")]
    EmptySegment { name: String },

    #[error("Parameters for {resource} must be a mapping, got {found}")]
    ParamsNotMapping { resource: String, found: String },
}

/// Failures of a read against the remote API.
///
/// These terminate at the resource cache as an `error` status; they never
/// propagate into unrelated code paths.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("HTTP {status}{}: {message}", fmt_code(.code))]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Failed to decode response: {reason}")]
    Decode { reason: String },
}

impl FetchError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            code: None,
            message: message.into(),
        }
    }

    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    /// Whether a retry has a chance of succeeding.
    ///
    /// Transport failures, server errors and throttling are transient.
    /// Client errors and undecodable bodies will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::Decode { .. } => false,
        }
    }
}

fn fmt_code(code: &Option<String>) -> String {
    code.as_deref()
        .map(|c| format!(" ({})", c))
        .unwrap_or_default()
}

/// Failures of a write. Surfaced to the immediate caller, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("Mutation rejected with status {status}: {message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Mutation failed in transit: {message}")]
    Network { message: String },

    #[error("Mutation response could not be decoded: {reason}")]
    Decode { reason: String },

    #[error("Query client has been disposed")]
    Disposed,
}

impl From<FetchError> for MutationError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Network { message } => Self::Network { message },
            FetchError::Http {
                status,
                code,
                message,
            } => Self::Rejected {
                status,
                code,
                message,
            },
            FetchError::Decode { reason } => Self::Decode { reason },
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Master error type for all Lectern errors.
#[derive(Debug, Clone, Error)]
pub enum LecternError {
    #[error("Invalid key: {0}")]
    InvalidKey(#[from] InvalidKeyError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Mutation error: {0}")]
    Mutation(#[from] MutationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Lectern operations.
pub type LecternResult<T> = Result<T, LecternError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_key_display() {
        let err = InvalidKeyError::ParamsNotMapping {
            resource: "orders".to_string(),
            found: "array".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("orders"));
        assert!(msg.contains("array"));
    }

    #[test]
    fn test_http_error_display_with_code() {
        let err = FetchError::Http {
            status: 404,
            code: Some("COURSE_NOT_FOUND".to_string()),
            message: "no such course".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("404"));
        assert!(msg.contains("COURSE_NOT_FOUND"));
        assert!(msg.contains("no such course"));
    }

    #[test]
    fn test_http_error_display_without_code() {
        let msg = format!("{}", FetchError::http(502, "bad gateway"));
        assert_eq!(msg, "HTTP 502: bad gateway");
    }

    #[test]
    fn test_retry_classification() {
        assert!(FetchError::network("connection reset").is_retryable());
        assert!(FetchError::http(503, "unavailable").is_retryable());
        assert!(FetchError::http(429, "slow down").is_retryable());
        assert!(!FetchError::http(404, "missing").is_retryable());
        assert!(!FetchError::http(401, "unauthorized").is_retryable());
        assert!(!FetchError::decode("expected object").is_retryable());
    }

    #[test]
    fn test_fetch_error_into_mutation_error() {
        let err: MutationError = FetchError::Http {
            status: 409,
            code: Some("ALREADY_ENROLLED".to_string()),
            message: "duplicate".to_string(),
        }
        .into();
        assert_eq!(
            err,
            MutationError::Rejected {
                status: 409,
                code: Some("ALREADY_ENROLLED".to_string()),
                message: "duplicate".to_string(),
            }
        );

        let err: MutationError = FetchError::network("timeout").into();
        assert!(matches!(err, MutationError::Network { .. }));
    }

    #[test]
    fn test_master_error_from_conversions() {
        let err: LecternError = InvalidKeyError::EmptyResourceName.into();
        assert!(matches!(err, LecternError::InvalidKey(_)));
        assert!(format!("{}", err).contains("Resource name must not be empty"));

        let err: LecternError = MutationError::Disposed.into();
        assert!(matches!(err, LecternError::Mutation(_)));
    }
}
