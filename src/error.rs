use std::time::Duration;

use axum::http::header::{HeaderName, HeaderValue, RETRY_AFTER, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::VerifyError;
use crate::limiter::LimiterConfigError;

/// Startup and configuration errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid rate limiter settings: {0}")]
    Limiter(#[from] LimiterConfigError),

    #[error("Metrics exporter error: {0}")]
    Metrics(String),
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

/// Why a credential was not accepted by the auth gate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("missing credential")]
    MissingCredential,

    #[error("credential does not match the expected scheme")]
    MalformedCredential,

    #[error(transparent)]
    Rejected(#[from] VerifyError),
}

impl AuthFailure {
    /// Machine-readable reason code returned to clients.
    pub fn reason_code(&self) -> &'static str {
        match self {
            AuthFailure::MissingCredential => "missing_credential",
            AuthFailure::MalformedCredential => "malformed_credential",
            AuthFailure::Rejected(e) => e.reason_code(),
        }
    }
}

/// Structured outcomes produced by the pipeline instead of a handler
/// response.
///
/// Each variant renders the same JSON shape ([`ErrorBody`]) with a fixed
/// status code. Nothing here is retried by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// Admission budget exhausted for the caller's key.
    #[error("rate limit exceeded")]
    RateLimited {
        /// Time until a token is available again.
        retry_after: Duration,
        /// Configured bucket capacity, echoed in `X-RateLimit-Limit`.
        limit: u32,
    },

    /// Too many failed credentials from one address.
    #[error("too many failed authentication attempts")]
    AuthLockout {
        /// Time until the address may try again.
        retry_after: Duration,
    },

    /// Missing, malformed, invalid or expired credential.
    #[error("unauthenticated: {0}")]
    Unauthenticated(AuthFailure),

    /// Downstream processing outran its time budget.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A fault was caught by the fault barrier. `detail` is only populated
    /// when exposing fault details is enabled.
    #[error("internal fault")]
    InternalFault {
        /// Fault description, shown to the caller only when set.
        detail: Option<String>,
    },
}

impl Rejection {
    /// HTTP status for this rejection.
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::RateLimited { .. } | Rejection::AuthLockout { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Rejection::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Rejection::DeadlineExceeded => StatusCode::REQUEST_TIMEOUT,
            Rejection::InternalFault { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Rejection::RateLimited { .. } => "rate_limited",
            Rejection::AuthLockout { .. } => "auth_lockout",
            Rejection::Unauthenticated(_) => "unauthenticated",
            Rejection::DeadlineExceeded => "deadline_exceeded",
            Rejection::InternalFault { .. } => "internal_fault",
        }
    }

    fn body(&self) -> ErrorBody {
        let status = self.status();
        match self {
            Rejection::RateLimited { .. } => {
                ErrorBody::new(status, "Too many requests. Please retry later.")
            }
            Rejection::AuthLockout { .. } => ErrorBody::new(
                status,
                "Too many failed authentication attempts. Please wait before retrying.",
            ),
            Rejection::Unauthenticated(failure) => {
                ErrorBody::new(status, "Authentication failed.")
                    .with_error(failure.reason_code())
            }
            Rejection::DeadlineExceeded => ErrorBody::new(status, "Request timed out."),
            Rejection::InternalFault { detail } => {
                let body = ErrorBody::new(status, "Internal server error.");
                match detail {
                    Some(detail) => body.with_error(detail.clone()),
                    None => body,
                }
            }
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match self {
            Rejection::RateLimited { retry_after, limit } => {
                headers.insert(RETRY_AFTER, retry_after_header(*retry_after));
                headers.insert(
                    HeaderName::from_static("x-ratelimit-limit"),
                    HeaderValue::from(*limit),
                );
                headers.insert(
                    HeaderName::from_static("x-ratelimit-remaining"),
                    HeaderValue::from_static("0"),
                );
            }
            Rejection::AuthLockout { retry_after } => {
                headers.insert(RETRY_AFTER, retry_after_header(*retry_after));
            }
            Rejection::Unauthenticated(_) => {
                headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            Rejection::DeadlineExceeded | Rejection::InternalFault { .. } => {}
        }
        headers
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status(), self.headers(), axum::Json(self.body())).into_response()
    }
}

/// Whole seconds for `Retry-After`, rounded up and never below one.
fn retry_after_header(retry_after: Duration) -> HeaderValue {
    let mut secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs = secs.saturating_add(1);
    }
    HeaderValue::from(secs.max(1))
}

/// JSON body of every pipeline rejection.
///
/// ```json
/// { "code": 429, "message": "Too many requests. Please retry later." }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// HTTP status code, repeated in the body.
    #[serde(rename = "code")]
    pub status_code: u16,
    /// Human readable summary.
    pub message: String,
    /// Optional reason code or detail.
    #[serde(rename = "error", skip_serializing_if = "Option::is_none", default)]
    pub error_detail: Option<String>,
}

impl ErrorBody {
    /// Body with no detail.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status_code: status.as_u16(),
            message: message.into(),
            error_detail: None,
        }
    }

    /// Attach a reason code or detail.
    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn body_of(rejection: Rejection) -> (StatusCode, HeaderMap, ErrorBody) {
        let response = rejection.into_response();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let (status, headers, body) = body_of(Rejection::RateLimited {
            retry_after: Duration::from_millis(500),
            limit: 20,
        })
        .await;

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(headers.get(RETRY_AFTER).unwrap(), "1");
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "20");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(body.status_code, 429);
        assert!(body.error_detail.is_none());
    }

    #[tokio::test]
    async fn test_unauthenticated_carries_reason_code() {
        let (status, headers, body) = body_of(Rejection::Unauthenticated(
            AuthFailure::Rejected(VerifyError::Expired),
        ))
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(headers.get(WWW_AUTHENTICATE).unwrap(), "Bearer");
        assert_eq!(body.error_detail.as_deref(), Some("expired"));
    }

    #[tokio::test]
    async fn test_deadline_exceeded_response() {
        let (status, _, body) = body_of(Rejection::DeadlineExceeded).await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(body.status_code, 408);
    }

    #[tokio::test]
    async fn test_internal_fault_hides_detail_by_default() {
        let (status, _, body) = body_of(Rejection::InternalFault { detail: None }).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.error_detail.is_none());

        let (_, _, body) = body_of(Rejection::InternalFault {
            detail: Some("boom".to_string()),
        })
        .await;
        assert_eq!(body.error_detail.as_deref(), Some("boom"));
    }

    #[test]
    fn test_body_serializes_without_empty_detail() {
        let json = serde_json::to_value(ErrorBody::new(StatusCode::REQUEST_TIMEOUT, "late")).unwrap();
        assert_eq!(json, serde_json::json!({ "code": 408, "message": "late" }));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_header(Duration::ZERO), "1");
        assert_eq!(retry_after_header(Duration::from_millis(1500)), "2");
        assert_eq!(retry_after_header(Duration::from_secs(3)), "3");
        assert_eq!(retry_after_header(Duration::MAX), u64::MAX.to_string().as_str());
    }

    #[test]
    fn test_auth_failure_reason_codes() {
        assert_eq!(
            AuthFailure::MissingCredential.reason_code(),
            "missing_credential"
        );
        assert_eq!(
            AuthFailure::MalformedCredential.reason_code(),
            "malformed_credential"
        );
        assert_eq!(
            AuthFailure::from(VerifyError::SignatureInvalid).reason_code(),
            "signature_invalid"
        );
    }
}
