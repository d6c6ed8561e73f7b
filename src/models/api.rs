use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Service version
    pub version: String,
    /// Seconds since startup
    pub uptime_seconds: u64,
    /// Live rate limit buckets (absent when rate limiting is disabled)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub live_buckets: Option<usize>,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// Payload of the sample protected resource.
#[derive(Debug, Serialize, Deserialize)]
pub struct DataResponse {
    /// Sample items
    pub items: Vec<String>,
    /// Request ID assigned by the pipeline
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_id: Option<String>,
    /// Subject of the authenticated caller, if any
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subject: Option<String>,
}

/// Who the pipeline thinks the caller is.
#[derive(Debug, Serialize, Deserialize)]
pub struct WhoAmIResponse {
    /// Whether a credential was verified
    pub authenticated: bool,
    /// Stable subject identifier
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subject: Option<String>,
    /// Human-readable name
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub display_name: Option<String>,
    /// Credential expiry
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Query parameters for the slow endpoint.
#[derive(Debug, Deserialize)]
pub struct SlowParams {
    /// How long to work, in milliseconds
    #[serde(default = "default_slow_ms")]
    pub ms: u64,
}

fn default_slow_ms() -> u64 {
    1_000
}

/// Result of the slow endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct SlowResponse {
    /// Time actually spent, in milliseconds
    pub slept_ms: u64,
    /// Remaining deadline budget when the work finished, if a deadline applies
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub remaining_budget_ms: Option<u64>,
}
