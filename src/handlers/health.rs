//! Liveness endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check with uptime and live bucket count
//! - `GET /ping` - Plain `pong`
//!
//! Both are in the default auth and access-log skip lists.

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use tracing::instrument;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint.
///
/// Always returns 200 OK.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "uptime_seconds": 3600,
///   "live_buckets": 12,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        live_buckets: state.limiter().map(|l| l.bucket_count()),
        timestamp: Utc::now(),
    })
}

/// Ping endpoint.
pub async fn ping() -> &'static str {
    "pong"
}
