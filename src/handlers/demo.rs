//! Sample endpoints behind the admission pipeline.
//!
//! - `GET /data` - protected resource
//! - `GET /whoami` - echoes the verified identity
//! - `GET /slow?ms=N` - sleeps, stopping early when the deadline fires
//! - `GET /panic` - always panics, for exercising the fault barrier

use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::Query;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::identity::RequestIdentityExt;
use crate::middleware::{DeadlineExt, RequestIdExt};
use crate::models::{DataResponse, SlowParams, SlowResponse, WhoAmIResponse};
use crate::pipeline::Request;

/// Longest sleep `/slow` will honor.
const MAX_SLOW_MS: u64 = 60_000;

/// Sample protected resource.
pub async fn data(request: Request) -> Json<DataResponse> {
    Json(DataResponse {
        items: vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()],
        request_id: request.request_id().map(str::to_owned),
        subject: request.identity().map(|i| i.subject.clone()),
    })
}

/// Identity attached by the auth gate.
///
/// Non-expiring credentials report no `expires_at`.
///
/// With `AUTH_MODE=optional` an anonymous caller gets
/// `{"authenticated": false}` instead of a 401.
pub async fn whoami(request: Request) -> Json<WhoAmIResponse> {
    let response = match request.identity() {
        Some(identity) => WhoAmIResponse {
            authenticated: true,
            subject: Some(identity.subject.clone()),
            display_name: Some(identity.display_name.clone()),
            expires_at: (identity.expires_at != DateTime::<Utc>::MAX_UTC)
                .then_some(identity.expires_at),
        },
        None => WhoAmIResponse {
            authenticated: false,
            subject: None,
            display_name: None,
            expires_at: None,
        },
    };
    Json(response)
}

/// Sleep for `ms` milliseconds (capped), cooperating with the deadline.
#[instrument(skip(request))]
pub async fn slow(Query(params): Query<SlowParams>, request: Request) -> Json<SlowResponse> {
    let wanted = Duration::from_millis(params.ms.min(MAX_SLOW_MS));
    let deadline = request.deadline().cloned();
    let start = Instant::now();

    match &deadline {
        Some(deadline) => {
            tokio::select! {
                _ = tokio::time::sleep(wanted) => {}
                _ = deadline.cancelled() => {
                    debug!("Deadline fired, stopping slow work early");
                }
            }
        }
        None => tokio::time::sleep(wanted).await,
    }

    Json(SlowResponse {
        slept_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        remaining_budget_ms: deadline
            .map(|d| u64::try_from(d.remaining().as_millis()).unwrap_or(u64::MAX)),
    })
}

/// Always panics.
pub async fn trigger_panic() -> &'static str {
    panic!("panic requested by client")
}
