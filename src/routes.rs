//! Application routing configuration with the admission pipeline.
//!
//! # Layer Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Cross-origin headers, answers preflight
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP span carrying the request id
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ Admission chain  │ ← recovery → request_id → access_log →
//! │                  │   auth → rate_limit → deadline
//! └────────┬─────────┘
//!          │
//!          ▼
//!      Handler
//! ```
//!
//! # Routes
//!
//! - `/health`, `/ping` - Liveness (auth bypassed by default)
//! - `/data`, `/whoami` - Protected sample resources
//! - `/slow`, `/panic` - Exercise the deadline guard and fault barrier

use axum::Router;
use axum::body::Body;
use axum::http::Request;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{field, info_span};

use crate::handlers;
use crate::state::AppState;

/// Build the application router with all routes and layers configured.
///
/// The admission chain is assembled from `state`, so disabled features
/// (rate limiting, auth, deadline) contribute no stage.
pub fn build_router(state: &AppState) -> Router {
    let cors = build_cors_layer(&state.config.cors_allowed_origins);

    let trace = TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
        info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = field::Empty,
        )
    });

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ping", get(handlers::ping))
        .route("/data", get(handlers::data))
        .route("/whoami", get(handlers::whoami))
        .route("/slow", get(handlers::slow))
        .route("/panic", get(handlers::trigger_panic))
        // Applied bottom to top: the chain runs innermost
        .layer(state.build_layer())
        .layer(trace)
        .layer(cors)
        .with_state(state.clone())
}

/// Build CORS layer from configuration.
///
/// # Arguments
///
/// * `allowed_origins` - List of allowed origins, or `["*"]` for any origin
///
/// # Security Note
///
/// Using `*` (any origin) is convenient for development but should be
/// avoided in production. Specify explicit origins instead.
pub fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    #[test]
    fn test_build_cors_layer_any() {
        let origins = vec!["*".to_string()];
        let _layer = build_cors_layer(&origins);
    }

    #[test]
    fn test_build_cors_layer_specific() {
        let origins = vec![
            "https://example.com".to_string(),
            "https://app.example.com".to_string(),
        ];
        let _layer = build_cors_layer(&origins);
    }

    #[tokio::test]
    async fn test_health_bypasses_auth() {
        let state = AppState::new(Config::default()).unwrap();
        let app = build_router(&state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_protected_route_requires_credential() {
        let state = AppState::new(Config::default()).unwrap();
        let app = build_router(&state);

        let response = app
            .oneshot(Request::builder().uri("/data").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        state.shutdown().await;
    }
}
