//! Per-request access log.
//!
//! Logs method, path, status, latency, client address and user agent once
//! the rest of the chain has produced a response. Requests slower than the
//! threshold are logged at `warn`, everything else at `info`. Paths and
//! methods in the skip lists are not logged (exact match).
//!
//! Request duration is recorded in `turnstile_request_duration_seconds` for
//! every request, skipped or not.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::Method;
use axum::http::header::USER_AGENT;
use tracing::{info, warn};

use super::ip::{TrustedProxyConfig, client_ip};
use crate::metrics;
use crate::pipeline::{BoxFuture, Next, Request, Response, Stage};

/// Default slow request threshold.
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(200);

/// Access log stage.
#[derive(Debug, Clone)]
pub struct AccessLog {
    slow_threshold: Duration,
    skip_paths: Vec<String>,
    skip_methods: Vec<Method>,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl Default for AccessLog {
    fn default() -> Self {
        Self {
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
            skip_paths: vec!["/health".to_string(), "/ping".to_string()],
            skip_methods: Vec::new(),
            trusted_proxies: Arc::new(TrustedProxyConfig::default()),
        }
    }
}

impl AccessLog {
    /// Access log with the default threshold and skip list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests slower than this are logged at `warn`.
    pub fn slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// Replace the path skip list.
    pub fn skip_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the method skip list.
    pub fn skip_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.skip_methods = methods.into_iter().collect();
        self
    }

    /// Proxies trusted when logging the client address.
    pub fn trusted_proxies(mut self, trusted_proxies: Arc<TrustedProxyConfig>) -> Self {
        self.trusted_proxies = trusted_proxies;
        self
    }

    fn is_skipped(&self, method: &Method, path: &str) -> bool {
        self.skip_paths.iter().any(|p| p == path) || self.skip_methods.contains(method)
    }
}

impl Stage for AccessLog {
    fn name(&self) -> &'static str {
        "access_log"
    }

    fn process(&self, request: Request, next: Next) -> BoxFuture<Response> {
        let method = request.method().clone();
        let skipped = self.is_skipped(&method, request.uri().path());
        let uri = request.uri().clone();
        let client_ip = client_ip(&request, &self.trusted_proxies);
        let user_agent = request
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        let slow_threshold = self.slow_threshold;

        Box::pin(async move {
            let start = Instant::now();
            let response = next.run(request).await;
            let latency = start.elapsed();
            let status = response.status().as_u16();

            metrics::record_request_duration(method.as_str(), status, latency.as_secs_f64());

            if skipped {
                return response;
            }

            let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
            if latency > slow_threshold {
                warn!(
                    method = %method,
                    uri = %uri,
                    status,
                    latency_ms,
                    client_ip = %client_ip,
                    user_agent = %user_agent,
                    "Slow request"
                );
            } else {
                info!(
                    method = %method,
                    uri = %uri,
                    status,
                    latency_ms,
                    client_ip = %client_ip,
                    user_agent = %user_agent,
                    "HTTP request"
                );
            }

            response
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::pipeline::Chain;
    use axum::body::Body;
    use axum::http::{self, StatusCode};
    use axum::response::IntoResponse;

    #[test]
    fn test_skip_rules() {
        let log = AccessLog::new().skip_methods([Method::OPTIONS]);
        assert!(log.is_skipped(&Method::GET, "/health"));
        assert!(!log.is_skipped(&Method::GET, "/health/"));
        assert!(log.is_skipped(&Method::OPTIONS, "/data"));
        assert!(!log.is_skipped(&Method::GET, "/data"));
    }

    #[tokio::test]
    async fn test_response_passes_through_unchanged() {
        let chain = Chain::builder()
            .stage(AccessLog::new().slow_threshold(Duration::ZERO))
            .build(|_req: Request| async { StatusCode::ACCEPTED.into_response() });

        let response = chain
            .invoke(http::Request::builder().uri("/data").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
