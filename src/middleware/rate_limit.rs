//! Admission control stage backed by a [`RateLimiter`].
//!
//! # Keys
//!
//! Each request is mapped to a key by a [`KeyFn`]; the limiter keeps one
//! bucket per key. Two derivations ship with the crate:
//!
//! - [`RateLimitStage::by_client_ip`]: the caller's address (see
//!   [`client_ip`]). This is the default.
//! - [`RateLimitStage::by_identity_or_ip`]: the authenticated subject when
//!   the auth gate attached one, the address otherwise. Place this stage
//!   after the auth gate.
//!
//! # Response Headers
//!
//! Admitted responses carry `X-RateLimit-Limit` and `X-RateLimit-Remaining`.
//! Rejections are answered with 429 plus `Retry-After` (see
//! [`Rejection::RateLimited`]).

use std::fmt;
use std::sync::Arc;

use axum::http::HeaderValue;
use axum::response::IntoResponse;
use tracing::warn;

use super::ip::{TrustedProxyConfig, client_ip};
use crate::error::Rejection;
use crate::identity::RequestIdentityExt;
use crate::limiter::{Decision, RateLimiter};
use crate::metrics;
use crate::pipeline::{BoxFuture, Next, Request, Response, Stage};

/// Derives the rate limit key from a request.
pub type KeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Key by caller address.
pub fn key_by_client_ip(trusted_proxies: Arc<TrustedProxyConfig>) -> KeyFn {
    Arc::new(move |req: &Request| client_ip(req, &trusted_proxies).into_owned())
}

/// Key by authenticated subject, falling back to the caller address.
///
/// Subjects and addresses live in separate namespaces so a subject can
/// never collide with an address string.
pub fn key_by_identity_or_ip(trusted_proxies: Arc<TrustedProxyConfig>) -> KeyFn {
    Arc::new(move |req: &Request| match req.identity() {
        Some(identity) => format!("user:{}", identity.subject),
        None => format!("ip:{}", client_ip(req, &trusted_proxies)),
    })
}

/// Rejects requests whose key has no tokens left.
#[derive(Clone)]
pub struct RateLimitStage {
    limiter: Arc<dyn RateLimiter>,
    key_fn: KeyFn,
}

impl RateLimitStage {
    /// Create a stage with a custom key derivation.
    pub fn new<F>(limiter: Arc<dyn RateLimiter>, key_fn: F) -> Self
    where
        F: Fn(&Request) -> String + Send + Sync + 'static,
    {
        Self {
            limiter,
            key_fn: Arc::new(key_fn),
        }
    }

    /// Create a stage from a shared [`KeyFn`].
    pub fn with_key_fn(limiter: Arc<dyn RateLimiter>, key_fn: KeyFn) -> Self {
        Self { limiter, key_fn }
    }

    /// Key by caller address.
    pub fn by_client_ip(
        limiter: Arc<dyn RateLimiter>,
        trusted_proxies: Arc<TrustedProxyConfig>,
    ) -> Self {
        Self::with_key_fn(limiter, key_by_client_ip(trusted_proxies))
    }

    /// Key by authenticated subject, falling back to the caller address.
    pub fn by_identity_or_ip(
        limiter: Arc<dyn RateLimiter>,
        trusted_proxies: Arc<TrustedProxyConfig>,
    ) -> Self {
        Self::with_key_fn(limiter, key_by_identity_or_ip(trusted_proxies))
    }
}

impl fmt::Debug for RateLimitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitStage")
            .field("limit", &self.limiter.limit())
            .finish_non_exhaustive()
    }
}

impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn process(&self, request: Request, next: Next) -> BoxFuture<Response> {
        let key = (self.key_fn)(&request);
        let limit = self.limiter.limit();
        let decision = self.limiter.check(&key);
        metrics::record_admission(decision.is_admitted());

        match decision {
            Decision::Admitted { remaining } => Box::pin(async move {
                let mut response = next.run(request).await;
                let headers = response.headers_mut();
                headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
                response
            }),
            Decision::Rejected { retry_after } => {
                warn!(
                    key = %key,
                    path = %request.uri().path(),
                    retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                    "Rate limit exceeded"
                );
                let rejection = Rejection::RateLimited { retry_after, limit };
                Box::pin(async move { rejection.into_response() })
            }
        }
    }
}
