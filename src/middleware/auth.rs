//! Credential gate in front of protected routes.
//!
//! # Modes
//!
//! - [`AuthMode::Required`]: requests must carry a valid credential; anything
//!   else is answered with 401 and a reason code.
//! - [`AuthMode::Optional`]: a valid credential attaches an [`Identity`], a
//!   missing or bad one is ignored. Never short-circuits.
//! - [`AuthMode::Off`]: no gate is installed.
//!
//! # Credential Location
//!
//! By default the credential is read from `Authorization: Bearer <token>`.
//! Both the header and the scheme prefix are configurable; an empty prefix
//! means the whole header value is the credential. The scheme must match
//! exactly (case-sensitive) and be separated from the token by one space.
//!
//! # Bypassed Paths
//!
//! Paths in the skip list pass through untouched. Matching is an exact string
//! comparison against `request.uri().path()`, so `/health` is bypassed while
//! `/health/` and `/HEALTH` are not. Query strings are not part of the path.
//!
//! # Brute Force Protection
//!
//! In required mode each address gets a failure budget (GCRA via
//! `governor`, 10 per minute with a burst of 5). The failure that exhausts
//! the budget locks the address out until the budget recovers; locked-out
//! requests get 429 before their credential is looked at.

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::header::{AUTHORIZATION, HeaderName};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tracing::{debug, error, warn};

use super::ip::{TrustedProxyConfig, client_ip};
use crate::error::{AuthFailure, Rejection};
use crate::identity::{Identity, IdentityVerifier};
use crate::metrics;
use crate::pipeline::{BoxFuture, Next, Request, Response, Stage};

/// Default scheme prefix.
pub const DEFAULT_TOKEN_PREFIX: &str = "Bearer";

/// Default paths that bypass authentication.
pub const DEFAULT_BYPASS_PATHS: [&str; 2] = ["/health", "/ping"];

/// Maximum auth failures per address per minute.
const AUTH_FAILURE_LIMIT: NonZeroU32 = NonZeroU32::new(10).unwrap();

/// Burst capacity for auth failures.
const AUTH_FAILURE_BURST: NonZeroU32 = NonZeroU32::new(5).unwrap();

type AuthFailureLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// How the gate treats requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// Reject requests without a valid credential.
    #[default]
    Required,
    /// Attach an identity when possible, never reject.
    Optional,
    /// No authentication.
    Off,
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "required" => Ok(AuthMode::Required),
            "optional" => Ok(AuthMode::Optional),
            "off" | "disabled" | "none" => Ok(AuthMode::Off),
            other => Err(format!(
                "unknown auth mode '{other}', expected required, optional or off"
            )),
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthMode::Required => "required",
            AuthMode::Optional => "optional",
            AuthMode::Off => "off",
        })
    }
}

/// Authentication stage.
///
/// ```rust,ignore
/// let gate = AuthGate::required(verifier)
///     .skip_paths(["/health"])
///     .trusted_proxies(trusted);
/// ```
pub struct AuthGate {
    verifier: Arc<dyn IdentityVerifier>,
    optional: bool,
    bypass_paths: Vec<String>,
    token_header: HeaderName,
    token_prefix: String,
    trusted_proxies: Arc<TrustedProxyConfig>,
    failure_limiter: Option<AuthFailureLimiter>,
    locked_out: DashMap<String, Instant>,
}

impl AuthGate {
    /// Gate that rejects requests without a valid credential.
    pub fn required(verifier: Arc<dyn IdentityVerifier>) -> Self {
        let quota = Quota::per_minute(AUTH_FAILURE_LIMIT).allow_burst(AUTH_FAILURE_BURST);
        Self {
            optional: false,
            failure_limiter: Some(RateLimiter::keyed(quota)),
            ..Self::optional(verifier)
        }
    }

    /// Gate that attaches an identity when it can and never rejects.
    pub fn optional(verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self {
            verifier,
            optional: true,
            bypass_paths: DEFAULT_BYPASS_PATHS.iter().map(|s| (*s).to_string()).collect(),
            token_header: AUTHORIZATION,
            token_prefix: DEFAULT_TOKEN_PREFIX.to_string(),
            trusted_proxies: Arc::new(TrustedProxyConfig::default()),
            failure_limiter: None,
            locked_out: DashMap::new(),
        }
    }

    /// Build a gate for `mode`; `None` for [`AuthMode::Off`].
    pub fn for_mode(mode: AuthMode, verifier: Arc<dyn IdentityVerifier>) -> Option<Self> {
        match mode {
            AuthMode::Required => Some(Self::required(verifier)),
            AuthMode::Optional => Some(Self::optional(verifier)),
            AuthMode::Off => None,
        }
    }

    /// Replace the skip list (exact path matches).
    pub fn skip_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bypass_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Read the credential from `header`.
    pub fn token_header(mut self, header: HeaderName) -> Self {
        self.token_header = header;
        self
    }

    /// Scheme prefix before the credential; empty means the raw header.
    pub fn token_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.token_prefix = prefix.into();
        self
    }

    /// Proxies trusted for the address used by the failure lockout.
    pub fn trusted_proxies(mut self, trusted_proxies: Arc<TrustedProxyConfig>) -> Self {
        self.trusted_proxies = trusted_proxies;
        self
    }

    /// Disable the failure lockout.
    pub fn without_lockout(mut self) -> Self {
        self.failure_limiter = None;
        self
    }

    /// Whether requests without a valid credential are rejected.
    pub fn is_required(&self) -> bool {
        !self.optional
    }

    /// Whether `path` bypasses the gate.
    pub fn is_bypassed(&self, path: &str) -> bool {
        self.bypass_paths.iter().any(|p| p == path)
    }

    /// Drop expired lockouts and idle failure counters.
    pub fn prune_lockouts(&self) {
        let now = Instant::now();
        self.locked_out.retain(|_, until| *until > now);
        if let Some(limiter) = &self.failure_limiter {
            limiter.retain_recent();
        }
    }

    /// Extract the credential from `headers`.
    ///
    /// Returns `Ok(None)` when the header is absent or empty.
    ///
    /// # Errors
    ///
    /// [`AuthFailure::MalformedCredential`] when the value is not valid text
    /// or does not use the configured scheme.
    pub fn extract_credential<'a>(
        &self,
        headers: &'a HeaderMap,
    ) -> Result<Option<&'a str>, AuthFailure> {
        let Some(value) = headers.get(&self.token_header) else {
            return Ok(None);
        };
        let value = value
            .to_str()
            .map_err(|_| AuthFailure::MalformedCredential)?;
        if value.is_empty() {
            return Ok(None);
        }

        if self.token_prefix.is_empty() {
            return Ok(Some(value));
        }

        match value.split_once(' ') {
            Some((scheme, token)) if scheme == self.token_prefix => Ok(Some(token)),
            _ => Err(AuthFailure::MalformedCredential),
        }
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthFailure> {
        let credential = self
            .extract_credential(headers)?
            .ok_or(AuthFailure::MissingCredential)?;
        Ok(self.verifier.verify(credential)?)
    }

    /// Remaining lockout for `ip`, clearing it once expired.
    fn lockout_remaining(&self, ip: &str) -> Option<Duration> {
        let now = Instant::now();
        let until = *self.locked_out.get(ip)?;
        if until > now {
            return Some(until - now);
        }
        self.locked_out.remove_if(ip, |_, until| *until <= now);
        None
    }

    /// Count a failure; returns the lockout duration if this one exhausted
    /// the budget.
    fn record_failure(&self, ip: &str) -> Option<Duration> {
        let limiter = self.failure_limiter.as_ref()?;
        match limiter.check_key(&ip.to_string()) {
            Ok(()) => None,
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                self.locked_out.insert(ip.to_string(), Instant::now() + wait);
                Some(wait)
            }
        }
    }
}

impl fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGate")
            .field("optional", &self.optional)
            .field("bypass_paths", &self.bypass_paths)
            .field("token_header", &self.token_header)
            .field("token_prefix", &self.token_prefix)
            .field("lockout", &self.failure_limiter.is_some())
            .finish_non_exhaustive()
    }
}

impl Stage for AuthGate {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn process(&self, mut request: Request, next: Next) -> BoxFuture<Response> {
        if self.is_bypassed(request.uri().path()) {
            debug!(path = %request.uri().path(), "Bypassing auth");
            return next.run(request);
        }

        if self.optional {
            match self.authenticate(request.headers()) {
                Ok(identity) => {
                    debug!(subject = %identity.subject, "Optional auth attached identity");
                    request.extensions_mut().insert(identity);
                }
                Err(failure) => {
                    debug!(reason = failure.reason_code(), "Optional auth found no identity");
                }
            }
            return next.run(request);
        }

        let ip = client_ip(&request, &self.trusted_proxies);

        if let Some(retry_after) = self.lockout_remaining(&ip) {
            error!(
                client_ip = %ip,
                retry_after_secs = retry_after.as_secs().max(1),
                "Address blocked due to excessive auth failures"
            );
            metrics::record_auth_lockout();
            return Box::pin(async move { Rejection::AuthLockout { retry_after }.into_response() });
        }

        match self.authenticate(request.headers()) {
            Ok(identity) => {
                debug!(subject = %identity.subject, "Authentication successful");
                request.extensions_mut().insert(identity);
                next.run(request)
            }
            Err(failure) => {
                let reason = failure.reason_code();
                metrics::record_auth_failure(reason);
                warn!(
                    path = %request.uri().path(),
                    client_ip = %ip,
                    reason,
                    "Authentication failed"
                );

                let rejection = match self.record_failure(&ip) {
                    Some(retry_after) => {
                        metrics::record_auth_lockout();
                        Rejection::AuthLockout { retry_after }
                    }
                    None => Rejection::Unauthenticated(failure),
                };
                Box::pin(async move { rejection.into_response() })
            }
        }
    }
}
