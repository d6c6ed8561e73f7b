//! Pipeline stages for authentication, admission control, deadlines and
//! fault recovery.
//!
//! - **Fault Barrier** ([`FaultBarrier`]): panics downstream become a 500
//! - **Request ID** ([`RequestIdStage`]): propagate or generate `X-Request-Id`
//! - **Access Log** ([`AccessLog`]): one log line per request, slow requests at `warn`
//! - **Auth Gate** ([`AuthGate`]): credential check with skip list and failure lockout
//! - **Rate Limit** ([`RateLimitStage`]): per-key token bucket admission
//! - **Deadline Guard** ([`DeadlineGuard`]): time budget for the rest of the chain
//!
//! # Architecture
//!
//! ```text
//! Request → Recovery → Request ID → Access Log → Auth → Rate Limit → Deadline → Handler
//!              ↓                                   ↓         ↓           ↓
//!          500 Fault                          401 / 429     429      408 Timeout
//! ```
//!
//! The fault barrier must come first: it only covers the stages after it.
//! When the rate limit key is the authenticated user, the rate limiter must
//! come after the auth gate.

pub mod access_log;
pub mod auth;
pub mod ip;
pub mod rate_limit;
pub mod recovery;
pub mod request_id;
pub mod timeout;

pub use access_log::AccessLog;
pub use auth::{AuthGate, AuthMode};
pub use ip::{CidrRange, TrustedProxyConfig, UNKNOWN_IP, client_ip};
pub use rate_limit::{KeyFn, RateLimitStage, key_by_client_ip, key_by_identity_or_ip};
pub use recovery::FaultBarrier;
pub use request_id::{REQUEST_ID_HEADER, RequestId, RequestIdExt, RequestIdStage};
pub use timeout::{
    Deadline, DeadlineExt, DeadlineGuard, MAX_REQUEST_TIMEOUT_MS, MIN_REQUEST_TIMEOUT_MS,
    REQUEST_TIMEOUT_HEADER, RequestTimeout,
};
