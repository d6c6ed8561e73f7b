//! # Turnstile
//!
//! Admission control for Axum services: an ordered chain of stages that
//! decides, per request, whether the handler runs at all and how long it may
//! take.
//!
//! - **Auth gate**: bearer credential check, skip list, brute-force lockout
//! - **Rate limiting**: per-key token buckets with idle eviction
//! - **Deadlines**: time budget with cooperative cancellation
//! - **Fault barrier**: panics become a 500 and the server keeps serving
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CORS → Trace span                                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ChainLayer: Recovery → Request ID → Access Log →           │
//! │              Auth → Rate Limit → Deadline                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, ping, data, whoami, slow, panic)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use turnstile::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config)?;
//!     let app = build_router(&state);
//!
//!     // Start the server...
//!     # let _ = app;
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Using the chain directly
//!
//! ```rust,ignore
//! let chain = Chain::builder()
//!     .stage(FaultBarrier::new())
//!     .stage(RateLimitStage::by_client_ip(limiter, trusted))
//!     .stage(DeadlineGuard::new(Duration::from_secs(5)))
//!     .build(|_req: Request| async { StatusCode::OK.into_response() });
//! ```
//!
//! ## Security Configuration
//!
//! ```bash
//! AUTH_TOKENS=secret:user-1:Alice RATE_LIMIT_RATE=5 RATE_LIMIT_CAPACITY=10 cargo run
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult, ErrorBody, Rejection};
pub use identity::{Identity, IdentityVerifier, StaticTokenVerifier};
pub use limiter::{Decision, RateLimiter, TokenBucketLimiter};
pub use pipeline::{Chain, ChainLayer, Next, Stage};
pub use routes::build_router;
pub use state::AppState;
