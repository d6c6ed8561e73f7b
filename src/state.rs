//! Shared application state and pipeline assembly.
//!
//! `AppState` owns everything the admission chain shares across requests:
//!
//! - **Limiter**: the token-bucket map (absent when rate limiting is off)
//! - **Verifier**: the identity verifier behind the auth gate
//! - **Auth gate**: kept as one shared instance so its lockout table survives
//!   across layers built from the same state
//! - **Configuration**: runtime configuration access
//!
//! # Structured Concurrency
//!
//! Background tasks (bucket sweeper, lockout pruning) run on a
//! `tokio_util::task::TaskTracker` and stop on a `CancellationToken`. Inner
//! request tasks spawned by the deadline guard run on a second tracker so
//! shutdown can give abandoned work a bounded grace period. Call
//! `shutdown()` before exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{Config, RateLimitKey};
use crate::error::{AppError, AppResult};
use crate::identity::{IdentityVerifier, StaticTokenVerifier};
use crate::limiter::{self, RateLimiter, TokenBucketLimiter};
use crate::middleware::{
    AccessLog, AuthGate, AuthMode, DeadlineGuard, FaultBarrier, RateLimitStage, RequestIdStage,
    TrustedProxyConfig,
};
use crate::pipeline::{ChainBuilder, ChainLayer};

/// How often expired auth lockouts are pruned.
const LOCKOUT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// How long shutdown waits for abandoned inner tasks.
const INFLIGHT_GRACE: Duration = Duration::from_secs(10);

/// Shared application state.
///
/// Cloning is cheap; all internal data is behind `Arc`.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// let app = build_router(&state);
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Per-key token buckets, `None` when rate limiting is disabled
    limiter: Option<Arc<TokenBucketLimiter>>,
    /// Identity verifier used by the auth gate
    verifier: Arc<dyn IdentityVerifier>,
    /// Shared auth gate, `None` when `AUTH_MODE=off`
    auth_gate: Option<Arc<AuthGate>>,
    /// Proxies allowed to set forwarding headers
    trusted_proxies: Arc<TrustedProxyConfig>,
    /// Tracks background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Tracks inner request tasks spawned by the deadline guard
    inflight_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Create state with the static token verifier built from `AUTH_TOKENS`.
    ///
    /// # Errors
    ///
    /// Returns `AppError` if a credential spec or the limiter settings are
    /// invalid.
    pub fn new(config: Config) -> AppResult<Self> {
        let verifier =
            StaticTokenVerifier::from_specs(&config.auth_tokens).map_err(AppError::ConfigError)?;

        if config.auth_mode == AuthMode::Required && verifier.is_empty() {
            warn!("AUTH_MODE=required but AUTH_TOKENS is empty; every protected request will be rejected");
        }

        Self::with_verifier(config, Arc::new(verifier))
    }

    /// Create state around an externally supplied verifier.
    ///
    /// Must be called from within a Tokio runtime; background tasks are
    /// spawned immediately.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if `config` fails validation, which
    /// also covers configs built as struct literals rather than loaded from
    /// the environment.
    pub fn with_verifier(config: Config, verifier: Arc<dyn IdentityVerifier>) -> AppResult<Self> {
        config.validate()?;

        let trusted_proxies = Arc::new(TrustedProxyConfig::new(&config.trusted_proxies));

        let limiter = if config.rate_limiting_enabled() {
            Some(Arc::new(TokenBucketLimiter::new(
                config.rate_limit_rate,
                config.rate_limit_capacity,
            )?))
        } else {
            None
        };

        let auth_gate = match AuthGate::for_mode(config.auth_mode, Arc::clone(&verifier)) {
            Some(gate) => Some(Arc::new(
                gate.skip_paths(config.auth_bypass_paths.iter().cloned())
                    .token_header(config.token_header()?)
                    .token_prefix(config.auth_token_prefix.clone())
                    .trusted_proxies(Arc::clone(&trusted_proxies)),
            )),
            None => None,
        };

        let state = Self {
            config: Arc::new(config),
            started_at: Instant::now(),
            limiter,
            verifier,
            auth_gate,
            trusted_proxies,
            task_tracker: TaskTracker::new(),
            inflight_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        // Spawn background tasks
        state.spawn_bucket_sweeper();
        state.spawn_lockout_pruner();

        Ok(state)
    }

    /// The stage list in execution order, ready for a terminal handler.
    ///
    /// ```text
    /// recovery → request_id → access_log → auth → rate_limit → deadline
    /// ```
    ///
    /// Disabled features contribute no stage.
    pub fn chain_builder(&self) -> ChainBuilder {
        let config = &self.config;

        let mut builder = ChainBuilder::new()
            .stage(
                FaultBarrier::new()
                    .expose_detail(config.recovery_expose_detail)
                    .trusted_proxies(Arc::clone(&self.trusted_proxies)),
            )
            .stage(RequestIdStage::new())
            .stage(
                AccessLog::new()
                    .slow_threshold(config.slow_request_threshold)
                    .skip_paths(config.access_log_skip_paths.iter().cloned())
                    .trusted_proxies(Arc::clone(&self.trusted_proxies)),
            );

        if let Some(gate) = &self.auth_gate {
            builder = builder.stage(Arc::clone(gate));
        }

        if let Some(limiter) = &self.limiter {
            let limiter: Arc<dyn RateLimiter> = limiter.clone();
            let trusted = Arc::clone(&self.trusted_proxies);
            builder = builder.stage(match config.rate_limit_key {
                RateLimitKey::Ip => RateLimitStage::by_client_ip(limiter, trusted),
                RateLimitKey::User => RateLimitStage::by_identity_or_ip(limiter, trusted),
            });
        }

        builder.optional_stage(config.deadline_enabled().then(|| {
            DeadlineGuard::new(config.request_timeout)
                .abort_on_timeout(config.abort_on_timeout)
                .with_tracker(self.inflight_tracker.clone())
        }))
    }

    /// The configured chain as a tower layer for the router.
    pub fn build_layer(&self) -> ChainLayer {
        let layer = self.chain_builder().into_layer();
        info!(stages = ?layer.stage_names(), "Admission pipeline assembled");
        layer
    }

    /// The token-bucket limiter, if rate limiting is enabled.
    pub fn limiter(&self) -> Option<&Arc<TokenBucketLimiter>> {
        self.limiter.as_ref()
    }

    /// The identity verifier.
    pub fn verifier(&self) -> &Arc<dyn IdentityVerifier> {
        &self.verifier
    }

    /// Proxies trusted for forwarding headers.
    pub fn trusted_proxies(&self) -> &Arc<TrustedProxyConfig> {
        &self.trusted_proxies
    }

    /// Spawn the idle bucket sweeper.
    ///
    /// The effective TTL is never shorter than a full refill, so an evicted
    /// bucket would have been full anyway.
    fn spawn_bucket_sweeper(&self) {
        let Some(limiter) = self.limiter.clone() else {
            return;
        };
        if !self.config.eviction_enabled() {
            debug!("Idle bucket eviction disabled");
            return;
        }

        let ttl = self.config.bucket_idle_ttl.max(limiter.full_refill_time());
        let sweep_interval = self.config.bucket_sweep_interval;
        info!(
            ttl_secs = ttl.as_secs(),
            interval_secs = sweep_interval.as_secs(),
            "Idle bucket eviction enabled"
        );

        self.task_tracker.spawn(limiter::run_sweeper(
            limiter,
            sweep_interval,
            ttl,
            self.cancellation_token.clone(),
        ));
    }

    /// Spawn the task that drops expired auth lockouts.
    fn spawn_lockout_pruner(&self) {
        let Some(gate) = self.auth_gate.clone() else {
            return;
        };
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(LOCKOUT_PRUNE_INTERVAL);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Lockout pruner received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => gate.prune_lockouts(),
                }
            }

            debug!("Lockout pruner shutting down");
        });
    }

    /// Gracefully shutdown background tasks and wait for in-flight work.
    ///
    /// 1. Signals background tasks to stop via the cancellation token
    /// 2. Waits for them to complete
    /// 3. Waits up to a grace period for inner request tasks still running
    ///    after their deadline
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        self.inflight_tracker.close();
        let pending = self.inflight_tracker.len();
        if pending > 0 {
            info!(pending, "Waiting for in-flight request tasks");
        }
        if tokio::time::timeout(INFLIGHT_GRACE, self.inflight_tracker.wait())
            .await
            .is_err()
        {
            warn!(
                pending = self.inflight_tracker.len(),
                "In-flight request tasks did not finish within the grace period"
            );
        }

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
