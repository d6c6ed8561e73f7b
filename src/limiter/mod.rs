//! Per-key token-bucket admission control.
//!
//! # Algorithm
//!
//! Each key owns a bucket holding a real-valued token count in
//! `[0, capacity]`. Refill is lazy: nothing ticks in the background, the
//! elapsed time since the bucket was last touched is converted to tokens on
//! the next call for that key.
//!
//! - First call for a key: create the bucket with `capacity - 1` tokens and
//!   admit (the creating request spends its token up front).
//! - Later calls: `tokens = min(capacity, tokens + elapsed * rate)`, then admit
//!   and spend one token if `tokens >= 1`, otherwise reject.
//!
//! A fresh key therefore admits exactly `capacity` back-to-back requests,
//! then one request every `1 / rate` seconds.
//!
//! # Concurrency
//!
//! Buckets live in a [`DashMap`], which stripes keys across shards with one
//! lock per shard. Updates to a single bucket are serialized by its shard
//! lock, while keys on different shards never contend. `check` never awaits
//! and never blocks beyond the shard critical section.
//!
//! # Idle Eviction
//!
//! Buckets are created lazily and would otherwise live forever.
//! [`TokenBucketLimiter::evict_idle`] drops buckets untouched for at least
//! `max(ttl, capacity / rate)`. A bucket idle that long has refilled
//! completely, and a recreated bucket behaves exactly like a full one, so
//! eviction never changes an admit/reject decision.

mod clock;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub use clock::{Clock, MockClock, SystemClock};

use crate::metrics;

/// Invalid limiter parameters.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum LimiterConfigError {
    /// Rate was zero, negative, NaN or infinite.
    #[error("rate must be a finite number of tokens per second greater than 0, got {0}")]
    InvalidRate(f64),

    /// Capacity was zero.
    #[error("capacity must be greater than 0")]
    ZeroCapacity,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Request admitted; `remaining` whole tokens are left.
    Admitted {
        /// Whole tokens left in the bucket after spending.
        remaining: u32,
    },
    /// Request rejected; one token will be available after `retry_after`.
    Rejected {
        /// Time until the next token is available.
        retry_after: Duration,
    },
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }
}

/// Admission decision keyed by an arbitrary string.
pub trait RateLimiter: Send + Sync + 'static {
    /// Decide for one request on `key`, spending a token when admitted.
    fn check(&self, key: &str) -> Decision;

    /// Advertised request budget per key, reported in `X-RateLimit-Limit`.
    fn limit(&self) -> u32;

    /// Shorthand for `check(key).is_admitted()`.
    fn allow(&self, key: &str) -> bool {
        self.check(key).is_admitted()
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn fresh(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity - 1.0,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant, rate: f64, capacity: f64) {
        // `now` is sampled before the shard lock, so a concurrent caller may
        // already have moved `last_refill` past it.
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(capacity);
        self.last_refill = self.last_refill.max(now);
    }

    fn try_spend(&mut self, now: Instant, rate: f64, capacity: f64) -> Decision {
        self.refill(now, rate, capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Decision::Admitted {
                remaining: whole_tokens(self.tokens),
            }
        } else {
            Decision::Rejected {
                retry_after: secs_to_duration((1.0 - self.tokens) / rate),
            }
        }
    }
}

/// Sharded token-bucket limiter.
pub struct TokenBucketLimiter<C: Clock = SystemClock> {
    rate: f64,
    capacity: u32,
    buckets: DashMap<String, Bucket>,
    clock: C,
}

impl TokenBucketLimiter<SystemClock> {
    /// Create a limiter on the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`LimiterConfigError`] when `rate` is not a positive finite
    /// number or `capacity` is zero.
    pub fn new(rate: f64, capacity: u32) -> Result<Self, LimiterConfigError> {
        Self::with_clock(rate, capacity, SystemClock)
    }
}

impl<C: Clock> TokenBucketLimiter<C> {
    /// Create a limiter reading time from `clock`.
    ///
    /// # Errors
    ///
    /// Same as [`TokenBucketLimiter::new`].
    pub fn with_clock(rate: f64, capacity: u32, clock: C) -> Result<Self, LimiterConfigError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(LimiterConfigError::InvalidRate(rate));
        }
        if capacity == 0 {
            return Err(LimiterConfigError::ZeroCapacity);
        }

        Ok(Self {
            rate,
            capacity,
            buckets: DashMap::new(),
            clock,
        })
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Maximum tokens per bucket.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Time an empty bucket needs to refill completely.
    pub fn full_refill_time(&self) -> Duration {
        secs_to_duration(f64::from(self.capacity) / self.rate)
    }

    /// Drop buckets idle for at least `max(ttl, full_refill_time())`.
    ///
    /// Returns the number of buckets removed.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let ttl = ttl.max(self.full_refill_time());
        let now = self.clock.now();
        let removed = AtomicUsize::new(0);

        self.buckets.retain(|_, bucket| {
            let keep = now.saturating_duration_since(bucket.last_refill) < ttl;
            if !keep {
                removed.fetch_add(1, Ordering::Relaxed);
            }
            keep
        });

        removed.into_inner()
    }
}

impl<C: Clock> RateLimiter for TokenBucketLimiter<C> {
    fn limit(&self) -> u32 {
        self.capacity
    }

    fn check(&self, key: &str) -> Decision {
        let now = self.clock.now();
        let capacity = f64::from(self.capacity);

        // Fast path: existing bucket, no key allocation.
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            return bucket.try_spend(now, self.rate, capacity);
        }

        match self.buckets.entry(key.to_owned()) {
            // Another caller created it between the two lookups.
            Entry::Occupied(mut occupied) => occupied.get_mut().try_spend(now, self.rate, capacity),
            Entry::Vacant(vacant) => {
                trace!(key, "Creating rate limit bucket");
                vacant.insert(Bucket::fresh(capacity, now));
                Decision::Admitted {
                    remaining: self.capacity - 1,
                }
            }
        }
    }
}

impl<C: Clock> fmt::Debug for TokenBucketLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("rate", &self.rate)
            .field("capacity", &self.capacity)
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

/// Periodically evict idle buckets until `cancel` fires.
///
/// Meant to be spawned on a task tracker owned by the application state.
pub async fn run_sweeper<C: Clock>(
    limiter: Arc<TokenBucketLimiter<C>>,
    interval: Duration,
    ttl: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // Skip the first immediate tick

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Bucket sweeper received cancellation signal");
                break;
            }
            _ = ticker.tick() => {
                let removed = limiter.evict_idle(ttl);
                let live = limiter.bucket_count();
                metrics::set_bucket_count(live);
                if removed > 0 {
                    debug!(removed, live, "Evicted idle rate limit buckets");
                }
            }
        }
    }

    debug!("Bucket sweeper shutting down");
}

fn whole_tokens(tokens: f64) -> u32 {
    // Truncation is intended: tokens is within [0, capacity] and capacity is a u32.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let whole = tokens.floor() as u32;
    whole
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn limiter(rate: f64, capacity: u32) -> (TokenBucketLimiter<MockClock>, MockClock) {
        let clock = MockClock::new();
        let limiter = TokenBucketLimiter::with_clock(rate, capacity, clock.clone()).unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_burst_bound() {
        let (limiter, _clock) = limiter(1.0, 5);

        for i in 0..5 {
            assert!(limiter.allow("client"), "call {i} should be admitted");
        }
        assert!(!limiter.allow("client"), "call 6 should be rejected");
    }

    #[test]
    fn test_refill_arithmetic() {
        let (limiter, clock) = limiter(2.0, 2);

        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));

        clock.advance(Duration::from_millis(500));
        assert!(limiter.allow("k"), "one token regenerated after 0.5s");
        assert!(!limiter.allow("k"), "second immediate call has no token");
    }

    #[test]
    fn test_spaced_calls_always_admitted() {
        let (limiter, clock) = limiter(4.0, 2);
        let spacing = limiter.full_refill_time();
        assert_eq!(spacing, Duration::from_millis(500));

        for _ in 0..20 {
            assert!(limiter.allow("steady"));
            clock.advance(spacing);
        }
    }

    #[test]
    fn test_tokens_never_exceed_capacity() {
        let (limiter, clock) = limiter(10.0, 3);
        assert!(limiter.allow("k"));

        clock.advance(Duration::from_secs(3600));
        for _ in 0..3 {
            assert!(limiter.allow("k"));
        }
        assert!(!limiter.allow("k"));
    }

    #[test]
    fn test_keys_are_isolated() {
        let (limiter, _clock) = limiter(1.0, 1);

        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn test_check_reports_remaining_and_retry_after() {
        let (limiter, _clock) = limiter(2.0, 3);

        assert_eq!(limiter.check("k"), Decision::Admitted { remaining: 2 });
        assert_eq!(limiter.check("k"), Decision::Admitted { remaining: 1 });
        assert_eq!(limiter.check("k"), Decision::Admitted { remaining: 0 });
        assert_eq!(
            limiter.check("k"),
            Decision::Rejected {
                retry_after: Duration::from_millis(500)
            }
        );
    }

    #[test]
    fn test_partial_refill_shortens_retry_after() {
        let (limiter, clock) = limiter(1.0, 1);
        assert!(limiter.allow("k"));

        clock.advance(Duration::from_millis(250));
        match limiter.check("k") {
            Decision::Rejected { retry_after } => {
                assert_eq!(retry_after, Duration::from_millis(750));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_capacity_one() {
        let (limiter, clock) = limiter(1.0, 1);
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        clock.advance(Duration::from_secs(1));
        assert!(limiter.allow("k"));
    }

    #[test]
    fn test_invalid_parameters() {
        assert_eq!(
            TokenBucketLimiter::new(0.0, 1).unwrap_err(),
            LimiterConfigError::InvalidRate(0.0)
        );
        assert_eq!(
            TokenBucketLimiter::new(-1.0, 1).unwrap_err(),
            LimiterConfigError::InvalidRate(-1.0)
        );
        assert!(matches!(
            TokenBucketLimiter::new(f64::NAN, 1),
            Err(LimiterConfigError::InvalidRate(_))
        ));
        assert!(matches!(
            TokenBucketLimiter::new(f64::INFINITY, 1),
            Err(LimiterConfigError::InvalidRate(_))
        ));
        assert_eq!(
            TokenBucketLimiter::new(1.0, 0).unwrap_err(),
            LimiterConfigError::ZeroCapacity
        );
    }

    #[test]
    fn test_concurrent_same_key_admits_exactly_capacity() {
        let (limiter, _clock) = limiter(1.0, 100);
        let admitted = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        if limiter.allow("hot") {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_concurrent_distinct_keys_do_not_interfere() {
        let (limiter, _clock) = limiter(1.0, 10);
        let admitted = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for t in 0..16 {
                let limiter = &limiter;
                let admitted = &admitted;
                scope.spawn(move || {
                    let key = format!("client-{t}");
                    for _ in 0..10 {
                        if limiter.allow(&key) {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), 160);
        assert_eq!(limiter.bucket_count(), 16);
    }

    #[test]
    fn test_evict_idle_respects_full_refill_floor() {
        let (limiter, clock) = limiter(1.0, 10);
        assert!(limiter.allow("k"));

        clock.advance(Duration::from_secs(5));
        assert_eq!(limiter.evict_idle(Duration::from_secs(1)), 0);

        clock.advance(Duration::from_secs(6));
        assert_eq!(limiter.evict_idle(Duration::from_secs(1)), 1);
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_evict_idle_keeps_active_buckets() {
        let (limiter, clock) = limiter(10.0, 1);
        assert!(limiter.allow("idle"));
        clock.advance(Duration::from_secs(60));
        assert!(limiter.allow("active"));

        assert_eq!(limiter.evict_idle(Duration::from_secs(30)), 1);
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[test]
    fn test_recreated_bucket_matches_full_bucket() {
        let (limiter, clock) = limiter(1.0, 3);
        for _ in 0..3 {
            assert!(limiter.allow("k"));
        }

        clock.advance(Duration::from_secs(10));
        assert_eq!(limiter.evict_idle(Duration::ZERO), 1);

        for _ in 0..3 {
            assert!(limiter.allow("k"));
        }
        assert!(!limiter.allow("k"));
    }

    #[test]
    fn test_full_refill_time_saturates() {
        let (limiter, _clock) = limiter(f64::MIN_POSITIVE, u32::MAX);
        assert_eq!(limiter.full_refill_time(), Duration::MAX);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let limiter = Arc::new(TokenBucketLimiter::new(1.0, 1).unwrap());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sweeper(
            limiter,
            Duration::from_millis(10),
            Duration::from_secs(60),
            cancel.clone(),
        ));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop promptly")
            .unwrap();
    }
}
