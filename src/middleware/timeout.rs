//! Deadline guard: bound the time the rest of the chain may take.
//!
//! # How It Works
//!
//! ```text
//!  guard task                         inner task (spawned)
//!  ──────────                         ────────────────────
//!  spawn ───────────────────────────▶ next.run(request)
//!  select! {                                 │
//!    signal  ◀──── complete(outcome) ────────┘
//!    sleep(budget)
//!  }
//! ```
//!
//! The rest of the chain runs on its own task and reports back through a
//! one-shot [`OutcomeSignal`](crate::pipeline::OutcomeSignal). Whichever of
//! {signal, timer} resolves first decides the response:
//!
//! - **Completion first**: the inner response is returned unchanged.
//! - **Timer first**: 408 is returned at once and the signal is dropped. The
//!   inner task keeps running unless aborting is enabled; when it finishes,
//!   its `complete` call is refused and the result is discarded. The response
//!   is moved through the signal, so the late result can never reach the
//!   caller.
//!
//! # Cancellation
//!
//! Forcible termination is off by default. Instead, a [`Deadline`] is placed
//! in the request extensions; its token is cancelled as soon as the guard
//! stops waiting (timeout or caller gone). Handlers doing long work should
//! watch it:
//!
//! ```rust,ignore
//! async fn handler(req: Request) -> Response {
//!     let deadline = req.deadline().cloned();
//!     tokio::select! {
//!         out = expensive() => out.into_response(),
//!         _ = async { if let Some(d) = &deadline { d.cancelled().await } else { std::future::pending().await } } => {
//!             StatusCode::REQUEST_TIMEOUT.into_response()
//!         }
//!     }
//! }
//! ```
//!
//! With `abort_on_timeout` the inner task is aborted at its next await
//! point instead. Abandoned tasks that keep running are counted in the
//! `turnstile_abandoned_tasks` gauge.
//!
//! # Client Timeouts
//!
//! Clients may ask for a shorter budget with `X-Request-Timeout: <ms>`.
//! Values outside `MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS` are
//! ignored, and the header can only shorten the configured budget.
//!
//! # Faults
//!
//! A panic in the inner task is caught there, carried across the signal and
//! re-raised on the guard's task, so an outer fault barrier still sees it.
//! The backtrace recorded at the panic site travels with it.
//!
//! Spawned tasks run inside the caller's span, so logs emitted behind the
//! guard keep the request's span fields.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, warn};

use super::recovery::{restore_fault_backtrace, take_fault_backtrace};
use crate::error::Rejection;
use crate::metrics;
use crate::pipeline::{BoxFuture, Next, Request, Response, Stage, outcome_signal};

/// Minimum client-requested timeout (100ms).
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 100;

/// Maximum client-requested timeout (5 minutes).
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 300_000;

/// Header name for client-specified request timeout.
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout";

/// Stand-in expiry for budgets too large to represent (about 30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Client-requested timeout parsed from `X-Request-Timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeout {
    /// The requested duration.
    pub duration: Duration,
}

impl RequestTimeout {
    /// `None` if `ms` is outside the allowed range.
    pub fn from_millis(ms: u64) -> Option<Self> {
        if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&ms) {
            return None;
        }
        Some(Self {
            duration: Duration::from_millis(ms),
        })
    }

    /// Parse the header, ignoring missing or invalid values.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(REQUEST_TIMEOUT_HEADER)?.to_str().ok()?;
        let Ok(ms) = value.trim().parse::<u64>() else {
            debug!(value, "Invalid X-Request-Timeout header value, ignoring");
            return None;
        };
        let timeout = Self::from_millis(ms);
        if timeout.is_none() {
            debug!(
                timeout_ms = ms,
                min = MIN_REQUEST_TIMEOUT_MS,
                max = MAX_REQUEST_TIMEOUT_MS,
                "Client timeout outside allowed range, ignoring"
            );
        }
        timeout
    }
}

/// Time budget of the current request, available to downstream stages and
/// handlers through the request extensions.
#[derive(Debug, Clone)]
pub struct Deadline {
    expires_at: Instant,
    budget: Duration,
    token: CancellationToken,
}

impl Deadline {
    fn new(budget: Duration, token: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            expires_at: now.checked_add(budget).unwrap_or(now + FAR_FUTURE),
            budget,
            token,
        }
    }

    /// Total budget granted to the request.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left before the guard gives up.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Whether the guard has stopped waiting for this request.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the guard stops waiting.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// The underlying token, for handing to child tasks.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Read the [`Deadline`] attached by the guard.
pub trait DeadlineExt {
    /// The request's deadline, if a guard is installed upstream.
    fn deadline(&self) -> Option<&Deadline>;
}

impl<B> DeadlineExt for axum::http::Request<B> {
    fn deadline(&self) -> Option<&Deadline> {
        self.extensions().get::<Deadline>()
    }
}

/// Races the rest of the chain against a timer.
#[derive(Debug, Clone)]
pub struct DeadlineGuard {
    timeout: Duration,
    abort_on_timeout: bool,
    honor_client_timeout: bool,
    tracker: TaskTracker,
}

impl DeadlineGuard {
    /// Guard with a fixed budget. Abandoned tasks keep running.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            abort_on_timeout: false,
            honor_client_timeout: true,
            tracker: TaskTracker::new(),
        }
    }

    /// Abort the inner task when the deadline fires.
    pub fn abort_on_timeout(mut self, abort: bool) -> Self {
        self.abort_on_timeout = abort;
        self
    }

    /// Let `X-Request-Timeout` shorten the budget (on by default).
    pub fn honor_client_timeout(mut self, honor: bool) -> Self {
        self.honor_client_timeout = honor;
        self
    }

    /// Spawn inner tasks on `tracker`, so shutdown can wait for them.
    pub fn with_tracker(mut self, tracker: TaskTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Configured budget.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Budget for `request`: the configured one, or a shorter client value.
    pub fn effective_timeout(&self, request: &Request) -> Duration {
        if !self.honor_client_timeout {
            return self.timeout;
        }
        match RequestTimeout::from_headers(request.headers()) {
            Some(client) => client.duration.min(self.timeout),
            None => self.timeout,
        }
    }
}

impl Stage for DeadlineGuard {
    fn name(&self) -> &'static str {
        "deadline"
    }

    fn process(&self, mut request: Request, next: Next) -> BoxFuture<Response> {
        let budget = self.effective_timeout(&request);
        let token = CancellationToken::new();
        request
            .extensions_mut()
            .insert(Deadline::new(budget, token.clone()));

        let method = request.method().clone();
        let path = request.uri().path().to_owned();

        let (completion, mut signal) = outcome_signal();
        let inner = self.tracker.spawn({
            let path = path.clone();
            async move {
                // Build the future inside the unwind scope so panics raised
                // while constructing it are caught too.
                let outcome = AssertUnwindSafe(async move { next.run(request).await })
                    .catch_unwind()
                    .await
                    .map_err(|panic| (panic, take_fault_backtrace()));

                if let Err(late) = completion.complete(outcome) {
                    metrics::record_late_completion();
                    match late {
                        Ok(response) => debug!(
                            path = %path,
                            status = response.status().as_u16(),
                            "Discarding response completed after deadline"
                        ),
                        Err(_) => warn!(path = %path, "Abandoned request panicked after deadline"),
                    }
                }
            }
            .in_current_span()
        });

        let abort = self.abort_on_timeout;
        let tracker = self.tracker.clone();

        Box::pin(async move {
            // Cancel on every exit, including the caller dropping this future.
            let _cancel_on_exit = token.drop_guard();

            tokio::select! {
                biased;

                outcome = &mut signal => match outcome {
                    Some(Ok(response)) => response,
                    Some(Err((panic, backtrace))) => {
                        restore_fault_backtrace(backtrace);
                        std::panic::resume_unwind(panic)
                    }
                    None => {
                        error!(method = %method, path = %path, "Inner task ended without an outcome");
                        Rejection::InternalFault { detail: None }.into_response()
                    }
                },
                _ = tokio::time::sleep(budget) => {
                    drop(signal);
                    metrics::record_deadline_exceeded();
                    warn!(
                        method = %method,
                        path = %path,
                        timeout_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
                        aborted = abort,
                        "Request deadline exceeded"
                    );

                    if abort {
                        inner.abort();
                    } else {
                        metrics::increment_abandoned_tasks();
                        tracker.spawn(
                            async move {
                                let _ = inner.await;
                                metrics::decrement_abandoned_tasks();
                            }
                            .in_current_span(),
                        );
                    }

                    Rejection::DeadlineExceeded.into_response()
                }
            }
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
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn request() -> Request {
        http::Request::builder().uri("/work").body(Body::empty()).unwrap()
    }

    fn sleeping_chain(guard: DeadlineGuard, sleep: Duration, done: Arc<AtomicBool>) -> Chain {
        Chain::builder().stage(guard).build(move |_req: Request| {
            let done = done.clone();
            async move {
                tokio::time::sleep(sleep).await;
                done.store(true, Ordering::SeqCst);
                StatusCode::OK.into_response()
            }
        })
    }

    #[tokio::test]
    async fn test_fast_inner_returns_its_response() {
        let done = Arc::new(AtomicBool::new(false));
        let chain = sleeping_chain(
            DeadlineGuard::new(Duration::from_secs(1)),
            Duration::from_millis(10),
            done.clone(),
        );

        let response = chain.invoke(request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_inner_times_out_and_keeps_running() {
        let done = Arc::new(AtomicBool::new(false));
        let tracker = TaskTracker::new();
        let chain = sleeping_chain(
            DeadlineGuard::new(Duration::from_millis(100)).with_tracker(tracker.clone()),
            Duration::from_millis(200),
            done.clone(),
        );

        let started = Instant::now();
        let response = chain.invoke(request()).await;
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(!done.load(Ordering::SeqCst));

        // The abandoned work still finishes, without touching the response.
        tracker.close();
        tracker.wait().await;
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_on_timeout_stops_inner() {
        let done = Arc::new(AtomicBool::new(false));
        let tracker = TaskTracker::new();
        let chain = sleeping_chain(
            DeadlineGuard::new(Duration::from_millis(100))
                .abort_on_timeout(true)
                .with_tracker(tracker.clone()),
            Duration::from_millis(200),
            done.clone(),
        );

        let response = chain.invoke(request()).await;
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

        tracker.close();
        tracker.wait().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!done.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_token_cancelled_on_timeout() {
        let observed = Arc::new(AtomicBool::new(false));
        let seen = observed.clone();
        let tracker = TaskTracker::new();

        let chain = Chain::builder()
            .stage(DeadlineGuard::new(Duration::from_millis(100)).with_tracker(tracker.clone()))
            .build(move |req: Request| {
                let seen = seen.clone();
                async move {
                    let deadline = req.deadline().cloned().unwrap();
                    assert_eq!(deadline.budget(), Duration::from_millis(100));
                    deadline.cancelled().await;
                    seen.store(true, Ordering::SeqCst);
                    StatusCode::OK.into_response()
                }
            });

        let response = chain.invoke(request()).await;
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

        tracker.close();
        tracker.wait().await;
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_header_shortens_budget() {
        let done = Arc::new(AtomicBool::new(false));
        let chain = sleeping_chain(
            DeadlineGuard::new(Duration::from_secs(30)),
            Duration::from_secs(1),
            done,
        );

        let response = chain
            .invoke(
                http::Request::builder()
                    .uri("/work")
                    .header(REQUEST_TIMEOUT_HEADER, "200")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn test_client_header_never_extends_budget() {
        let guard = DeadlineGuard::new(Duration::from_millis(500));
        let req = http::Request::builder()
            .header(REQUEST_TIMEOUT_HEADER, "60000")
            .body(Body::empty())
            .unwrap();
        assert_eq!(guard.effective_timeout(&req), Duration::from_millis(500));

        let ignored = guard.clone().honor_client_timeout(false);
        let req = http::Request::builder()
            .header(REQUEST_TIMEOUT_HEADER, "150")
            .body(Body::empty())
            .unwrap();
        assert_eq!(ignored.effective_timeout(&req), Duration::from_millis(500));
        assert_eq!(guard.effective_timeout(&req), Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_inner_panic_is_reraised() {
        let chain = Chain::builder()
            .stage(DeadlineGuard::new(Duration::from_secs(1)))
            .build(|req: Request| async move {
                if req.uri().path() == "/work" {
                    panic!("inner failure");
                }
                StatusCode::OK.into_response()
            });

        let result = AssertUnwindSafe(chain.invoke(request())).catch_unwind().await;
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"inner failure"));
    }

    #[derive(Clone)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_inner_logs_keep_request_span() {
        let buffer = LogBuffer(Arc::default());
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let chain = Chain::builder()
            .stage(DeadlineGuard::new(Duration::from_secs(1)))
            .build(|_req: Request| async {
                tracing::info!("handled behind guard");
                StatusCode::OK.into_response()
            });

        let span = tracing::info_span!("http_request", request_id = "req-42");
        let response = async { chain.invoke(request()).await }
            .instrument(span)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let line = output
            .lines()
            .find(|line| line.contains("handled behind guard"))
            .unwrap();
        assert!(line.contains("http_request"), "{line}");
        assert!(line.contains("req-42"), "{line}");
    }

    #[test]
    fn test_request_timeout_bounds() {
        assert!(RequestTimeout::from_millis(0).is_none());
        assert!(RequestTimeout::from_millis(MIN_REQUEST_TIMEOUT_MS - 1).is_none());
        assert!(RequestTimeout::from_millis(MAX_REQUEST_TIMEOUT_MS + 1).is_none());
        assert_eq!(
            RequestTimeout::from_millis(MIN_REQUEST_TIMEOUT_MS).unwrap().duration,
            Duration::from_millis(MIN_REQUEST_TIMEOUT_MS)
        );
    }

    #[test]
    fn test_request_timeout_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(RequestTimeout::from_headers(&headers).is_none());

        headers.insert(REQUEST_TIMEOUT_HEADER, " 5000 ".parse().unwrap());
        assert_eq!(
            RequestTimeout::from_headers(&headers).unwrap().duration,
            Duration::from_secs(5)
        );

        headers.insert(REQUEST_TIMEOUT_HEADER, "soon".parse().unwrap());
        assert!(RequestTimeout::from_headers(&headers).is_none());
    }
}
