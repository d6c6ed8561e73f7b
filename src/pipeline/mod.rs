//! Stage composition model.
//!
//! A [`Chain`] is an ordered list of [`Stage`]s in front of a terminal
//! [`Handler`]. Each stage receives the request and a [`Next`] continuation;
//! calling [`Next::run`] hands the request to the following stage (or to the
//! terminal handler once the stages are exhausted). A stage that returns
//! without running `next` short-circuits the rest of the chain.
//!
//! ```text
//! Request → Stage 0 → Stage 1 → ... → Stage n-1 → Terminal
//!              │          │                │
//!              └── may return early ───────┘
//! ```
//!
//! # Concurrency
//!
//! A chain holds no per-request state. Stages are shared behind `Arc` and
//! invoked through `&self`, and every future they return is `'static`, so a
//! stage can move its continuation onto another task (the deadline guard does
//! exactly that). Any mutable state a stage needs (bucket maps, lockout
//! counters) is owned by the stage and synchronized internally.
//!
//! # Example
//!
//! ```rust,ignore
//! let chain = Chain::builder()
//!     .stage(FaultBarrier::new())
//!     .stage(RateLimitStage::by_client_ip(limiter, Arc::clone(&trusted)))
//!     .build(|_req: Request| async { StatusCode::OK.into_response() });
//!
//! let response = chain.invoke(request).await;
//! ```

mod layer;
mod signal;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub use layer::{ChainLayer, ChainService};
pub use signal::{Completion, OutcomeSignal, outcome_signal};

/// Request type flowing through the pipeline.
pub type Request = axum::extract::Request;

/// Response type produced by the pipeline.
pub type Response = axum::response::Response;

/// Boxed, sendable future returned by stages and handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// One link of the chain.
///
/// Implementations either call `next.run(request)` to continue, or build a
/// response themselves to short-circuit. `Next` is consumed by `run`, so a
/// stage cannot invoke the remainder of the chain twice.
pub trait Stage: Send + Sync + 'static {
    /// Stable name used in logs and [`Chain::stage_names`].
    fn name(&self) -> &'static str;

    /// Process `request`, optionally delegating to `next`.
    fn process(&self, request: Request, next: Next) -> BoxFuture<Response>;
}

/// Innermost continuation of a chain (the business logic).
pub trait Handler: Send + Sync + 'static {
    /// Produce the final response for `request`.
    fn call(&self, request: Request) -> BoxFuture<Response>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn call(&self, request: Request) -> BoxFuture<Response> {
        Box::pin((self)(request))
    }
}

impl<S: Stage + ?Sized> Stage for Arc<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn process(&self, request: Request, next: Next) -> BoxFuture<Response> {
        (**self).process(request, next)
    }
}

type Stages = Arc<[Arc<dyn Stage>]>;

/// Continuation handed to a stage: "the rest of the chain".
pub struct Next {
    stages: Stages,
    index: usize,
    terminal: Arc<dyn Handler>,
}

impl Next {
    pub(crate) fn new(stages: Stages, terminal: Arc<dyn Handler>) -> Self {
        Self {
            stages,
            index: 0,
            terminal,
        }
    }

    /// Run the remaining stages, then the terminal handler.
    pub fn run(self, request: Request) -> BoxFuture<Response> {
        match self.stages.get(self.index).cloned() {
            Some(stage) => {
                let next = Self {
                    stages: self.stages,
                    index: self.index + 1,
                    terminal: self.terminal,
                };
                stage.process(request, next)
            }
            None => self.terminal.call(request),
        }
    }

    /// Number of stages still ahead of the terminal handler.
    pub fn remaining(&self) -> usize {
        self.stages.len().saturating_sub(self.index)
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// An immutable, ordered stage list bound to a terminal handler.
///
/// Cloning is cheap and clones share the same stages.
#[derive(Clone)]
pub struct Chain {
    stages: Stages,
    terminal: Arc<dyn Handler>,
}

impl Chain {
    /// Start building a chain.
    pub fn builder() -> ChainBuilder {
        ChainBuilder::new()
    }

    /// Run `request` through every stage and the terminal handler.
    pub fn invoke(&self, request: Request) -> BoxFuture<Response> {
        Next::new(self.stages.clone(), self.terminal.clone()).run(request)
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Number of stages (the terminal handler is not counted).
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the chain has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("stages", &self.stage_names())
            .finish_non_exhaustive()
    }
}

/// Collects stages in order. Building has no side effects.
#[derive(Default)]
pub struct ChainBuilder {
    stages: Vec<Arc<dyn Stage>>,
}

impl ChainBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn stage<S: Stage>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Append an already shared stage.
    pub fn shared_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Append a stage only when `stage` is `Some`.
    pub fn optional_stage<S: Stage>(self, stage: Option<S>) -> Self {
        match stage {
            Some(stage) => self.stage(stage),
            None => self,
        }
    }

    /// Number of stages collected so far.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether no stage has been added.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Freeze the stage order and bind the terminal handler.
    pub fn build<H: Handler>(self, terminal: H) -> Chain {
        Chain {
            stages: self.stages.into(),
            terminal: Arc::new(terminal),
        }
    }

    /// Freeze the stage order as a tower layer; the wrapped service becomes
    /// the terminal handler.
    pub fn into_layer(self) -> ChainLayer {
        ChainLayer::new(self.stages.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{self, StatusCode};
    use axum::response::IntoResponse;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records its name in a shared trace, then continues.
    struct Recorder {
        name: &'static str,
        trace: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Stage for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn process(&self, request: Request, next: Next) -> BoxFuture<Response> {
            self.trace.lock().unwrap().push(self.name);
            next.run(request)
        }
    }

    /// Returns 403 without running `next`.
    struct Blocker;

    impl Stage for Blocker {
        fn name(&self) -> &'static str {
            "blocker"
        }

        fn process(&self, _request: Request, _next: Next) -> BoxFuture<Response> {
            Box::pin(async { StatusCode::FORBIDDEN.into_response() })
        }
    }

    fn counting_terminal(counter: Arc<AtomicUsize>) -> impl Handler {
        move |_req: Request| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                StatusCode::OK.into_response()
            }
        }
    }

    fn request(path: &str) -> Request {
        http::Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_stages_run_in_order_then_terminal() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        let chain = Chain::builder()
            .stage(Recorder {
                name: "first",
                trace: trace.clone(),
            })
            .stage(Recorder {
                name: "second",
                trace: trace.clone(),
            })
            .build(counting_terminal(counter.clone()));

        let response = chain.invoke(request("/")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*trace.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_terminal_and_later_stages() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        let chain = Chain::builder()
            .stage(Blocker)
            .stage(Recorder {
                name: "after",
                trace: trace.clone(),
            })
            .build(counting_terminal(counter.clone()));

        let response = chain.invoke(request("/")).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(trace.lock().unwrap().is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_runs_terminal() {
        let counter = Arc::new(AtomicUsize::new(0));
        let chain = Chain::builder().build(counting_terminal(counter.clone()));

        assert!(chain.is_empty());
        chain.invoke(request("/")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_build_has_no_side_effects() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        let chain = Chain::builder()
            .stage(Recorder {
                name: "only",
                trace: trace.clone(),
            })
            .build(counting_terminal(counter.clone()));

        assert_eq!(chain.stage_names(), vec!["only"]);
        assert!(trace.lock().unwrap().is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_optional_stage() {
        let builder = ChainBuilder::new()
            .optional_stage(Some(Blocker))
            .optional_stage(None::<Blocker>);
        assert_eq!(builder.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_invocations_are_independent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let chain = Chain::builder()
            .stage(Recorder {
                name: "shared",
                trace: Arc::new(Mutex::new(Vec::new())),
            })
            .build(|req: Request| async move {
                // Echo the path back so each caller can check it got its own response.
                req.uri().path().to_string().into_response()
            });

        let mut handles = Vec::new();
        for i in 0..32 {
            let chain = chain.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let path = format!("/req/{i}");
                let response = chain.invoke(request(&path)).await;
                let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                    .await
                    .unwrap();
                assert_eq!(body, path.as_bytes());
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_next_remaining() {
        let stages: Stages = vec![Arc::new(Blocker) as Arc<dyn Stage>].into();
        let terminal: Arc<dyn Handler> =
            Arc::new(|_req: Request| async { StatusCode::OK.into_response() });
        let next = Next::new(stages, terminal);
        assert_eq!(next.remaining(), 1);
    }
}
