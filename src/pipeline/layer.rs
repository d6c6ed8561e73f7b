//! Tower adapter: mount a stage list in front of any service.
//!
//! ```rust,ignore
//! let router = Router::new()
//!     .route("/data", get(handler))
//!     .layer(Chain::builder().stage(FaultBarrier::new()).into_layer());
//! ```
//!
//! The wrapped service becomes the chain's terminal handler. Each request
//! drives a clone of it through `oneshot`, so readiness is checked per call
//! and `poll_ready` on the layer itself is always ready.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Layer, Service, ServiceExt};

use super::{BoxFuture, Handler, Next, Request, Response, Stages};

/// Layer produced by [`ChainBuilder::into_layer`](super::ChainBuilder::into_layer).
#[derive(Clone)]
pub struct ChainLayer {
    stages: Stages,
}

impl ChainLayer {
    pub(crate) fn new(stages: Stages) -> Self {
        Self { stages }
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

impl<S> Layer<S> for ChainLayer
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Service = ChainService;

    fn layer(&self, inner: S) -> Self::Service {
        ChainService {
            stages: self.stages.clone(),
            terminal: Arc::new(ServiceHandler(inner)),
        }
    }
}

/// Service wrapper running the stages, then the inner service.
#[derive(Clone)]
pub struct ChainService {
    stages: Stages,
    terminal: Arc<dyn Handler>,
}

impl Service<Request> for ChainService {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let next = Next::new(self.stages.clone(), self.terminal.clone());
        Box::pin(async move { Ok(next.run(req).await) })
    }
}

/// Terminal handler backed by a tower service.
struct ServiceHandler<S>(S);

impl<S> Handler for ServiceHandler<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    fn call(&self, request: Request) -> BoxFuture<Response> {
        let service = self.0.clone();
        Box::pin(async move {
            match service.oneshot(request).await {
                Ok(response) => response,
                Err(never) => match never {},
            }
        })
    }
}
