//! Fault barrier: turn panics downstream into a 500 response.
//!
//! The barrier runs the rest of the chain inside `catch_unwind`. A panic in
//! any later stage or in the terminal handler is logged with the request's
//! method, path, client address, request id, panic message and the
//! backtrace of the panic site, then answered with a fixed internal error
//! body. The process and the serving task keep running.
//!
//! Unwinding has already finished by the time `catch_unwind` returns, so the
//! backtrace is taken earlier: constructing a barrier installs a panic hook
//! that records it in a thread-local slot on the panicking thread. The
//! deadline guard carries it over when a panic crosses from its inner task.
//!
//! Only stages *after* the barrier are covered, so it must be the first
//! stage of the chain. A panic in a stage placed before it is a
//! configuration error and unwinds into the server.
//!
//! By default the caller sees no detail. [`FaultBarrier::expose_detail`]
//! adds the panic message to the body's `error` field; use it for local
//! debugging only.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};

use axum::response::IntoResponse;
use futures::FutureExt;
use tracing::error;

use super::ip::{TrustedProxyConfig, client_ip};
use super::request_id::RequestIdExt;
use crate::error::Rejection;
use crate::metrics;
use crate::pipeline::{BoxFuture, Next, Request, Response, Stage};

thread_local! {
    static FAULT_BACKTRACE: Cell<Option<Backtrace>> = const { Cell::new(None) };
}

static BACKTRACE_HOOK: Once = Once::new();

/// Wrap the current panic hook so every panic records its backtrace.
///
/// The previous hook still runs afterwards. Idempotent.
pub fn install_backtrace_hook() {
    BACKTRACE_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            FAULT_BACKTRACE.with(|slot| slot.set(Some(Backtrace::force_capture())));
            previous(info);
        }));
    });
}

/// Take the backtrace of the last panic on this thread.
pub(crate) fn take_fault_backtrace() -> Option<Backtrace> {
    FAULT_BACKTRACE.with(Cell::take)
}

/// Put a backtrace captured on another thread back in this thread's slot,
/// before the panic is resumed here.
pub(crate) fn restore_fault_backtrace(backtrace: Option<Backtrace>) {
    FAULT_BACKTRACE.with(|slot| slot.set(backtrace));
}

/// Catches panics from the remainder of the chain.
#[derive(Debug, Clone)]
pub struct FaultBarrier {
    expose_detail: bool,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl Default for FaultBarrier {
    fn default() -> Self {
        install_backtrace_hook();
        Self {
            expose_detail: false,
            trusted_proxies: Arc::default(),
        }
    }
}

impl FaultBarrier {
    /// Barrier that hides fault details from callers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Include the panic message in the response body.
    pub fn expose_detail(mut self, expose: bool) -> Self {
        self.expose_detail = expose;
        self
    }

    /// Proxies trusted when logging the client address.
    pub fn trusted_proxies(mut self, trusted_proxies: Arc<TrustedProxyConfig>) -> Self {
        self.trusted_proxies = trusted_proxies;
        self
    }
}

impl Stage for FaultBarrier {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn process(&self, request: Request, next: Next) -> BoxFuture<Response> {
        let method = request.method().clone();
        let uri = request.uri().clone();
        let client_ip = client_ip(&request, &self.trusted_proxies);
        let request_id = request.request_id().map(str::to_owned);
        let expose_detail = self.expose_detail;

        Box::pin(async move {
            let outcome = AssertUnwindSafe(async move { next.run(request).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(response) => response,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    let backtrace = take_fault_backtrace()
                        .map_or_else(|| "unavailable".to_string(), |bt| bt.to_string());
                    metrics::record_fault_recovered();
                    error!(
                        method = %method,
                        uri = %uri,
                        client_ip = %client_ip,
                        request_id = request_id.as_deref().unwrap_or("-"),
                        panic = %message,
                        backtrace = %backtrace,
                        "Recovered from panic while handling request"
                    );

                    Rejection::InternalFault {
                        detail: expose_detail.then_some(message),
                    }
                    .into_response()
                }
            }
        })
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
