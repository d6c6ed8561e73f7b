//! One-shot completion signal between a detached inner task and the stage
//! waiting on it.
//!
//! The producer side ([`Completion`]) is consumed by [`Completion::complete`],
//! so it can deliver at most one outcome. If the consumer ([`OutcomeSignal`])
//! has already given up and been dropped, the delivery is refused and handed
//! back to the producer, which makes a late write detectable instead of
//! silently racing the response that was already returned.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

/// Create a connected producer/consumer pair.
pub fn outcome_signal<T>() -> (Completion<T>, OutcomeSignal<T>) {
    let (tx, rx) = oneshot::channel();
    (Completion { tx }, OutcomeSignal { rx })
}

/// Producer half. Owned by the task doing the work.
#[derive(Debug)]
pub struct Completion<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Completion<T> {
    /// Deliver the outcome.
    ///
    /// Returns `Err(outcome)` when the waiting side is gone, i.e. the write
    /// lost the race and must be discarded by the caller.
    pub fn complete(self, outcome: T) -> Result<(), T> {
        self.tx.send(outcome)
    }

    /// Whether the waiting side has already been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the waiting side is dropped.
    pub async fn abandoned(&mut self) {
        self.tx.closed().await;
    }
}

/// Consumer half. Resolves to `Some(outcome)` on delivery, or `None` if the
/// producer was dropped without completing (task aborted or torn down).
#[derive(Debug)]
pub struct OutcomeSignal<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for OutcomeSignal<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivered_outcome_is_received() {
        let (completion, signal) = outcome_signal();
        assert!(completion.complete(7).is_ok());
        assert_eq!(signal.await, Some(7));
    }

    #[tokio::test]
    async fn test_late_completion_is_refused() {
        let (completion, signal) = outcome_signal::<&str>();
        drop(signal);

        assert!(completion.is_abandoned());
        assert_eq!(completion.complete("late"), Err("late"));
    }

    #[tokio::test]
    async fn test_dropped_producer_yields_none() {
        let (completion, signal) = outcome_signal::<u8>();
        drop(completion);
        assert_eq!(signal.await, None);
    }

    #[tokio::test]
    async fn test_abandoned_resolves_when_consumer_drops() {
        let (mut completion, signal) = outcome_signal::<u8>();
        let waiter = tokio::spawn(async move {
            completion.abandoned().await;
            completion.is_abandoned()
        });
        drop(signal);
        assert!(waiter.await.unwrap());
    }
}
