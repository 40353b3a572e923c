//! Per-operation deadline and cancellation handle.
//!
//! Every public entry point that performs I/O takes a [`Context`] and checks
//! it before each blocking operation; suspension points are raced against it
//! through [`Context::run`].

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Deadline/cancel signal passed through each operation.
///
/// Cloning is cheap; clones share the cancellation token, so cancelling one
/// cancels them all.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Context {
    /// A context with no deadline and no cancellation.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: CancellationToken::new(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel every operation using this context or a clone of it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|at| Instant::now() >= at)
    }

    /// Fail fast if the context has already fired.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(Error::Canceled);
        }
        if self.is_expired() {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves with the terminating error once the context fires. Pends
    /// forever on a background context.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(at) => tokio::select! {
                _ = self.cancel.cancelled() => Error::Canceled,
                _ = tokio::time::sleep_until(at) => Error::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                Error::Canceled
            }
        }
    }

    /// Race `fut` against the deadline and the cancel signal.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    #[tokio::test]
    async fn background_runs_to_completion() {
        let ctx = Context::background();
        let out = ctx.run(async { 7 }).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn expired_deadline_fails_before_polling() {
        let ctx = Context::with_timeout(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(ctx.is_expired());
        match ctx.run(pending::<()>()).await {
            Err(Error::DeadlineExceeded) => {}
            other => panic!("expected DeadlineExceeded, got {:?}", other.err()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_a_pending_operation() {
        let ctx = Context::with_timeout(Duration::from_secs(1));
        match ctx.run(pending::<()>()).await {
            Err(Error::DeadlineExceeded) => {}
            other => panic!("expected DeadlineExceeded, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn cancel_interrupts_and_propagates_to_clones() {
        let ctx = Context::background();
        let clone = ctx.clone();
        ctx.cancel();
        assert!(clone.is_canceled());
        match clone.run(pending::<()>()).await {
            Err(Error::Canceled) => {}
            other => panic!("expected Canceled, got {:?}", other.err()),
        }
    }
}
