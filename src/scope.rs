//! Cancellation and deadline scope for one reconcile
//!
//! Every external call of a reconcile (credential exchange, list, create,
//! update, delete, describe) and every poll sleep runs through
//! [`CallScope::run`], so shutdown, resource deletion and the per-reconcile
//! timeout all interrupt it promptly.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Cancellation token plus absolute deadline
#[derive(Clone, Debug)]
pub struct CallScope {
    cancel: CancellationToken,
    deadline: Instant,
}

impl CallScope {
    /// Scope that ends when `cancel` fires or `timeout` elapses from now
    pub fn new(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + timeout,
        }
    }

    /// The token observed by this scope
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the scope has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `fut`, failing with an interruption error if the scope ends first
    ///
    /// Cancellation is checked before the deadline and before the call, so an
    /// already-cancelled scope never issues the call.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::cancelled(operation)),
            _ = tokio::time::sleep_until(self.deadline) => Err(Error::deadline_exceeded(operation)),
            result = fut => result,
        }
    }

    /// Sleep for `duration`, waking early with an error if the scope ends
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run("sleep", async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}
