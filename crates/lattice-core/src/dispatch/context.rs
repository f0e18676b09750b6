//! Request context: cancellation and deadline propagation.
//!
//! Every dispatch operation observes a [`Context`]. Cancellation fans out
//! through child tokens, so cancelling a request context immediately cancels
//! all in-flight peer calls derived from it. Deadlines only tighten: a child
//! context's deadline is never later than its parent's.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::errors::DispatchError;

/// A cancellable context with an optional deadline.
///
/// Cheap to clone; clones share the same cancellation state. Use
/// [`Context::child`] (or the deadline-deriving constructors) to create a
/// scope that can be cancelled without cancelling the parent.
#[derive(Debug, Clone)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A root context with no deadline that is never cancelled unless
    /// [`Context::cancel`] is called.
    #[must_use]
    pub fn background() -> Self {
        Self { cancel: CancellationToken::new(), deadline: None }
    }

    /// Derives a child context; cancelling the parent cancels the child,
    /// but not vice versa.
    #[must_use]
    pub fn child(&self) -> Self {
        Self { cancel: self.cancel.child_token(), deadline: self.deadline }
    }

    /// Derives a child context whose deadline is the earlier of the
    /// parent's deadline and `now + timeout`.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a child context with the given deadline, tightened against
    /// the parent's deadline if the parent has an earlier one.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let effective = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self { cancel: self.cancel.child_token(), deadline: Some(effective) }
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time until the deadline, if one is set. Returns zero once the
    /// deadline has passed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fails fast if the context is already done.
    ///
    /// Dispatch operations call this before doing any work so that an
    /// already-cancelled or already-expired context never produces results.
    pub fn check_active(&self) -> Result<(), DispatchError> {
        if self.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(DispatchError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Resolves when the context is done, yielding the error that describes
    /// why. Never resolves for a deadline-less, uncancelled context.
    pub async fn done(&self) -> DispatchError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.cancel.cancelled() => DispatchError::Cancelled,
                    () = tokio::time::sleep_until(deadline) => DispatchError::DeadlineExceeded,
                }
            }
            None => {
                self.cancel.cancelled().await;
                DispatchError::Cancelled
            }
        }
    }
}
