//! Streaming-response contract and the collecting sink.

use parking_lot::Mutex;

use super::context::Context;
use super::errors::DispatchError;

/// Sink for streamed dispatch responses.
///
/// Implementations must be safe for concurrent `send` calls; the dispatch
/// layer guarantees that only one producer's output is ever forwarded to a
/// given stream, but evaluators may fan work out internally.
pub trait DispatchStream<R>: Send + Sync {
    /// Appends a response to the stream.
    fn send(&self, response: R) -> Result<(), DispatchError>;

    /// The caller's context, observed for cancellation.
    fn context(&self) -> &Context;
}

/// A [`DispatchStream`] that materializes every received response, for
/// callers that want a slice rather than incremental delivery.
pub struct CollectingDispatchStream<R> {
    ctx: Context,
    results: Mutex<Vec<R>>,
}

impl<R> CollectingDispatchStream<R> {
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self { ctx, results: Mutex::new(Vec::new()) }
    }

    /// Snapshot of the responses received so far, in send order.
    #[must_use]
    pub fn results(&self) -> Vec<R>
    where
        R: Clone,
    {
        self.results.lock().clone()
    }

    /// Consumes the stream, returning the received responses.
    #[must_use]
    pub fn into_results(self) -> Vec<R> {
        self.results.into_inner()
    }
}

impl<R: Send> DispatchStream<R> for CollectingDispatchStream<R> {
    fn send(&self, response: R) -> Result<(), DispatchError> {
        self.ctx.check_active()?;
        self.results.lock().push(response);
        Ok(())
    }

    fn context(&self) -> &Context {
        &self.ctx
    }
}
