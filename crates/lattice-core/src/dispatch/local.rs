//! In-process dispatch: the terminal recursion base.
//!
//! A [`LocalDispatcher`] hands requests to the permission-evaluation engine
//! (an [`Evaluator`], external to this crate) after enforcing the context
//! and depth invariants. Recursive sub-work the evaluator cannot answer
//! from a single relation walk is re-dispatched: either back into this same
//! dispatcher (local-only mode) or through a caller-supplied redispatcher
//! that may escape the process.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::debug;

use crate::types::{
    CheckRequest, CheckResponse, ExpandRequest, ExpandResponse, LookupResourcesRequest,
    LookupResourcesResponse, LookupSubjectsRequest, LookupSubjectsResponse, ReadyState,
};

use super::context::Context;
use super::errors::DispatchError;
use super::stream::DispatchStream;
use super::{check_depth_remaining, Dispatcher};

/// The permission-evaluation engine.
///
/// Evaluators interpret the schema and walk the relationship graph; this
/// crate treats them purely as request/response collaborators. Each method
/// receives a redispatcher for sub-work; evaluators must decrement
/// `depth_remaining` (see [`crate::types::ResolverMeta::for_redispatch`])
/// on every recursive dispatch they issue.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn check(
        &self,
        ctx: &Context,
        request: &CheckRequest,
        redispatch: &dyn Dispatcher,
    ) -> Result<CheckResponse, DispatchError>;

    async fn expand(
        &self,
        ctx: &Context,
        request: &ExpandRequest,
        redispatch: &dyn Dispatcher,
    ) -> Result<ExpandResponse, DispatchError>;

    async fn lookup_resources(
        &self,
        ctx: &Context,
        request: &LookupResourcesRequest,
        stream: &dyn DispatchStream<LookupResourcesResponse>,
        redispatch: &dyn Dispatcher,
    ) -> Result<(), DispatchError>;

    async fn lookup_subjects(
        &self,
        ctx: &Context,
        request: &LookupSubjectsRequest,
        stream: &dyn DispatchStream<LookupSubjectsResponse>,
        redispatch: &dyn Dispatcher,
    ) -> Result<(), DispatchError>;
}

enum RedispatchTarget {
    /// Recursion terminates in this process: sub-dispatches come back here.
    Itself(Weak<LocalDispatcher>),
    /// Sub-dispatches go through an outer dispatcher (typically a cluster
    /// dispatcher that may route them to peers).
    External(Arc<dyn Dispatcher>),
}

/// Resolves dispatch requests in-process against an [`Evaluator`].
pub struct LocalDispatcher {
    evaluator: Arc<dyn Evaluator>,
    redispatch: RedispatchTarget,
}

impl LocalDispatcher {
    /// A dispatcher with no cluster peers: recursive sub-dispatches loop
    /// back into this same instance.
    #[must_use]
    pub fn new_local_only(evaluator: Arc<dyn Evaluator>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            evaluator,
            redispatch: RedispatchTarget::Itself(weak.clone()),
        })
    }

    /// A dispatcher whose recursive sub-dispatches go through the given
    /// redispatcher, allowing sub-work to escape the process.
    #[must_use]
    pub fn with_redispatcher(
        evaluator: Arc<dyn Evaluator>,
        redispatcher: Arc<dyn Dispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self { evaluator, redispatch: RedispatchTarget::External(redispatcher) })
    }

    fn redispatcher(&self) -> Result<Arc<dyn Dispatcher>, DispatchError> {
        match &self.redispatch {
            RedispatchTarget::Itself(weak) => match weak.upgrade() {
                Some(this) => Ok(this),
                None => Err(DispatchError::Internal("dispatcher has been dropped".into())),
            },
            RedispatchTarget::External(outer) => Ok(Arc::clone(outer)),
        }
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn dispatch_check(
        &self,
        ctx: &Context,
        request: CheckRequest,
    ) -> Result<CheckResponse, DispatchError> {
        ctx.check_active()?;
        check_depth_remaining(&request.metadata)?;

        debug!(
            resource = %request.resource_relation,
            subject = %request.subject,
            depth_remaining = request.metadata.depth_remaining,
            "evaluating check locally"
        );
        let redispatch = self.redispatcher()?;
        self.evaluator.check(ctx, &request, redispatch.as_ref()).await
    }

    async fn dispatch_expand(
        &self,
        ctx: &Context,
        request: ExpandRequest,
    ) -> Result<ExpandResponse, DispatchError> {
        ctx.check_active()?;
        check_depth_remaining(&request.metadata)?;

        let redispatch = self.redispatcher()?;
        self.evaluator.expand(ctx, &request, redispatch.as_ref()).await
    }

    async fn dispatch_lookup_resources(
        &self,
        ctx: &Context,
        request: LookupResourcesRequest,
        stream: &dyn DispatchStream<LookupResourcesResponse>,
    ) -> Result<(), DispatchError> {
        ctx.check_active()?;
        check_depth_remaining(&request.metadata)?;

        debug!(
            resource = %request.resource_relation,
            subjects = request.subject_ids.len(),
            "evaluating lookup-resources locally"
        );
        let redispatch = self.redispatcher()?;
        self.evaluator
            .lookup_resources(ctx, &request, stream, redispatch.as_ref())
            .await
    }

    async fn dispatch_lookup_subjects(
        &self,
        ctx: &Context,
        request: LookupSubjectsRequest,
        stream: &dyn DispatchStream<LookupSubjectsResponse>,
    ) -> Result<(), DispatchError> {
        ctx.check_active()?;
        check_depth_remaining(&request.metadata)?;

        let redispatch = self.redispatcher()?;
        self.evaluator
            .lookup_subjects(ctx, &request, stream, redispatch.as_ref())
            .await
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::ready()
    }

    async fn close(&self) {}
}
