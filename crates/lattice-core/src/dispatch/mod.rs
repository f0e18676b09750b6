//! Permission-query dispatch: contracts, local resolution, and cluster
//! fan-out.
//!
//! This module is the heart of the crate. A [`Dispatcher`] resolves
//! permission queries (check, expand, lookup-resources, lookup-subjects)
//! either in-process ([`LocalDispatcher`]) or by routing to peers
//! ([`ClusterDispatcher`]), with hedged secondaries, resumable cursors, and
//! depth/timeout/cancellation enforcement.
//!
//! # Request Flow
//!
//! ```text
//! Service Layer
//!       │
//!       ▼
//! ┌──────────────────┐     expression says hedge?
//! │ ClusterDispatcher│ ──────────────┬──────────────┐
//! └────────┬─────────┘               │              │
//!          ▼                         ▼              ▼
//!      primary peer             secondary A    secondary B
//!          │                         │              │
//!          └────── first-to-emit race wins ─────────┘
//!                            │
//!                            ▼
//!                   caller's DispatchStream
//! ```
//!
//! Streaming continuations are pinned to the peer that produced them via a
//! routing tag on the cursor (see [`cursor`]).

pub mod client;
pub mod cluster;
pub mod context;
pub mod cursor;
pub mod errors;
pub mod expression;
pub mod keys;
pub mod local;
pub mod stream;

use async_trait::async_trait;

use crate::types::{
    CheckRequest, CheckResponse, ExpandRequest, ExpandResponse, LookupResourcesRequest,
    LookupResourcesResponse, LookupSubjectsRequest, LookupSubjectsResponse, ReadyState,
    ResolverMeta,
};

pub use client::{DispatchClient, ResponseStream, SecondaryDispatch};
pub use cluster::{ClusterDispatcher, ClusterDispatcherConfig};
pub use context::Context;
pub use errors::{DispatchError, ErrorKind};
pub use expression::{parse_dispatch_expression, DispatchExpr, ExpressionError, RequestKind};
pub use keys::{DirectKeyHandler, DispatchKey, KeyHandler};
pub use local::{Evaluator, LocalDispatcher};
pub use stream::{CollectingDispatchStream, DispatchStream};

/// Resolves dispatched permission queries.
///
/// Implementations are safe for concurrent use; all per-request state lives
/// on the call stack. Streaming operations deliver responses to the
/// caller-owned stream in producer emission order.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch_check(
        &self,
        ctx: &Context,
        request: CheckRequest,
    ) -> Result<CheckResponse, DispatchError>;

    async fn dispatch_expand(
        &self,
        ctx: &Context,
        request: ExpandRequest,
    ) -> Result<ExpandResponse, DispatchError>;

    async fn dispatch_lookup_resources(
        &self,
        ctx: &Context,
        request: LookupResourcesRequest,
        stream: &dyn DispatchStream<LookupResourcesResponse>,
    ) -> Result<(), DispatchError>;

    async fn dispatch_lookup_subjects(
        &self,
        ctx: &Context,
        request: LookupSubjectsRequest,
        stream: &dyn DispatchStream<LookupSubjectsResponse>,
    ) -> Result<(), DispatchError>;

    /// Whether this dispatcher can currently serve requests.
    fn ready_state(&self) -> ReadyState;

    /// Releases peer connections. Subsequent dispatches fail.
    async fn close(&self);
}

/// Fails with a depth-exceeded error if the request arrived with an
/// exhausted recursion budget. Every dispatcher applies this on receipt,
/// before any evaluation or routing.
pub fn check_depth_remaining(metadata: &ResolverMeta) -> Result<(), DispatchError> {
    if metadata.depth_remaining == 0 {
        return Err(DispatchError::DepthExceeded);
    }
    Ok(())
}
