//! Peer dispatch client contract.
//!
//! The cluster dispatcher talks to its primary and secondaries through
//! [`DispatchClient`]. The wire transport implements it over framed TCP
//! ([`crate::wire::client::WireDispatchClient`]); tests implement it
//! in-process.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::types::{
    CheckRequest, CheckResponse, ExpandRequest, ExpandResponse, LookupResourcesRequest,
    LookupResourcesResponse, LookupSubjectsRequest, LookupSubjectsResponse,
};

use super::context::Context;
use super::errors::DispatchError;

/// Streamed responses from a peer, delivered in emission order. The stream
/// terminates with `None` on clean completion or yields a single `Err`
/// after which no further items are produced.
pub type ResponseStream<T> =
    Pin<Box<dyn Stream<Item = Result<T, DispatchError>> + Send + 'static>>;

/// A remote dispatcher endpoint.
///
/// Handles are shared by reference across dispatch requests and must be
/// safe for concurrent use. Dropping a returned [`ResponseStream`] cancels
/// the corresponding peer work.
#[async_trait]
pub trait DispatchClient: Send + Sync {
    async fn check(
        &self,
        ctx: &Context,
        request: CheckRequest,
    ) -> Result<CheckResponse, DispatchError>;

    async fn expand(
        &self,
        ctx: &Context,
        request: ExpandRequest,
    ) -> Result<ExpandResponse, DispatchError>;

    async fn lookup_resources(
        &self,
        ctx: &Context,
        request: LookupResourcesRequest,
    ) -> Result<ResponseStream<LookupResourcesResponse>, DispatchError>;

    async fn lookup_subjects(
        &self,
        ctx: &Context,
        request: LookupSubjectsRequest,
    ) -> Result<ResponseStream<LookupSubjectsResponse>, DispatchError>;

    /// Whether the underlying connection is believed healthy.
    fn is_ready(&self) -> bool;

    /// Releases the underlying connection. Default: nothing to release.
    fn close(&self) {}
}

/// A named secondary peer the cluster dispatcher may hedge against.
#[derive(Clone)]
pub struct SecondaryDispatch {
    pub name: String,
    pub client: Arc<dyn DispatchClient>,
}

impl SecondaryDispatch {
    pub fn new(name: impl Into<String>, client: Arc<dyn DispatchClient>) -> Self {
        Self { name: name.into(), client }
    }
}

impl std::fmt::Debug for SecondaryDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryDispatch")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
