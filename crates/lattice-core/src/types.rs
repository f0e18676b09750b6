//! Core type definitions for dispatch requests, responses, and cursors.
//!
//! # Type Categories
//!
//! ## Graph references
//! - [`RelationReference`]: a `namespace#relation` pair
//! - [`ObjectAndRelation`]: a concrete `namespace:object_id#relation` subject
//!
//! ## Dispatch protocol types
//! - [`CheckRequest`]/[`CheckResponse`], [`ExpandRequest`]/[`ExpandResponse`]
//! - [`LookupResourcesRequest`]/[`LookupResourcesResponse`]
//! - [`LookupSubjectsRequest`]/[`LookupSubjectsResponse`]
//! - [`ResolverMeta`], [`ResponseMeta`], [`Cursor`]
//!
//! All protocol types are serde-serializable; they are the payloads of the
//! length-delimited peer wire protocol in [`crate::wire`].
//!
//! Revision tokens (`at_revision`) are opaque strings minted by the storage
//! layer. The dispatch layer forwards them unchanged and never inspects them.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A reference to a relation under a namespace, e.g. `document#view`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationReference {
    pub namespace: String,
    pub relation: String,
}

impl RelationReference {
    pub fn new(namespace: impl Into<String>, relation: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), relation: relation.into() }
    }
}

impl fmt::Display for RelationReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.namespace, self.relation)
    }
}

/// A concrete object with a relation, e.g. `user:tom#...`.
///
/// The ellipsis relation (`...`) denotes the terminal subject itself rather
/// than a set defined by a relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectAndRelation {
    pub namespace: String,
    pub object_id: String,
    pub relation: String,
}

impl ObjectAndRelation {
    pub fn new(
        namespace: impl Into<String>,
        object_id: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            object_id: object_id.into(),
            relation: relation.into(),
        }
    }
}

impl fmt::Display for ObjectAndRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.namespace, self.object_id, self.relation)
    }
}

/// Resolution metadata carried by every dispatch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverMeta {
    /// Opaque, monotonic revision token produced by the storage layer.
    /// Forwarded unchanged by every dispatcher.
    #[serde(default)]
    pub at_revision: String,

    /// Remaining recursion budget. Must be >= 1 when a request is
    /// dispatched; a value of 0 fails the request with a depth-exceeded
    /// error before any evaluation happens.
    pub depth_remaining: u32,
}

impl ResolverMeta {
    /// Returns a copy with the depth budget decremented by one, for
    /// issuing a recursive sub-dispatch.
    #[must_use]
    pub fn for_redispatch(&self) -> Self {
        Self {
            at_revision: self.at_revision.clone(),
            depth_remaining: self.depth_remaining.saturating_sub(1),
        }
    }
}

/// Accounting metadata carried by every dispatch response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    /// Number of non-cached sub-dispatches that produced this response.
    pub dispatch_count: u32,

    /// Number of sub-dispatches answered from a cache.
    pub cached_dispatch_count: u32,

    /// Maximum depth actually consumed by the sub-tree that produced
    /// this response.
    pub depth_required: u32,
}

/// A resumable continuation token for streaming operations.
///
/// Opaque to callers; structured to the dispatch layer. `sections` are
/// evaluator-internal state, except that the first section may carry the
/// secondary-routing prefix (see [`crate::dispatch::cursor`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub sections: Vec<String>,
    pub dispatch_version: u32,
}

/// Membership outcome for a single checked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Membership {
    Member,
    NotMember,
}

/// Per-resource result payload of a check dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCheckResult {
    pub membership: Membership,
}

/// Dispatched permission check over a set of candidate resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub resource_relation: RelationReference,
    pub resource_ids: Vec<String>,
    pub subject: ObjectAndRelation,
    pub metadata: ResolverMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub metadata: ResponseMeta,
    /// Results keyed by resource id. Resources without membership are
    /// omitted by evaluators that only report positive results.
    #[serde(default)]
    pub results_by_resource_id: HashMap<String, ResourceCheckResult>,
}

/// Dispatched expansion of a relation into its membership tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandRequest {
    pub resource_and_relation: ObjectAndRelation,
    pub metadata: ResolverMeta,
}

/// Set operation joining the children of an intermediate expand node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetOperation {
    Union,
    Intersection,
    Exclusion,
}

/// A node in an expansion tree: either direct subjects or a set operation
/// over sub-trees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpandNode {
    Leaf { subjects: Vec<ObjectAndRelation> },
    Intermediate { operation: SetOperation, children: Vec<ExpandNode> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandResponse {
    pub metadata: ResponseMeta,
    pub tree: ExpandNode,
}

/// Dispatched reverse walk: find resources of `resource_relation` reachable
/// from the given subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResourcesRequest {
    pub resource_relation: RelationReference,
    pub subject_relation: RelationReference,
    pub subject_ids: Vec<String>,
    pub terminal_subject: ObjectAndRelation,
    pub metadata: ResolverMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// A resource found by a lookup-resources walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PossibleResource {
    pub resource_id: String,
    /// Subject ids of the incoming request through which this resource
    /// was reached.
    #[serde(default)]
    pub for_subject_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResourcesResponse {
    pub resource: PossibleResource,
    pub metadata: ResponseMeta,
    pub after_response_cursor: Cursor,
}

/// Dispatched subject enumeration: find subjects of `subject_relation`
/// that reach the given resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupSubjectsRequest {
    pub resource_relation: RelationReference,
    pub resource_ids: Vec<String>,
    pub subject_relation: RelationReference,
    pub metadata: ResolverMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// A subject found by a lookup-subjects walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundSubject {
    pub subject_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupSubjectsResponse {
    #[serde(default)]
    pub found_subjects: Vec<FoundSubject>,
    pub metadata: ResponseMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_response_cursor: Option<Cursor>,
}

/// Readiness of a dispatcher, surfaced to health checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyState {
    pub is_ready: bool,
    pub message: String,
}

impl ReadyState {
    pub fn ready() -> Self {
        Self { is_ready: true, message: String::new() }
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self { is_ready: false, message: message.into() }
    }
}
