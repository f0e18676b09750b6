//! Request fingerprinting for consistent routing and caching.
//!
//! A fingerprint is a deterministic identity of a dispatch request: stable
//! across restarts, insensitive to the ordering of set-valued fields, and
//! blind to transient metadata (`depth_remaining`, cursors). Equal
//! fingerprints imply the requests are interchangeable for routing and
//! caching.
//!
//! The canonical encoding length-prefixes every field and tags every
//! operation and reference kind with a discriminant byte, so distinct
//! structures can never collide by concatenation.

use sha2::{Digest, Sha256};

use crate::types::{
    CheckRequest, ExpandRequest, LookupResourcesRequest, LookupSubjectsRequest,
    ObjectAndRelation, RelationReference,
};

/// A stable fingerprint of a dispatch request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchKey([u8; 32]);

impl DispatchKey {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DispatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DispatchKey({self})")
    }
}

/// Computes fingerprints for each dispatch operation.
pub trait KeyHandler: Send + Sync {
    fn check_key(&self, request: &CheckRequest) -> DispatchKey;
    fn expand_key(&self, request: &ExpandRequest) -> DispatchKey;
    fn lookup_resources_key(&self, request: &LookupResourcesRequest) -> DispatchKey;
    fn lookup_subjects_key(&self, request: &LookupSubjectsRequest) -> DispatchKey;
}

/// The default fingerprinting strategy.
///
/// Sorts and deduplicates set-valued id lists, canonicalizes embedded
/// references, and hashes the resulting byte sequence with SHA-256.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectKeyHandler;

// Operation discriminants. New operations get new tags; existing tags are
// never reused.
const TAG_CHECK: u8 = 0x01;
const TAG_EXPAND: u8 = 0x02;
const TAG_LOOKUP_RESOURCES: u8 = 0x03;
const TAG_LOOKUP_SUBJECTS: u8 = 0x04;

struct Canonicalizer {
    hasher: Sha256,
}

impl Canonicalizer {
    fn new(operation_tag: u8) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([operation_tag]);
        Self { hasher }
    }

    fn string(&mut self, value: &str) {
        self.hasher.update((value.len() as u64).to_be_bytes());
        self.hasher.update(value.as_bytes());
    }

    fn string_set(&mut self, values: &[String]) {
        let mut sorted: Vec<&str> = values.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();

        self.hasher.update((sorted.len() as u64).to_be_bytes());
        for value in sorted {
            self.string(value);
        }
    }

    fn relation_reference(&mut self, reference: &RelationReference) {
        self.hasher.update([0x10]);
        self.string(&reference.namespace);
        self.string(&reference.relation);
    }

    fn object_and_relation(&mut self, onr: &ObjectAndRelation) {
        self.hasher.update([0x11]);
        self.string(&onr.namespace);
        self.string(&onr.object_id);
        self.string(&onr.relation);
    }

    fn revision(&mut self, at_revision: &str) {
        self.hasher.update([0x12]);
        self.string(at_revision);
    }

    fn limit(&mut self, limit: Option<u32>) {
        match limit {
            Some(value) => {
                self.hasher.update([0x13]);
                self.hasher.update(value.to_be_bytes());
            }
            None => self.hasher.update([0x14]),
        }
    }

    fn finish(self) -> DispatchKey {
        DispatchKey(self.hasher.finalize().into())
    }
}

impl KeyHandler for DirectKeyHandler {
    fn check_key(&self, request: &CheckRequest) -> DispatchKey {
        let mut canon = Canonicalizer::new(TAG_CHECK);
        canon.relation_reference(&request.resource_relation);
        canon.string_set(&request.resource_ids);
        canon.object_and_relation(&request.subject);
        canon.revision(&request.metadata.at_revision);
        canon.finish()
    }

    fn expand_key(&self, request: &ExpandRequest) -> DispatchKey {
        let mut canon = Canonicalizer::new(TAG_EXPAND);
        canon.object_and_relation(&request.resource_and_relation);
        canon.revision(&request.metadata.at_revision);
        canon.finish()
    }

    fn lookup_resources_key(&self, request: &LookupResourcesRequest) -> DispatchKey {
        let mut canon = Canonicalizer::new(TAG_LOOKUP_RESOURCES);
        canon.relation_reference(&request.resource_relation);
        canon.relation_reference(&request.subject_relation);
        canon.string_set(&request.subject_ids);
        canon.object_and_relation(&request.terminal_subject);
        canon.revision(&request.metadata.at_revision);
        canon.limit(request.limit);
        canon.finish()
    }

    fn lookup_subjects_key(&self, request: &LookupSubjectsRequest) -> DispatchKey {
        let mut canon = Canonicalizer::new(TAG_LOOKUP_SUBJECTS);
        canon.relation_reference(&request.resource_relation);
        canon.string_set(&request.resource_ids);
        canon.relation_reference(&request.subject_relation);
        canon.revision(&request.metadata.at_revision);
        canon.limit(request.limit);
        canon.finish()
    }
}
