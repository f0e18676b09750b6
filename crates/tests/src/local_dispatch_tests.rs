//! Tests for the in-process dispatcher: recursion base, depth budgets, and
//! redispatcher wiring.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use lattice_core::dispatch::{
    CollectingDispatchStream, Context, DispatchError, DispatchStream, Dispatcher, LocalDispatcher,
};
use lattice_core::types::{
    CheckRequest, CheckResponse, ExpandRequest, ExpandResponse, LookupResourcesRequest,
    LookupResourcesResponse, LookupSubjectsRequest, LookupSubjectsResponse, ObjectAndRelation,
    ReadyState, RelationReference, ResolverMeta, ResponseMeta,
};

use crate::mock_infrastructure::RecursiveEvaluator;

fn chain_request(length: u32, depth_remaining: u32) -> CheckRequest {
    CheckRequest {
        resource_relation: RelationReference::new("document", "view"),
        resource_ids: vec![format!("chain:{length}")],
        subject: ObjectAndRelation::new("user", "tom", "..."),
        metadata: ResolverMeta { at_revision: "r1".into(), depth_remaining },
    }
}

#[tokio::test]
async fn test_recursion_terminates_in_process() {
    let dispatcher = LocalDispatcher::new_local_only(Arc::new(RecursiveEvaluator));
    assert!(dispatcher.ready_state().is_ready);

    let response = dispatcher
        .dispatch_check(&Context::background(), chain_request(3, 50))
        .await
        .unwrap();

    // chain:3 -> chain:2 -> chain:1 -> chain:0, one dispatch per link.
    assert_eq!(response.metadata.dispatch_count, 4);
    assert_eq!(response.metadata.depth_required, 4);
    assert!(response.results_by_resource_id.contains_key("chain:0"));
}

#[tokio::test]
async fn test_recursion_exhausts_depth_budget() {
    let dispatcher = LocalDispatcher::new_local_only(Arc::new(RecursiveEvaluator));

    let result = dispatcher
        .dispatch_check(&Context::background(), chain_request(5, 3))
        .await;
    assert!(matches!(result, Err(DispatchError::DepthExceeded)));
}

#[tokio::test]
async fn test_zero_depth_fails_before_evaluation() {
    let dispatcher = LocalDispatcher::new_local_only(Arc::new(RecursiveEvaluator));

    let result = dispatcher
        .dispatch_check(&Context::background(), chain_request(0, 0))
        .await;
    assert!(matches!(result, Err(DispatchError::DepthExceeded)));
}

#[tokio::test]
async fn test_cancelled_context_fails_before_evaluation() {
    let dispatcher = LocalDispatcher::new_local_only(Arc::new(RecursiveEvaluator));

    let ctx = Context::background();
    ctx.cancel();

    let result = dispatcher.dispatch_check(&ctx, chain_request(1, 50)).await;
    assert!(matches!(result, Err(DispatchError::Cancelled)));
}

#[tokio::test]
async fn test_lookup_resources_streams_in_order() {
    let dispatcher = LocalDispatcher::new_local_only(Arc::new(RecursiveEvaluator));

    let request = LookupResourcesRequest {
        resource_relation: RelationReference::new("document", "view"),
        subject_relation: RelationReference::new("user", "..."),
        subject_ids: vec!["alice".into(), "bob".into()],
        terminal_subject: ObjectAndRelation::new("user", "alice", "..."),
        metadata: ResolverMeta { at_revision: "r1".into(), depth_remaining: 50 },
        cursor: None,
        limit: None,
    };

    let stream = CollectingDispatchStream::new(Context::background());
    dispatcher
        .dispatch_lookup_resources(&Context::background(), request, &stream)
        .await
        .unwrap();

    let results = stream.results();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].resource.resource_id, "resource-0");
    assert_eq!(results[1].resource.resource_id, "resource-1");
    assert_eq!(results[1].after_response_cursor.sections, vec!["offset:2".to_string()]);
}

/// Records every check it receives and answers with a fixed response.
struct RecordingDispatcher {
    checks: Mutex<Vec<CheckRequest>>,
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch_check(
        &self,
        _ctx: &Context,
        request: CheckRequest,
    ) -> Result<CheckResponse, DispatchError> {
        self.checks.lock().push(request);
        Ok(CheckResponse {
            metadata: ResponseMeta {
                dispatch_count: 7,
                cached_dispatch_count: 0,
                depth_required: 1,
            },
            results_by_resource_id: Default::default(),
        })
    }

    async fn dispatch_expand(
        &self,
        _ctx: &Context,
        _request: ExpandRequest,
    ) -> Result<ExpandResponse, DispatchError> {
        Err(DispatchError::Internal("not used by this test".into()))
    }

    async fn dispatch_lookup_resources(
        &self,
        _ctx: &Context,
        _request: LookupResourcesRequest,
        _stream: &dyn DispatchStream<LookupResourcesResponse>,
    ) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn dispatch_lookup_subjects(
        &self,
        _ctx: &Context,
        _request: LookupSubjectsRequest,
        _stream: &dyn DispatchStream<LookupSubjectsResponse>,
    ) -> Result<(), DispatchError> {
        Ok(())
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::ready()
    }

    async fn close(&self) {}
}

#[tokio::test]
async fn test_redispatches_escape_through_the_configured_redispatcher() {
    let recorder = Arc::new(RecordingDispatcher { checks: Mutex::new(Vec::new()) });
    let dispatcher =
        LocalDispatcher::with_redispatcher(Arc::new(RecursiveEvaluator), recorder.clone());

    let response = dispatcher
        .dispatch_check(&Context::background(), chain_request(2, 50))
        .await
        .unwrap();

    // The first link went to the recorder instead of recursing locally, so
    // the evaluator added one dispatch on top of the recorder's seven.
    assert_eq!(response.metadata.dispatch_count, 8);

    let seen = recorder.checks.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].resource_ids, vec!["chain:1".to_string()]);
    assert_eq!(seen[0].metadata.depth_remaining, 49);
}
