//! Integration tests for cluster dispatch: hedged secondaries, streaming
//! races, cursor pinning, fallback, and timeout enforcement.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lattice_core::dispatch::{
    parse_dispatch_expression, ClusterDispatcher, ClusterDispatcherConfig,
    CollectingDispatchStream, Context, DirectKeyHandler, DispatchError, Dispatcher, RequestKind,
    SecondaryDispatch,
};
use lattice_core::types::{
    CheckRequest, Cursor, LookupResourcesRequest, LookupSubjectsRequest, ObjectAndRelation,
    RelationReference, ResolverMeta,
};

use crate::mock_infrastructure::FakeDispatchService;

fn check_request(namespace: &str) -> CheckRequest {
    CheckRequest {
        resource_relation: RelationReference::new(namespace, "somerelation"),
        resource_ids: vec!["foo".into()],
        subject: ObjectAndRelation::new("foo", "bar", "..."),
        metadata: ResolverMeta { at_revision: "r1".into(), depth_remaining: 50 },
    }
}

fn lookup_request(cursor: Option<Cursor>) -> LookupResourcesRequest {
    LookupResourcesRequest {
        resource_relation: RelationReference::new("somenamespace", "somerelation"),
        subject_relation: RelationReference::new("somenamespace", "somerelation"),
        subject_ids: vec!["foo".into()],
        terminal_subject: ObjectAndRelation::new("foo", "bar", "..."),
        metadata: ResolverMeta { at_revision: "r1".into(), depth_remaining: 50 },
        cursor,
        limit: None,
    }
}

fn lookup_subjects_request() -> LookupSubjectsRequest {
    LookupSubjectsRequest {
        resource_relation: RelationReference::new("somenamespace", "somerelation"),
        resource_ids: vec!["foo".into()],
        subject_relation: RelationReference::new("somenamespace", "somerelation"),
        metadata: ResolverMeta { at_revision: "r1".into(), depth_remaining: 50 },
        cursor: None,
        limit: None,
    }
}

fn sections(values: &[&str]) -> Option<Cursor> {
    Some(Cursor {
        sections: values.iter().map(ToString::to_string).collect(),
        dispatch_version: 1,
    })
}

fn cluster(
    primary: FakeDispatchService,
    timeout: Duration,
    secondaries: Vec<(&str, FakeDispatchService)>,
    expressions: Vec<(RequestKind, &str)>,
) -> ClusterDispatcher {
    let expressions: HashMap<_, _> = expressions
        .into_iter()
        .map(|(kind, source)| (kind, parse_dispatch_expression(kind, source).unwrap()))
        .collect();

    ClusterDispatcher::new(
        primary.into_client(),
        ClusterDispatcherConfig {
            key_handler: Arc::new(DirectKeyHandler),
            dispatch_overall_timeout: timeout,
        },
        secondaries
            .into_iter()
            .map(|(name, service)| SecondaryDispatch::new(name, service.into_client()))
            .collect(),
        expressions,
    )
}

#[tokio::test]
async fn test_dispatch_timeout() {
    for (timeout, sleep) in [
        (Duration::from_millis(10), Duration::from_millis(20)),
        (Duration::from_millis(100), Duration::from_millis(20)),
    ] {
        let dispatcher = cluster(
            FakeDispatchService::new(1).with_sleep(sleep),
            timeout,
            vec![],
            vec![],
        );
        assert!(dispatcher.ready_state().is_ready);

        let result = dispatcher
            .dispatch_check(&Context::background(), check_request("sometype"))
            .await;
        if sleep > timeout {
            let error = result.unwrap_err();
            assert!(
                error.to_string().contains("context deadline exceeded"),
                "unexpected error: {error}"
            );
        } else {
            let response = result.unwrap();
            assert!(response.metadata.dispatch_count >= 1);
        }

        let stream = CollectingDispatchStream::new(Context::background());
        let result = dispatcher
            .dispatch_lookup_subjects(&Context::background(), lookup_subjects_request(), &stream)
            .await;
        if sleep > timeout {
            let error = result.unwrap_err();
            assert!(
                error.to_string().contains("context deadline exceeded"),
                "unexpected error: {error}"
            );
        } else {
            result.unwrap();
            let results = stream.results();
            assert!(!results.is_empty());
            assert!(results[0].metadata.dispatch_count >= 1);
        }
    }
}

#[tokio::test]
async fn test_check_secondary_dispatch() {
    struct Case {
        name: &'static str,
        expr: &'static str,
        namespace: &'static str,
        primary_sleep: Duration,
        expected_dispatch_count: u32,
    }

    let conditional =
        "request.resource_relation.namespace == 'somenamespace' ? ['secondary'] : []";
    let cases = [
        Case {
            name: "no multidispatch",
            expr: "['invalid']",
            namespace: "somenamespace",
            primary_sleep: Duration::ZERO,
            expected_dispatch_count: 1,
        },
        Case {
            name: "basic multidispatch",
            expr: "['secondary']",
            namespace: "somenamespace",
            primary_sleep: Duration::from_millis(200),
            expected_dispatch_count: 2,
        },
        Case {
            name: "expression names an unconfigured secondary",
            expr: "['notconfigured']",
            namespace: "somenamespace",
            primary_sleep: Duration::from_millis(200),
            expected_dispatch_count: 1,
        },
        Case {
            name: "expression matches request",
            expr: conditional,
            namespace: "somenamespace",
            primary_sleep: Duration::from_millis(200),
            expected_dispatch_count: 2,
        },
        Case {
            name: "expression does not match request",
            expr: conditional,
            namespace: "someothernamespace",
            primary_sleep: Duration::from_millis(200),
            expected_dispatch_count: 1,
        },
    ];

    for case in cases {
        let dispatcher = cluster(
            FakeDispatchService::new(1).with_sleep(case.primary_sleep),
            Duration::from_secs(30),
            vec![("secondary", FakeDispatchService::new(2))],
            vec![(RequestKind::Check, case.expr)],
        );
        assert!(dispatcher.ready_state().is_ready);

        let response = dispatcher
            .dispatch_check(&Context::background(), check_request(case.namespace))
            .await
            .unwrap_or_else(|e| panic!("{}: {e}", case.name));
        assert_eq!(
            response.metadata.dispatch_count, case.expected_dispatch_count,
            "{}",
            case.name
        );
    }
}

#[tokio::test]
async fn test_lookup_resources_secondary_dispatch() {
    struct Case {
        name: &'static str,
        expr: &'static str,
        cursor: Option<Cursor>,
        expected_dispatch_count: u32,
        expect_error: bool,
    }

    let cases = [
        Case {
            name: "no multidispatch",
            expr: "['invalid']",
            cursor: None,
            expected_dispatch_count: 1,
            expect_error: false,
        },
        Case {
            name: "valid multidispatch",
            expr: "['secondary']",
            cursor: None,
            expected_dispatch_count: 2,
            expect_error: false,
        },
        Case {
            name: "cursor without routing tag still hedges to the default secondary",
            expr: "['secondary']",
            cursor: sections(&["somethingelse"]),
            expected_dispatch_count: 2,
            expect_error: false,
        },
        Case {
            name: "cursor pinned to healthy secondary",
            expr: "['secondary']",
            cursor: sections(&["$s:tertiary"]),
            expected_dispatch_count: 3,
            expect_error: false,
        },
        Case {
            name: "cursor pinned to failing secondary",
            expr: "['secondary']",
            cursor: sections(&["$s:error"]),
            expected_dispatch_count: 0,
            expect_error: true,
        },
        Case {
            name: "failing default secondary falls back to primary",
            expr: "['error']",
            cursor: None,
            expected_dispatch_count: 1,
            expect_error: false,
        },
        Case {
            name: "cursor pinned to unknown secondary",
            expr: "['error']",
            cursor: sections(&["$s:unknown"]),
            expected_dispatch_count: 0,
            expect_error: true,
        },
        Case {
            name: "pin to the default secondary",
            expr: "['secondary', 'tertiary']",
            cursor: sections(&["$s:secondary"]),
            expected_dispatch_count: 2,
            expect_error: false,
        },
        Case {
            name: "pin to a non-default secondary",
            expr: "['tertiary', 'secondary']",
            cursor: sections(&["$s:secondary"]),
            expected_dispatch_count: 2,
            expect_error: false,
        },
    ];

    for case in cases {
        // The primary is slow so that secondaries win whenever they apply.
        let dispatcher = cluster(
            FakeDispatchService::new(1).with_sleep(Duration::from_millis(100)),
            Duration::from_secs(30),
            vec![
                ("secondary", FakeDispatchService::new(2)),
                ("tertiary", FakeDispatchService::new(3)),
                (
                    "error",
                    FakeDispatchService::new(4)
                        .with_lookup_error(DispatchError::Unavailable("not available".into())),
                ),
            ],
            vec![(RequestKind::LookupResources, case.expr)],
        );
        assert!(dispatcher.ready_state().is_ready);

        let stream = CollectingDispatchStream::new(Context::background());
        let result = dispatcher
            .dispatch_lookup_resources(&Context::background(), lookup_request(case.cursor), &stream)
            .await;

        if case.expect_error {
            assert!(result.is_err(), "{} should fail", case.name);
        } else {
            result.unwrap_or_else(|e| panic!("{}: {e}", case.name));
            let results = stream.results();
            assert_eq!(results.len(), 2, "{}", case.name);
            assert_eq!(
                results[0].metadata.dispatch_count, case.expected_dispatch_count,
                "{}",
                case.name
            );
        }
    }
}

#[tokio::test]
async fn test_pinned_secondary_responses_keep_the_routing_tag() {
    let dispatcher = cluster(
        FakeDispatchService::new(1).with_sleep(Duration::from_millis(100)),
        Duration::from_secs(30),
        vec![("tertiary", FakeDispatchService::new(3))],
        vec![],
    );

    let stream = CollectingDispatchStream::new(Context::background());
    dispatcher
        .dispatch_lookup_resources(
            &Context::background(),
            lookup_request(sections(&["$s:tertiary"])),
            &stream,
        )
        .await
        .unwrap();

    let results = stream.results();
    assert_eq!(results.len(), 2);
    for response in &results {
        assert_eq!(response.metadata.dispatch_count, 3);
        assert_eq!(
            response.after_response_cursor.sections.first().map(String::as_str),
            Some("$s:tertiary")
        );
    }
}

#[tokio::test]
async fn test_race_winning_secondary_annotates_cursors() {
    let dispatcher = cluster(
        FakeDispatchService::new(1).with_sleep(Duration::from_millis(100)),
        Duration::from_secs(30),
        vec![("secondary", FakeDispatchService::new(2))],
        vec![(RequestKind::LookupResources, "['secondary']")],
    );

    let stream = CollectingDispatchStream::new(Context::background());
    dispatcher
        .dispatch_lookup_resources(&Context::background(), lookup_request(None), &stream)
        .await
        .unwrap();

    let results = stream.results();
    assert_eq!(results.len(), 2);
    for response in &results {
        assert_eq!(
            response.after_response_cursor.sections.first().map(String::as_str),
            Some("$s:secondary")
        );
    }
}

#[tokio::test]
async fn test_primary_win_leaves_cursors_unannotated() {
    let dispatcher = cluster(
        FakeDispatchService::new(1),
        Duration::from_secs(30),
        vec![],
        vec![],
    );

    let stream = CollectingDispatchStream::new(Context::background());
    dispatcher
        .dispatch_lookup_resources(&Context::background(), lookup_request(None), &stream)
        .await
        .unwrap();

    for response in stream.results() {
        assert!(response.after_response_cursor.sections.is_empty());
    }
}

#[tokio::test]
async fn test_lookup_resources_fallback_to_primary() {
    // The secondary fails immediately; the slower primary, already running
    // in parallel, supplies the full result stream.
    let dispatcher = cluster(
        FakeDispatchService::new(1)
            .with_result_count(10)
            .with_sleep(Duration::from_millis(1)),
        Duration::from_secs(30),
        vec![(
            "secondary",
            FakeDispatchService::new(2)
                .with_lookup_error(DispatchError::Unavailable("not available".into())),
        )],
        vec![(RequestKind::LookupResources, "['secondary']")],
    );
    assert!(dispatcher.ready_state().is_ready);

    let stream = CollectingDispatchStream::new(Context::background());
    dispatcher
        .dispatch_lookup_resources(&Context::background(), lookup_request(None), &stream)
        .await
        .unwrap();

    let results = stream.results();
    assert_eq!(results.len(), 10);
    assert_eq!(results[0].metadata.dispatch_count, 1);
    assert_eq!(results[0].resource.resource_id, "0");
}

#[tokio::test]
async fn test_hedging_never_merges_producers() {
    // Both producers are fast; whichever wins, the caller must see exactly
    // one producer's sequence.
    let dispatcher = cluster(
        FakeDispatchService::new(1),
        Duration::from_secs(30),
        vec![("secondary", FakeDispatchService::new(2))],
        vec![(RequestKind::LookupResources, "['secondary']")],
    );

    let stream = CollectingDispatchStream::new(Context::background());
    dispatcher
        .dispatch_lookup_resources(&Context::background(), lookup_request(None), &stream)
        .await
        .unwrap();

    let results = stream.results();
    assert_eq!(results.len(), 2);
    let winner_count = results[0].metadata.dispatch_count;
    assert!(results.iter().all(|r| r.metadata.dispatch_count == winner_count));
}

#[tokio::test]
async fn test_lookup_subjects_hedges_and_annotates() {
    let dispatcher = cluster(
        FakeDispatchService::new(1).with_sleep(Duration::from_millis(100)),
        Duration::from_secs(30),
        vec![("secondary", FakeDispatchService::new(2))],
        vec![(RequestKind::LookupSubjects, "['secondary']")],
    );

    let stream = CollectingDispatchStream::new(Context::background());
    dispatcher
        .dispatch_lookup_subjects(&Context::background(), lookup_subjects_request(), &stream)
        .await
        .unwrap();

    let results = stream.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].metadata.dispatch_count, 2);
    let cursor = results[0].after_response_cursor.as_ref().unwrap();
    assert_eq!(cursor.sections.first().map(String::as_str), Some("$s:secondary"));
}

#[tokio::test]
async fn test_cursor_version_mismatch_is_rejected() {
    let dispatcher = cluster(
        FakeDispatchService::new(1),
        Duration::from_secs(30),
        vec![],
        vec![],
    );

    let stale = Cursor { sections: vec!["$s:secondary".into()], dispatch_version: 2 };
    let stream = CollectingDispatchStream::new(Context::background());
    let result = dispatcher
        .dispatch_lookup_resources(&Context::background(), lookup_request(Some(stale)), &stream)
        .await;

    assert!(matches!(result, Err(DispatchError::InvalidCursor(_))));
    assert!(stream.results().is_empty());
}

#[tokio::test]
async fn test_depth_exhaustion_is_rejected() {
    let dispatcher = cluster(
        FakeDispatchService::new(1),
        Duration::from_secs(30),
        vec![],
        vec![],
    );

    let mut request = lookup_request(None);
    request.metadata.depth_remaining = 0;

    let stream = CollectingDispatchStream::new(Context::background());
    let result = dispatcher
        .dispatch_lookup_resources(&Context::background(), request, &stream)
        .await;

    assert!(matches!(result, Err(DispatchError::DepthExceeded)));
    assert!(stream.results().is_empty());
}

#[tokio::test]
async fn test_expired_caller_deadline_fails_before_any_result() {
    let dispatcher = cluster(
        FakeDispatchService::new(1),
        Duration::from_secs(30),
        vec![],
        vec![],
    );

    let ctx = Context::background().with_timeout(Duration::from_nanos(1));
    tokio::time::sleep(Duration::from_millis(2)).await;

    let stream = CollectingDispatchStream::new(ctx.clone());
    let error = dispatcher
        .dispatch_lookup_resources(&ctx, lookup_request(None), &stream)
        .await
        .unwrap_err();

    assert!(
        error.to_string().contains("context deadline exceeded"),
        "unexpected error: {error}"
    );
    assert!(stream.results().is_empty());
}

#[tokio::test]
async fn test_timeout_mid_stream_closes_with_deadline_error() {
    // Ten results at 20ms apiece against a 50ms budget: some results are
    // streamed, then the operation fails.
    let dispatcher = cluster(
        FakeDispatchService::new(1)
            .with_result_count(10)
            .with_sleep(Duration::from_millis(20)),
        Duration::from_millis(50),
        vec![],
        vec![],
    );

    let stream = CollectingDispatchStream::new(Context::background());
    let error = dispatcher
        .dispatch_lookup_resources(&Context::background(), lookup_request(None), &stream)
        .await
        .unwrap_err();

    assert!(error.to_string().contains("context deadline exceeded"));
    assert!(stream.results().len() < 10);
}
