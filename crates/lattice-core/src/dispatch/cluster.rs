//! Cluster dispatch: primary routing with hedged secondaries.
//!
//! Every operation goes to the primary peer. When the operation's dispatch
//! expression names configured secondaries, those are raced against the
//! primary and the first producer to answer wins; the rest are cancelled.
//! For streaming operations the race is first-to-emit: whichever producer
//! yields its first response becomes the chosen producer and the caller
//! sees exactly that producer's sequence, never a merge.
//!
//! Streaming continuations are sticky. A response produced by a secondary
//! carries a cursor pinned to that secondary; reissuing with that cursor
//! routes to the same peer only, because the evaluator-internal cursor
//! state is meaningless anywhere else. A pinned secondary's error is fatal
//! to the operation. An unpinned secondary that fails *before* its first
//! response is absorbed silently and the primary (already running) takes
//! over.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{select_all, BoxFuture};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::types::{
    CheckRequest, CheckResponse, Cursor, ExpandRequest, ExpandResponse, LookupResourcesRequest,
    LookupResourcesResponse, LookupSubjectsRequest, LookupSubjectsResponse, ReadyState,
};

use super::client::{DispatchClient, ResponseStream, SecondaryDispatch};
use super::context::Context;
use super::cursor;
use super::errors::DispatchError;
use super::expression::{DispatchExpr, ExpressionRequest, RequestKind};
use super::keys::{DirectKeyHandler, KeyHandler};
use super::stream::DispatchStream;
use super::{check_depth_remaining, Dispatcher};

/// Configuration recognized by the cluster dispatcher.
#[derive(Clone)]
pub struct ClusterDispatcherConfig {
    /// Fingerprinting strategy; governs cache identity for callers that
    /// put a cache in front of this dispatcher.
    pub key_handler: Arc<dyn KeyHandler>,

    /// Hard cap on the wall time of a single dispatch call, enforced by
    /// deriving a child deadline context.
    pub dispatch_overall_timeout: Duration,
}

impl Default for ClusterDispatcherConfig {
    fn default() -> Self {
        Self {
            key_handler: Arc::new(DirectKeyHandler),
            dispatch_overall_timeout: Duration::from_secs(60),
        }
    }
}

/// Routes dispatch requests to a primary peer plus optional hedged
/// secondaries.
///
/// The secondary and expression maps are immutable after construction;
/// peer client handles are shared by reference across requests.
pub struct ClusterDispatcher {
    primary: Arc<dyn DispatchClient>,
    config: ClusterDispatcherConfig,
    secondaries: HashMap<String, SecondaryDispatch>,
    expressions: HashMap<RequestKind, DispatchExpr>,
}

impl ClusterDispatcher {
    #[must_use]
    pub fn new(
        primary: Arc<dyn DispatchClient>,
        config: ClusterDispatcherConfig,
        secondaries: Vec<SecondaryDispatch>,
        expressions: HashMap<RequestKind, DispatchExpr>,
    ) -> Self {
        let secondaries = secondaries
            .into_iter()
            .map(|secondary| (secondary.name.clone(), secondary))
            .collect();
        Self { primary, config, secondaries, expressions }
    }

    /// Secondaries the operation's expression selects for this request, in
    /// expression order. Names without a configured secondary are skipped
    /// without error.
    fn secondaries_for<R: ExpressionRequest>(
        &self,
        kind: RequestKind,
        request: &R,
    ) -> Vec<SecondaryDispatch> {
        let Some(expression) = self.expressions.get(&kind) else {
            return Vec::new();
        };

        expression
            .evaluate(request)
            .into_iter()
            .filter_map(|name| {
                let found = self.secondaries.get(&name).cloned();
                if found.is_none() {
                    debug!(operation = %kind, secondary = %name, "expression named an unconfigured secondary; skipping");
                }
                found
            })
            .collect()
    }

    /// Races the primary against hedged secondaries for a single-response
    /// operation. The first successful response wins and the remaining
    /// calls are cancelled by dropping their futures. Secondary failures
    /// are absorbed; the primary's failure is surfaced once no secondary
    /// can still succeed.
    async fn race_unary<Req, Resp>(
        &self,
        ctx: &Context,
        request: Req,
        targets: Vec<SecondaryDispatch>,
        open: fn(Arc<dyn DispatchClient>, Context, Req) -> BoxFuture<'static, Result<Resp, DispatchError>>,
    ) -> Result<Resp, DispatchError>
    where
        Req: Clone + Send + Sync + 'static,
        Resp: Send + 'static,
    {
        type UnaryArm<Resp> = BoxFuture<'static, (Option<String>, Result<Resp, DispatchError>)>;

        let mut arms: Vec<UnaryArm<Resp>> = Vec::with_capacity(targets.len() + 1);
        arms.push(Box::pin({
            let client = Arc::clone(&self.primary);
            let ctx = ctx.clone();
            let request = request.clone();
            async move { (None, open(client, ctx, request).await) }
        }));
        for target in targets {
            arms.push(Box::pin({
                let ctx = ctx.clone();
                let request = request.clone();
                async move { (Some(target.name), open(target.client, ctx, request).await) }
            }));
        }

        let mut primary_error = None;
        while !arms.is_empty() {
            let ((source, result), _index, remaining) = select_all(arms).await;
            arms = remaining;

            match result {
                Ok(response) => {
                    if let Some(name) = source {
                        debug!(secondary = %name, "hedged secondary answered first");
                    }
                    return Ok(response);
                }
                Err(error) => match source {
                    None => {
                        warn!(error = %error, "primary dispatch failed");
                        primary_error = Some(error);
                    }
                    Some(name) => {
                        debug!(secondary = %name, error = %error, "hedged secondary failed");
                    }
                },
            }
        }

        Err(primary_error
            .unwrap_or_else(|| DispatchError::Unavailable("no dispatch peer produced a response".into())))
    }

    /// The full streaming procedure: cursor validation, pinning, the
    /// first-to-emit race, and forwarding with cursor annotation.
    async fn dispatch_streaming_operation<Req, R>(
        &self,
        ctx: &Context,
        kind: RequestKind,
        request: Req,
        stream: &dyn DispatchStream<R>,
        ops: StreamingOps<Req, R>,
    ) -> Result<(), DispatchError>
    where
        Req: ExpressionRequest + Clone + Send + Sync + 'static,
        R: Send + 'static,
    {
        let op_ctx = ctx.with_timeout(self.config.dispatch_overall_timeout);

        if let Some(request_cursor) = (ops.request_cursor)(&request) {
            cursor::validate_version(request_cursor)?;

            if let Some(name) = cursor::pinned_secondary(request_cursor) {
                let Some(secondary) = self.secondaries.get(name) else {
                    return Err(DispatchError::UnknownSecondary(name.to_string()));
                };
                debug!(operation = %kind, secondary = %secondary.name, "continuation pinned to secondary");

                let mut pinned_request = request.clone();
                (ops.set_request_cursor)(&mut pinned_request, Some(cursor::without_pin(request_cursor)));

                let client = Arc::clone(&secondary.client);
                let name = secondary.name.clone();
                return tokio::select! {
                    err = op_ctx.done() => Err(err),
                    result = consume_pinned(client, name, op_ctx.clone(), pinned_request, stream, ops) => result,
                };
            }
        }

        let default_secondary = self.secondaries_for(kind, &request).into_iter().next();
        tokio::select! {
            err = op_ctx.done() => Err(err),
            result = self.race_streaming(op_ctx.clone(), request, default_secondary, stream, ops) => result,
        }
    }

    /// First-to-emit race between the primary and the default secondary.
    async fn race_streaming<Req, R>(
        &self,
        ctx: Context,
        request: Req,
        secondary: Option<SecondaryDispatch>,
        stream: &dyn DispatchStream<R>,
        ops: StreamingOps<Req, R>,
    ) -> Result<(), DispatchError>
    where
        Req: Clone + Send + Sync + 'static,
        R: Send + 'static,
    {
        let mut arms: Vec<BoxFuture<'static, FirstOutcome<R>>> = Vec::with_capacity(2);
        arms.push(open_first(Arc::clone(&self.primary), None, ctx.clone(), request.clone(), ops));
        if let Some(secondary) = secondary {
            arms.push(open_first(secondary.client, Some(secondary.name), ctx, request, ops));
        }

        let winner = loop {
            let (outcome, _index, remaining) = select_all(arms).await;
            arms = remaining;

            match outcome {
                FirstOutcome::First { secondary, first, rest } => {
                    break Winner::Streaming { secondary, first, rest };
                }
                FirstOutcome::Finished { secondary } => break Winner::Empty { secondary },
                FirstOutcome::Failed { secondary: Some(name), error }
                    if error.allows_primary_fallback() =>
                {
                    debug!(
                        secondary = %name,
                        error = %error,
                        "hedged secondary failed before its first response; primary takes over"
                    );
                }
                FirstOutcome::Failed { error, .. } => return Err(error),
            }
        };

        // The loser is cancelled here, before any further response from it
        // could be observed.
        drop(arms);

        match winner {
            Winner::Empty { secondary } => {
                debug!(secondary = ?secondary, "chosen producer finished without results");
                Ok(())
            }
            Winner::Streaming { secondary, first, rest } => {
                if let Some(name) = &secondary {
                    debug!(secondary = %name, "secondary chosen as stream producer");
                }
                forward_stream(secondary.as_deref(), first, rest, stream, ops).await
            }
        }
    }
}

/// Per-operation accessors that let the streaming procedure stay generic
/// over lookup-resources and lookup-subjects.
struct StreamingOps<Req, R> {
    open: fn(Arc<dyn DispatchClient>, Context, Req) -> BoxFuture<'static, Result<ResponseStream<R>, DispatchError>>,
    request_cursor: fn(&Req) -> Option<&Cursor>,
    set_request_cursor: fn(&mut Req, Option<Cursor>),
    take_response_cursor: fn(&mut R) -> Option<Cursor>,
    set_response_cursor: fn(&mut R, Cursor),
}

impl<Req, R> Clone for StreamingOps<Req, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Req, R> Copy for StreamingOps<Req, R> {}

enum FirstOutcome<R> {
    /// The producer emitted its first response; `rest` continues the stream.
    First { secondary: Option<String>, first: R, rest: ResponseStream<R> },
    /// The producer completed cleanly without emitting anything.
    Finished { secondary: Option<String> },
    /// The producer failed before emitting anything.
    Failed { secondary: Option<String>, error: DispatchError },
}

enum Winner<R> {
    Empty { secondary: Option<String> },
    Streaming { secondary: Option<String>, first: R, rest: ResponseStream<R> },
}

/// Opens a producer and waits for its first emission.
fn open_first<Req, R>(
    client: Arc<dyn DispatchClient>,
    secondary: Option<String>,
    ctx: Context,
    request: Req,
    ops: StreamingOps<Req, R>,
) -> BoxFuture<'static, FirstOutcome<R>>
where
    Req: Send + 'static,
    R: Send + 'static,
{
    Box::pin(async move {
        let mut producer = match (ops.open)(client, ctx, request).await {
            Ok(producer) => producer,
            Err(error) => return FirstOutcome::Failed { secondary, error },
        };
        match producer.next().await {
            Some(Ok(first)) => FirstOutcome::First { secondary, first, rest: producer },
            Some(Err(error)) => FirstOutcome::Failed { secondary, error },
            None => FirstOutcome::Finished { secondary },
        }
    })
}

/// Streams from a cursor-pinned secondary. Any failure is fatal: the
/// evaluator-internal cursor state lives on that peer, so falling back to
/// the primary would break continuity.
async fn consume_pinned<Req, R>(
    client: Arc<dyn DispatchClient>,
    name: String,
    ctx: Context,
    request: Req,
    stream: &dyn DispatchStream<R>,
    ops: StreamingOps<Req, R>,
) -> Result<(), DispatchError>
where
    Req: Send + 'static,
    R: Send + 'static,
{
    let mut producer = (ops.open)(client, ctx, request).await.map_err(|error| {
        warn!(secondary = %name, error = %error, "pinned secondary is unreachable");
        error
    })?;

    match producer.next().await {
        None => Ok(()),
        Some(Err(error)) => {
            warn!(secondary = %name, error = %error, "pinned secondary failed");
            Err(error)
        }
        Some(Ok(first)) => forward_stream(Some(name.as_str()), first, producer, stream, ops).await,
    }
}

/// Forwards the chosen producer's responses to the caller, annotating each
/// response cursor with the secondary routing tag when the producer is a
/// secondary. Errors after the first response are fatal regardless of
/// producer: continuity is already established.
async fn forward_stream<Req, R>(
    secondary: Option<&str>,
    first: R,
    mut rest: ResponseStream<R>,
    stream: &dyn DispatchStream<R>,
    ops: StreamingOps<Req, R>,
) -> Result<(), DispatchError>
where
    R: Send + 'static,
{
    let mut item = first;
    loop {
        if let Some(name) = secondary {
            if let Some(response_cursor) = (ops.take_response_cursor)(&mut item) {
                let pinned = cursor::pin_to_secondary(response_cursor, name)?;
                (ops.set_response_cursor)(&mut item, pinned);
            }
        }
        stream.send(item)?;

        match rest.next().await {
            Some(Ok(next)) => item = next,
            Some(Err(error)) => {
                warn!(secondary = ?secondary, error = %error, "chosen producer failed mid-stream");
                return Err(error);
            }
            None => return Ok(()),
        }
    }
}

fn open_check(
    client: Arc<dyn DispatchClient>,
    ctx: Context,
    request: CheckRequest,
) -> BoxFuture<'static, Result<CheckResponse, DispatchError>> {
    Box::pin(async move { client.check(&ctx, request).await })
}

fn open_expand(
    client: Arc<dyn DispatchClient>,
    ctx: Context,
    request: ExpandRequest,
) -> BoxFuture<'static, Result<ExpandResponse, DispatchError>> {
    Box::pin(async move { client.expand(&ctx, request).await })
}

fn open_lookup_resources(
    client: Arc<dyn DispatchClient>,
    ctx: Context,
    request: LookupResourcesRequest,
) -> BoxFuture<'static, Result<ResponseStream<LookupResourcesResponse>, DispatchError>> {
    Box::pin(async move { client.lookup_resources(&ctx, request).await })
}

fn open_lookup_subjects(
    client: Arc<dyn DispatchClient>,
    ctx: Context,
    request: LookupSubjectsRequest,
) -> BoxFuture<'static, Result<ResponseStream<LookupSubjectsResponse>, DispatchError>> {
    Box::pin(async move { client.lookup_subjects(&ctx, request).await })
}

const LOOKUP_RESOURCES_OPS: StreamingOps<LookupResourcesRequest, LookupResourcesResponse> =
    StreamingOps {
        open: open_lookup_resources,
        request_cursor: |request| request.cursor.as_ref(),
        set_request_cursor: |request, cursor| request.cursor = cursor,
        take_response_cursor: |response| Some(std::mem::take(&mut response.after_response_cursor)),
        set_response_cursor: |response, cursor| response.after_response_cursor = cursor,
    };

const LOOKUP_SUBJECTS_OPS: StreamingOps<LookupSubjectsRequest, LookupSubjectsResponse> =
    StreamingOps {
        open: open_lookup_subjects,
        request_cursor: |request| request.cursor.as_ref(),
        set_request_cursor: |request, cursor| request.cursor = cursor,
        take_response_cursor: |response| response.after_response_cursor.take(),
        set_response_cursor: |response, cursor| response.after_response_cursor = Some(cursor),
    };

#[async_trait]
impl Dispatcher for ClusterDispatcher {
    async fn dispatch_check(
        &self,
        ctx: &Context,
        request: CheckRequest,
    ) -> Result<CheckResponse, DispatchError> {
        ctx.check_active()?;
        check_depth_remaining(&request.metadata)?;

        let key = self.config.key_handler.check_key(&request);
        let targets = self.secondaries_for(RequestKind::Check, &request);
        debug!(key = %key, hedged = targets.len(), "dispatching check");

        let op_ctx = ctx.with_timeout(self.config.dispatch_overall_timeout);
        tokio::select! {
            err = op_ctx.done() => Err(err),
            result = self.race_unary(&op_ctx, request, targets, open_check) => result,
        }
    }

    async fn dispatch_expand(
        &self,
        ctx: &Context,
        request: ExpandRequest,
    ) -> Result<ExpandResponse, DispatchError> {
        ctx.check_active()?;
        check_depth_remaining(&request.metadata)?;

        let key = self.config.key_handler.expand_key(&request);
        let targets = self.secondaries_for(RequestKind::Expand, &request);
        debug!(key = %key, hedged = targets.len(), "dispatching expand");

        let op_ctx = ctx.with_timeout(self.config.dispatch_overall_timeout);
        tokio::select! {
            err = op_ctx.done() => Err(err),
            result = self.race_unary(&op_ctx, request, targets, open_expand) => result,
        }
    }

    async fn dispatch_lookup_resources(
        &self,
        ctx: &Context,
        request: LookupResourcesRequest,
        stream: &dyn DispatchStream<LookupResourcesResponse>,
    ) -> Result<(), DispatchError> {
        ctx.check_active()?;
        check_depth_remaining(&request.metadata)?;

        let key = self.config.key_handler.lookup_resources_key(&request);
        debug!(key = %key, "dispatching lookup-resources");

        self.dispatch_streaming_operation(
            ctx,
            RequestKind::LookupResources,
            request,
            stream,
            LOOKUP_RESOURCES_OPS,
        )
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

        let key = self.config.key_handler.lookup_subjects_key(&request);
        debug!(key = %key, "dispatching lookup-subjects");

        self.dispatch_streaming_operation(
            ctx,
            RequestKind::LookupSubjects,
            request,
            stream,
            LOOKUP_SUBJECTS_OPS,
        )
        .await
    }

    fn ready_state(&self) -> ReadyState {
        if self.primary.is_ready() {
            ReadyState::ready()
        } else {
            ReadyState::not_ready("primary dispatch connection is not ready")
        }
    }

    async fn close(&self) {
        self.primary.close();
        for secondary in self.secondaries.values() {
            secondary.client.close();
        }
    }
}
