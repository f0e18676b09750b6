//! Serves a [`Dispatcher`] over the framed peer protocol.
//!
//! Each connection gets a read loop and a writer task; each request runs in
//! its own task with a request-scoped [`Context`]. A `Cancel` frame (or the
//! connection closing) cancels the corresponding context, which every
//! dispatch operation observes.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::context::Context;
use crate::dispatch::errors::DispatchError;
use crate::dispatch::stream::DispatchStream;
use crate::dispatch::Dispatcher;
use crate::types::{LookupResourcesResponse, LookupSubjectsResponse};

use super::framing::{FrameCodec, FrameError};
use super::proto::{self, RequestBody, RequestEnvelope, ResponseBody, ResponseFrame};

/// Accept loop: serves the dispatcher to every inbound peer connection
/// until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<dyn Dispatcher>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!(address = ?listener.local_addr().ok(), "dispatch server listening");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("dispatch server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "accepted dispatch connection");

                let dispatcher = Arc::clone(&dispatcher);
                let conn_shutdown = shutdown.child_token();
                tokio::spawn(async move {
                    if let Err(error) = serve_connection(stream, dispatcher, conn_shutdown).await {
                        warn!(%peer, error = %error, "dispatch connection ended with error");
                    }
                });
            }
        }
    }
}

/// Serves a single established connection.
pub async fn serve_connection(
    stream: TcpStream,
    dispatcher: Arc<dyn Dispatcher>,
    shutdown: CancellationToken,
) -> Result<(), FrameError> {
    let framed = Framed::new(stream, FrameCodec::new());
    let (mut sink, mut source) = framed.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ResponseFrame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match proto::encode_response(&frame) {
                Ok(bytes) => {
                    if sink.send(bytes).await.is_err() {
                        break;
                    }
                }
                Err(error) => warn!(error = %error, "failed to encode response frame"),
            }
        }
        let _ = sink.close().await;
    });

    let inflight: Arc<DashMap<u64, Context>> = Arc::new(DashMap::new());

    let result = loop {
        tokio::select! {
            () = shutdown.cancelled() => break Ok(()),
            frame = source.next() => match frame {
                None => break Ok(()),
                Some(Err(error)) => break Err(error),
                Some(Ok(payload)) => match proto::decode_request(&payload) {
                    Ok(envelope) => handle_envelope(envelope, &dispatcher, &out_tx, &inflight),
                    Err(error) => warn!(error = %error, "dropping undecodable request frame"),
                },
            },
        }
    };

    for entry in inflight.iter() {
        entry.value().cancel();
    }
    drop(out_tx);
    let _ = writer.await;
    result
}

fn handle_envelope(
    envelope: RequestEnvelope,
    dispatcher: &Arc<dyn Dispatcher>,
    out: &mpsc::UnboundedSender<ResponseFrame>,
    inflight: &Arc<DashMap<u64, Context>>,
) {
    let RequestEnvelope { id, timeout_millis, body } = envelope;

    if matches!(body, RequestBody::Cancel) {
        if let Some((_, ctx)) = inflight.remove(&id) {
            debug!(request_id = id, "cancelling in-flight dispatch");
            ctx.cancel();
        }
        return;
    }

    let ctx = match timeout_millis {
        Some(millis) => Context::background().with_timeout(Duration::from_millis(millis)),
        None => Context::background(),
    };
    inflight.insert(id, ctx.clone());

    debug!(request_id = id, operation = body.operation(), "dispatching peer request");

    let dispatcher = Arc::clone(dispatcher);
    let out = out.clone();
    let inflight = Arc::clone(inflight);
    tokio::spawn(async move {
        let final_body = match run_operation(dispatcher.as_ref(), &ctx, id, body, &out).await {
            Ok(body) => body,
            Err(error) => ResponseBody::from_error(&error),
        };
        let _ = out.send(ResponseFrame { id, body: final_body });
        inflight.remove(&id);
    });
}

async fn run_operation(
    dispatcher: &dyn Dispatcher,
    ctx: &Context,
    id: u64,
    body: RequestBody,
    out: &mpsc::UnboundedSender<ResponseFrame>,
) -> Result<ResponseBody, DispatchError> {
    match body {
        RequestBody::Check(request) => dispatcher
            .dispatch_check(ctx, request)
            .await
            .map(ResponseBody::Check),
        RequestBody::Expand(request) => dispatcher
            .dispatch_expand(ctx, request)
            .await
            .map(ResponseBody::Expand),
        RequestBody::LookupResources(request) => {
            let stream: FrameDispatchStream<LookupResourcesResponse> = FrameDispatchStream {
                ctx: ctx.clone(),
                id,
                out: out.clone(),
                wrap: ResponseBody::LookupResourcesItem,
            };
            dispatcher
                .dispatch_lookup_resources(ctx, request, &stream)
                .await
                .map(|()| ResponseBody::Done)
        }
        RequestBody::LookupSubjects(request) => {
            let stream: FrameDispatchStream<LookupSubjectsResponse> = FrameDispatchStream {
                ctx: ctx.clone(),
                id,
                out: out.clone(),
                wrap: ResponseBody::LookupSubjectsItem,
            };
            dispatcher
                .dispatch_lookup_subjects(ctx, request, &stream)
                .await
                .map(|()| ResponseBody::Done)
        }
        RequestBody::Cancel => Err(DispatchError::Internal(
            "cancel frames are handled by the connection loop".into(),
        )),
    }
}

/// Forwards streamed responses to the connection writer as item frames.
struct FrameDispatchStream<R> {
    ctx: Context,
    id: u64,
    out: mpsc::UnboundedSender<ResponseFrame>,
    wrap: fn(R) -> ResponseBody,
}

impl<R: Send> DispatchStream<R> for FrameDispatchStream<R> {
    fn send(&self, response: R) -> Result<(), DispatchError> {
        self.ctx.check_active()?;
        self.out
            .send(ResponseFrame { id: self.id, body: (self.wrap)(response) })
            .map_err(|_| DispatchError::Unavailable("client connection closed".into()))
    }

    fn context(&self) -> &Context {
        &self.ctx
    }
}
