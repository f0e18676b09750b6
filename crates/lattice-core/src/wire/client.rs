//! Peer dispatch client over the framed TCP protocol.
//!
//! One background task owns the connection: it writes request envelopes and
//! demultiplexes inbound response frames by request id into per-request
//! channels. Dropping a streaming response mid-way sends a `Cancel` frame
//! so the server stops producing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatch::client::{DispatchClient, ResponseStream};
use crate::dispatch::context::Context;
use crate::dispatch::errors::DispatchError;
use crate::types::{
    CheckRequest, CheckResponse, ExpandRequest, ExpandResponse, LookupResourcesRequest,
    LookupResourcesResponse, LookupSubjectsRequest, LookupSubjectsResponse,
};

use super::framing::FrameCodec;
use super::proto::{self, RequestBody, RequestEnvelope, ResponseBody, ResponseFrame};

/// A [`DispatchClient`] backed by one framed TCP connection to a peer.
pub struct WireDispatchClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    peer: String,
    writer_tx: mpsc::UnboundedSender<RequestEnvelope>,
    pending: DashMap<u64, mpsc::UnboundedSender<ResponseBody>>,
    next_id: AtomicU64,
    ready: AtomicBool,
    shutdown: CancellationToken,
}

impl WireDispatchClient {
    /// Dials a peer and starts the connection task.
    pub async fn connect(address: &str) -> Result<Self, DispatchError> {
        let stream = TcpStream::connect(address).await.map_err(|e| {
            DispatchError::Unavailable(format!("failed to connect to {address}: {e}"))
        })?;
        Ok(Self::from_stream(stream, address))
    }

    /// Wraps an established connection, for tests and in-process loopback.
    #[must_use]
    pub fn from_stream(stream: TcpStream, peer: &str) -> Self {
        let framed = Framed::new(stream, FrameCodec::new());
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            peer: peer.to_string(),
            writer_tx,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            ready: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
        });

        let shutdown = inner.shutdown.clone();
        tokio::spawn(run_connection(Arc::downgrade(&inner), framed, writer_rx, shutdown));

        Self { inner }
    }

    async fn call_unary(
        &self,
        ctx: &Context,
        body: RequestBody,
    ) -> Result<ResponseBody, DispatchError> {
        ctx.check_active()?;

        let (id, mut rx) = self.inner.register();
        self.inner.send_request(id, ctx, body)?;

        let outcome = tokio::select! {
            err = ctx.done() => Err(err),
            received = rx.recv() => match received {
                Some(ResponseBody::Error { code, message }) => {
                    Err(DispatchError::from_wire(code, message))
                }
                Some(body) => Ok(body),
                None => Err(DispatchError::Unavailable(format!(
                    "connection to {} closed mid-request",
                    self.inner.peer
                ))),
            },
        };

        if outcome.is_err() {
            self.inner.deregister_and_cancel(id);
        } else {
            self.inner.pending.remove(&id);
        }
        outcome
    }

    fn open_stream<T: Send + 'static>(
        &self,
        ctx: &Context,
        body: RequestBody,
        extract: fn(ResponseBody) -> StreamEvent<T>,
    ) -> Result<ResponseStream<T>, DispatchError> {
        ctx.check_active()?;

        let (id, rx) = self.inner.register();
        self.inner.send_request(id, ctx, body)?;

        let state = StreamState {
            inner: Arc::clone(&self.inner),
            id,
            rx,
            ctx: ctx.clone(),
            finished: false,
        };

        let stream = futures::stream::unfold(state, move |mut state| async move {
            if state.finished {
                return None;
            }

            let item = tokio::select! {
                err = state.ctx.done() => {
                    state.finished = true;
                    Err(err)
                }
                received = state.rx.recv() => match received {
                    Some(body) => match extract(body) {
                        StreamEvent::Item(item) => Ok(item),
                        StreamEvent::Done => {
                            state.finished = true;
                            return None;
                        }
                        StreamEvent::Error(error) => {
                            state.finished = true;
                            Err(error)
                        }
                    },
                    None => {
                        state.finished = true;
                        Err(DispatchError::Unavailable(format!(
                            "connection to {} closed mid-stream",
                            state.inner.peer
                        )))
                    }
                },
            };

            Some((item, state))
        });

        Ok(Box::pin(stream))
    }
}

impl Drop for WireDispatchClient {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[async_trait]
impl DispatchClient for WireDispatchClient {
    async fn check(
        &self,
        ctx: &Context,
        request: CheckRequest,
    ) -> Result<CheckResponse, DispatchError> {
        match self.call_unary(ctx, RequestBody::Check(request)).await? {
            ResponseBody::Check(response) => Ok(response),
            other => Err(unexpected_frame("check", &other)),
        }
    }

    async fn expand(
        &self,
        ctx: &Context,
        request: ExpandRequest,
    ) -> Result<ExpandResponse, DispatchError> {
        match self.call_unary(ctx, RequestBody::Expand(request)).await? {
            ResponseBody::Expand(response) => Ok(response),
            other => Err(unexpected_frame("expand", &other)),
        }
    }

    async fn lookup_resources(
        &self,
        ctx: &Context,
        request: LookupResourcesRequest,
    ) -> Result<ResponseStream<LookupResourcesResponse>, DispatchError> {
        self.open_stream(ctx, RequestBody::LookupResources(request), |body| match body {
            ResponseBody::LookupResourcesItem(item) => StreamEvent::Item(item),
            other => terminal_event("lookup_resources", other),
        })
    }

    async fn lookup_subjects(
        &self,
        ctx: &Context,
        request: LookupSubjectsRequest,
    ) -> Result<ResponseStream<LookupSubjectsResponse>, DispatchError> {
        self.open_stream(ctx, RequestBody::LookupSubjects(request), |body| match body {
            ResponseBody::LookupSubjectsItem(item) => StreamEvent::Item(item),
            other => terminal_event("lookup_subjects", other),
        })
    }

    fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.inner.ready.store(false, Ordering::SeqCst);
        self.inner.shutdown.cancel();
    }
}

impl ClientInner {
    fn register(&self) -> (u64, mpsc::UnboundedReceiver<ResponseBody>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(id, tx);
        (id, rx)
    }

    fn send_request(&self, id: u64, ctx: &Context, body: RequestBody) -> Result<(), DispatchError> {
        if !self.ready.load(Ordering::SeqCst) {
            self.pending.remove(&id);
            return Err(DispatchError::Unavailable(format!(
                "connection to {} is closed",
                self.peer
            )));
        }

        let envelope = RequestEnvelope {
            id,
            timeout_millis: ctx.remaining().map(|d| d.as_millis() as u64),
            body,
        };
        self.writer_tx.send(envelope).map_err(|_| {
            self.pending.remove(&id);
            DispatchError::Unavailable(format!("connection to {} is closed", self.peer))
        })
    }

    /// Removes an in-flight request and tells the server to stop working
    /// on it. Safe to call more than once per id.
    fn deregister_and_cancel(&self, id: u64) {
        if self.pending.remove(&id).is_some() {
            let _ = self.writer_tx.send(RequestEnvelope {
                id,
                timeout_millis: None,
                body: RequestBody::Cancel,
            });
        }
    }

    fn route(&self, frame: ResponseFrame) {
        let terminal = matches!(frame.body, ResponseBody::Done | ResponseBody::Error { .. });

        let delivered = if terminal {
            self.pending
                .remove(&frame.id)
                .map(|(_, tx)| tx.send(frame.body).is_ok())
                .unwrap_or(false)
        } else {
            match self.pending.get(&frame.id) {
                Some(tx) => tx.send(frame.body.clone()).is_ok(),
                None => false,
            }
        };

        if !delivered && !terminal {
            // The caller abandoned this request; stop the server side too.
            self.deregister_and_cancel(frame.id);
        }
    }

    fn fail_all_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let closed = DispatchError::Unavailable(format!(
                    "connection to {} closed",
                    self.peer
                ));
                let _ = tx.send(ResponseBody::from_error(&closed));
            }
        }
    }
}

struct StreamState {
    inner: Arc<ClientInner>,
    id: u64,
    rx: mpsc::UnboundedReceiver<ResponseBody>,
    ctx: Context,
    finished: bool,
}

impl Drop for StreamState {
    fn drop(&mut self) {
        // No-op when the stream already terminated: the pending entry is
        // gone and deregistering does nothing.
        self.inner.deregister_and_cancel(self.id);
    }
}

enum StreamEvent<T> {
    Item(T),
    Done,
    Error(DispatchError),
}

fn terminal_event<T>(operation: &'static str, body: ResponseBody) -> StreamEvent<T> {
    match body {
        ResponseBody::Done => StreamEvent::Done,
        ResponseBody::Error { code, message } => {
            StreamEvent::Error(DispatchError::from_wire(code, message))
        }
        other => StreamEvent::Error(unexpected_frame(operation, &other)),
    }
}

fn unexpected_frame(operation: &str, body: &ResponseBody) -> DispatchError {
    DispatchError::Internal(format!(
        "unexpected response frame {body:?} for {operation}"
    ))
}

async fn run_connection(
    inner: Weak<ClientInner>,
    framed: Framed<TcpStream, FrameCodec>,
    mut writer_rx: mpsc::UnboundedReceiver<RequestEnvelope>,
    shutdown: CancellationToken,
) {
    let (mut sink, mut source) = framed.split();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            outbound = writer_rx.recv() => {
                let Some(envelope) = outbound else { break };
                match proto::encode_request(&envelope) {
                    Ok(bytes) => {
                        if let Err(error) = sink.send(bytes).await {
                            warn!(error = %error, "failed to write request frame");
                            break;
                        }
                    }
                    Err(error) => warn!(error = %error, "dropping unencodable request"),
                }
            }
            inbound = source.next() => {
                match inbound {
                    Some(Ok(payload)) => {
                        let Some(inner) = inner.upgrade() else { break };
                        match proto::decode_response(&payload) {
                            Ok(frame) => inner.route(frame),
                            Err(error) => {
                                warn!(error = %error, "dropping undecodable response frame");
                            }
                        }
                    }
                    Some(Err(error)) => {
                        warn!(error = %error, "dispatch connection failed");
                        break;
                    }
                    None => {
                        debug!("dispatch connection closed by peer");
                        break;
                    }
                }
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.ready.store(false, Ordering::SeqCst);
        inner.fail_all_pending();
    }
    let _ = sink.close().await;
}
