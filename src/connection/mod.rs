//! Message-level connection over a framed byte stream.
//!
//! A [`Connection`] owns one writer task and one read loop:
//!
//! ```text
//!                    ┌──────────────── Connection ────────────────┐
//! send_request ──►   │ PendingCalls ─► WriterHandle ─► writer task │ ─► stream
//!                    │                                             │
//! stream ──► read ─► │ route: response ─► PendingCalls (complete)  │
//!           loop     │        request  ─► Relay | RequestHandler   │
//!                    │        event    ─► SubscriptionManager      │
//!                    └─────────────────────────────────────────────┘
//! ```
//!
//! Any read or write error, an undecodable envelope, or EOF fails the
//! connection exactly once: pending calls complete with
//! [`RpcError::ConnectionLost`], subscriptions cascade, the handler is told and
//! [`Connection::lost`] resolves.

mod config;
mod pending;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use config::{
    ConnectionConfig, DEFAULT_KEEP_ALIVE_INTERVAL, DEFAULT_MAX_PENDING_CALLS, ENV_KEEP_ALIVE_MS,
    ENV_MAX_FRAME_SIZE, ENV_MAX_PENDING_CALLS,
};

use self::pending::{PendingCalls, PendingGuard};
use crate::address::{Address, AddressCache};
use crate::codec::{Codec, DefaultCodec};
use crate::error::{RemoteFault, Result, RpcError};
use crate::events::{SubscriptionBatch, SubscriptionManager};
use crate::ipc::{ConnectorState, Phases};
use crate::message::{
    CallId, Message, MessageKind, RemoteCallCancellationRequest, RemoteCallFailureResponse,
    RemoteCallRequest, RemoteCallSuccessResponse, Wrap, WrappedMessage,
};
use crate::protocol::{ControlCode, Frame, FrameReader};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Process-unique connection id.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A request delivered to a [`RequestHandler`].
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Call request, event registration or cancellation, with destination and
    /// call id attached.
    pub message: Message,
    /// Client id stamped by a relay, echoed on the response.
    pub source_connection_id: Option<u64>,
}

/// Receives requests addressed to endpoints hosted on this side.
///
/// Called from the read loop: implementations must not block, and should
/// spawn any real work.
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one request. Responses go back through [`Connection::respond`].
    fn handle(&self, connection: &Connection, request: InboundRequest);

    /// The connection failed or was closed.
    fn connection_lost(&self, _connection: &Connection, _cause: &RpcError) {}
}

/// Forwards envelopes without decoding their bodies.
///
/// When a relay is installed it receives every request and event, plus any
/// response that does not match a call made on this connection.
pub trait Relay: Send + Sync + 'static {
    /// Forward one envelope that arrived on `from`.
    fn relay(&self, from: &Connection, message: WrappedMessage);

    /// `connection` failed or was closed.
    fn connection_lost(&self, _connection: &Connection, _cause: &RpcError) {}
}

/// Configures and starts a [`Connection`].
#[derive(Clone, Default)]
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    handler: Option<Arc<dyn RequestHandler>>,
    relay: Option<Arc<dyn Relay>>,
    remote_address: Option<Address>,
}

impl ConnectionBuilder {
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve incoming requests with `handler`.
    pub fn handler<H: RequestHandler>(mut self, handler: Arc<H>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Forward incoming traffic through `relay` instead of handling it.
    pub fn relay<T: Relay>(mut self, relay: Arc<T>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Address of the remote side; the subscription tree is rooted at its
    /// cluster. Defaults to `/`.
    pub fn remote_address(mut self, address: Address) -> Self {
        self.remote_address = Some(address);
        self
    }

    pub(crate) fn max_frame_size(&self) -> u32 {
        self.config.max_frame_size
    }

    /// Start the writer task and read loop over a raw byte stream.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn<R, W>(self, reader: R, writer: W) -> Connection
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let reader = FrameReader::new(reader, self.config.max_frame_size);
        self.spawn_framed(reader, writer, None)
    }

    pub(crate) fn spawn_framed<R, W>(
        self,
        reader: FrameReader<R>,
        writer: W,
        phases: Option<Arc<Phases>>,
    ) -> Connection
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (writer, writer_task) = spawn_writer_task(writer, self.config.writer_config());
        let remote_address = self.remote_address.unwrap_or_else(Address::root);

        let inner = Arc::new(ConnectionInner {
            id,
            pending: PendingCalls::new(self.config.max_pending_calls),
            addresses: AddressCache::new(self.config.address_cache_capacity),
            subscriptions: SubscriptionManager::new(remote_address.clone()),
            remote_address,
            config: self.config,
            writer,
            handler: self.handler,
            relay: self.relay,
            last_received: Mutex::new(Instant::now()),
            lost: CancellationToken::new(),
            failure: OnceLock::new(),
            shutdown: CancellationToken::new(),
            phases,
        });

        tokio::spawn(supervise_writer(Arc::downgrade(&inner), writer_task));

        let connection = Connection { inner };
        tokio::spawn(read_loop(connection.clone(), reader));
        tracing::debug!(connection_id = id, "Connection started");
        connection
    }
}

struct ConnectionInner {
    id: ConnectionId,
    config: ConnectionConfig,
    writer: WriterHandle,
    pending: PendingCalls,
    addresses: AddressCache,
    subscriptions: SubscriptionManager,
    remote_address: Address,
    handler: Option<Arc<dyn RequestHandler>>,
    relay: Option<Arc<dyn Relay>>,
    last_received: Mutex<Instant>,
    lost: CancellationToken,
    failure: OnceLock<Arc<RpcError>>,
    shutdown: CancellationToken,
    phases: Option<Arc<Phases>>,
}

/// A live connection. Cheap to clone; all clones share one stream.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_address", &self.inner.remote_address)
            .field("lost", &self.is_lost())
            .finish()
    }
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::default()
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn remote_address(&self) -> &Address {
        &self.inner.remote_address
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Address cache shared by everything decoded on this connection.
    pub fn addresses(&self) -> &AddressCache {
        &self.inner.addresses
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.inner.subscriptions
    }

    /// When the last frame (of any kind) arrived.
    pub fn last_received(&self) -> Instant {
        *self.inner.last_received.lock()
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_lost(&self) -> bool {
        self.inner.failure.get().is_some()
    }

    /// Resolves with the cause once the connection has failed or closed.
    pub async fn lost(&self) -> Arc<RpcError> {
        self.inner.lost.cancelled().await;
        match self.inner.failure.get() {
            Some(cause) => cause.clone(),
            None => Arc::new(RpcError::ConnectionClosed),
        }
    }

    fn lost_error(&self) -> RpcError {
        match self.inner.failure.get() {
            Some(cause) => RpcError::ConnectionLost(cause.clone()),
            None => RpcError::ConnectionLost(Arc::new(RpcError::ConnectionClosed)),
        }
    }

    /// Send a request and wait for its outcome message.
    ///
    /// Fails without touching the wire when the message expects no response,
    /// cannot be encoded, or the connection is already lost. A call id is
    /// assigned when the message has none. For cancellable calls the first
    /// firing of `cancellation` (or the request's deadline) sends one
    /// cancellation request and the call keeps waiting for the peer's answer.
    /// Dropping the future forgets the call.
    pub async fn send_request(
        &self,
        mut message: Message,
        cancellation: CancellationToken,
    ) -> Result<Message> {
        if !message.expects_response() {
            return Err(RpcError::Protocol(format!(
                "{:?} does not expect a response",
                message.kind()
            )));
        }
        if self.is_lost() {
            return Err(self.lost_error());
        }

        let call_id = match message.call_id() {
            Some(id) => id,
            None => {
                let id = self.inner.pending.next_id();
                message.set_call_id(id);
                id
            }
        };
        let frame = OutboundFrame::data(message.wrap::<DefaultCodec>()?.encode::<DefaultCodec>()?)?;

        let cancellable = message.is_cancellable();
        let destination = message.destination().cloned();
        let deadline = match &message {
            Message::CallRequest(request) => request.remaining().map(|left| Instant::now() + left),
            _ => None,
        };

        let mut rx = self.inner.pending.register(call_id)?;
        let _guard = PendingGuard::new(&self.inner.pending, call_id);
        self.inner.writer.send(frame).await?;
        tracing::trace!(call_id, connection_id = self.id(), kind = ?message.kind(), "Request sent");

        let cancellation = cancellation.child_token();
        let mut deadline = deadline;
        let mut cancel_sent = false;
        let mut grace: Option<Instant> = None;

        loop {
            tokio::select! {
                outcome = &mut rx => {
                    return match outcome {
                        Ok(result) => result,
                        Err(_) => Err(self.lost_error()),
                    };
                }
                _ = cancellation.cancelled(), if cancellable && !cancel_sent => {
                    cancel_sent = true;
                    tracing::debug!(call_id, "Forwarding cancellation");
                    let cancel = Message::Cancellation(RemoteCallCancellationRequest {
                        call_id,
                        destination: destination.clone(),
                    });
                    if let Err(e) = self.send_one_way(cancel).await {
                        tracing::debug!(call_id, error = %e, "Cancellation not sent");
                    }
                    grace = self.inner.config.cancel_grace_period.map(|p| Instant::now() + p);
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    tracing::debug!(call_id, "Call deadline reached");
                    deadline = None;
                    cancellation.cancel();
                }
                _ = sleep_until(grace), if grace.is_some() => {
                    tracing::debug!(call_id, "Peer silent after cancellation, resolving locally");
                    return Err(RpcError::Cancelled);
                }
            }
        }
    }

    /// Invoke a remote method and decode its result.
    pub async fn call<R: DeserializeOwned>(
        &self,
        request: RemoteCallRequest,
        cancellation: CancellationToken,
    ) -> Result<R> {
        let reply = self
            .send_request(Message::CallRequest(request), cancellation)
            .await?;
        decode_outcome::<DefaultCodec, R>(reply)
    }

    /// Enqueue a message that expects no tracked response.
    pub async fn send_one_way(&self, message: Message) -> Result<()> {
        self.send_wrapped(message.wrap::<DefaultCodec>()?).await
    }

    /// Enqueue an already wrapped envelope.
    pub async fn send_wrapped(&self, wrapped: WrappedMessage) -> Result<()> {
        if self.is_lost() {
            return Err(self.lost_error());
        }
        let frame = OutboundFrame::data(wrapped.encode::<DefaultCodec>()?)?;
        self.inner.writer.send(frame).await
    }

    /// Send a response, echoing the request's `source_connection_id`.
    pub async fn respond(&self, message: Message, source_connection_id: Option<u64>) -> Result<()> {
        let mut wrapped = message.wrap::<DefaultCodec>()?;
        wrapped.source_connection_id = source_connection_id;
        self.send_wrapped(wrapped).await
    }

    /// Apply a subscription batch, sending registration deltas to the peer.
    pub async fn change_subscriptions(&self, batch: SubscriptionBatch) -> Result<()> {
        self.inner.subscriptions.apply(self, batch).await
    }

    /// Flush queued frames, then fail outstanding calls with
    /// `ConnectionLost(ConnectionClosed)` and release the stream.
    pub async fn close(&self) {
        if self.is_lost() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.writer.close();
        self.inner.writer.finished().await;
        self.fail(RpcError::ConnectionClosed);
    }

    /// Two-phase teardown for connections made by the IPC connector; a plain
    /// close otherwise.
    pub async fn teardown(&self) -> Result<()> {
        match self.inner.phases.clone() {
            Some(phases) => phases.teardown(self).await,
            None => {
                self.close().await;
                Ok(())
            }
        }
    }

    /// Handshake and teardown phase, for connections made by the IPC
    /// connector.
    pub fn connector_state(&self) -> Option<ConnectorState> {
        self.inner.phases.as_ref().map(|phases| phases.state())
    }

    pub(crate) fn writer(&self) -> &WriterHandle {
        &self.inner.writer
    }

    /// Fail the connection. Only the first call has any effect.
    pub(crate) fn fail(&self, cause: RpcError) {
        let cause = match cause {
            RpcError::ConnectionLost(inner) => inner,
            other => Arc::new(other),
        };
        if self.inner.failure.set(cause.clone()).is_err() {
            return;
        }

        match &*cause {
            RpcError::ConnectionClosed => {
                tracing::debug!(connection_id = self.id(), "Connection closed")
            }
            other => tracing::warn!(connection_id = self.id(), error = %other, "Connection lost"),
        }

        self.inner.shutdown.cancel();
        self.inner
            .writer
            .abort(RpcError::ConnectionLost(cause.clone()));
        let failed = self.inner.pending.fail_all(&cause);
        if failed > 0 {
            tracing::debug!(connection_id = self.id(), failed, "Failed pending calls");
        }
        self.inner.subscriptions.connection_failed();
        if let Some(handler) = &self.inner.handler {
            handler.connection_lost(self, &cause);
        }
        if let Some(relay) = &self.inner.relay {
            relay.connection_lost(self, &cause);
        }
        if let Some(phases) = &self.inner.phases {
            phases.closed();
        }
        self.inner.lost.cancel();
    }

    fn is_tearing_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
            || self
                .inner
                .phases
                .as_ref()
                .is_some_and(|phases| phases.is_tearing_down())
    }

    fn dispatch_frame(&self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Code(ControlCode::KeepAlive) => {
                tracing::trace!(connection_id = self.id(), "Keep-alive received");
            }
            Frame::Code(code @ (ControlCode::Teardown1 | ControlCode::Teardown2)) => {
                match &self.inner.phases {
                    Some(phases) => phases.on_code(self, code),
                    None => tracing::warn!(?code, "Teardown code on a connection without phases"),
                }
            }
            Frame::Code(code) => {
                tracing::warn!(connection_id = self.id(), ?code, "Ignoring unexpected code frame");
            }
            Frame::Data(payload) => {
                let wrapped = WrappedMessage::decode::<DefaultCodec>(&payload)?;
                self.route(wrapped);
            }
        }
        Ok(())
    }

    fn route(&self, mut wrapped: WrappedMessage) {
        if wrapped.is_response() {
            // Relayed responses belong to a client of the relay, never to us.
            let completion = match wrapped.source_connection_id {
                None => wrapped.call_id().and_then(|id| self.inner.pending.take(id)),
                Some(_) => None,
            };
            if let Some(tx) = completion {
                let _ = tx.send(wrapped.open::<DefaultCodec>());
                return;
            }
            if self.inner.relay.is_none() {
                tracing::debug!(call_id = wrapped.call_id, "Discarding response for unknown call");
                return;
            }
        }

        if let Some(relay) = &self.inner.relay {
            if wrapped.source_connection_id.is_none() {
                wrapped.source_connection_id = Some(self.id());
            }
            relay.relay(self, wrapped);
            return;
        }

        let message = match wrapped.open::<DefaultCodec>() {
            Ok(message) => message,
            Err(e) => {
                self.reject(&wrapped, e);
                return;
            }
        };

        match message {
            Message::EventRaised(mut event) => {
                event.endpoint = self.inner.addresses.intern(event.endpoint);
                self.inner.subscriptions.on_event(event);
            }
            Message::EndpointLost(lost) => {
                tracing::debug!(address = %lost.endpoint_address, "Endpoint lost");
                self.inner.subscriptions.on_endpoint_lost(&lost.endpoint_address);
            }
            mut request => {
                if let Some(destination) = request.destination().cloned() {
                    request.set_destination(Some(self.inner.addresses.intern(destination)));
                }
                let request = InboundRequest {
                    message: request,
                    source_connection_id: wrapped.source_connection_id,
                };
                match &self.inner.handler {
                    Some(handler) => handler.handle(self, request),
                    None => self.no_handler(request),
                }
            }
        }
    }

    fn no_handler(&self, request: InboundRequest) {
        let Some(call_id) = request.message.call_id() else {
            return;
        };
        if !request.message.expects_response() {
            return;
        }
        let endpoint = request
            .message
            .destination()
            .map(|d| d.to_string())
            .unwrap_or_default();
        tracing::debug!(call_id, %endpoint, "No request handler installed");
        self.respond_failure(
            call_id,
            RemoteFault::from(&RpcError::EndpointNotFound(endpoint)),
            request.source_connection_id,
        );
    }

    /// A request whose body could not be decoded.
    fn reject(&self, wrapped: &WrappedMessage, error: RpcError) {
        tracing::warn!(
            connection_id = self.id(),
            kind = ?wrapped.kind,
            error = %error,
            "Undecodable message body"
        );
        let expects_response = matches!(
            wrapped.kind,
            MessageKind::CallRequest | MessageKind::EventRegistration
        );
        if let (true, Some(call_id)) = (expects_response, wrapped.call_id()) {
            self.respond_failure(
                call_id,
                RemoteFault::from(&error),
                wrapped.source_connection_id,
            );
        }
    }

    fn respond_failure(&self, call_id: CallId, error: RemoteFault, source: Option<u64>) {
        let connection = self.clone();
        tokio::spawn(async move {
            let reply = Message::Failure(RemoteCallFailureResponse { call_id, error });
            if let Err(e) = connection.respond(reply, source).await {
                tracing::debug!(call_id, error = %e, "Failure response not sent");
            }
        });
    }
}

/// Map an outcome message to the success body.
pub(crate) fn into_success(message: Message) -> Result<RemoteCallSuccessResponse> {
    match message {
        Message::Success(success) => Ok(success),
        Message::Failure(failure) => Err(RpcError::RemoteFault(failure.error)),
        Message::Cancelled(_) => Err(RpcError::Cancelled),
        other => Err(RpcError::Protocol(format!(
            "unexpected {:?} as call outcome",
            other.kind()
        ))),
    }
}

/// Map an outcome message to a decoded result.
pub(crate) fn decode_outcome<C: Codec, R: DeserializeOwned>(message: Message) -> Result<R> {
    into_success(message)?.decode::<C, R>()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn read_loop<R>(connection: Connection, mut reader: FrameReader<R>)
where
    R: AsyncRead + Unpin,
{
    let shutdown = connection.inner.shutdown.clone();
    let outcome = loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break Ok(()),
            frame = reader.next_frame() => frame,
        };
        match frame {
            Ok(Some(frame)) => {
                *connection.inner.last_received.lock() = Instant::now();
                if let Err(e) = connection.dispatch_frame(frame) {
                    break Err(e);
                }
            }
            Ok(None) if connection.is_tearing_down() => break Err(RpcError::ConnectionClosed),
            Ok(None) => break Err(RpcError::StreamClosed),
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = outcome {
        connection.fail(e);
    }
    tracing::trace!(connection_id = connection.id(), "Read loop exited");
}

async fn supervise_writer(inner: Weak<ConnectionInner>, task: JoinHandle<Result<()>>) {
    let outcome = task.await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let connection = Connection { inner };
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => connection.fail(e),
        Err(join) => connection.fail(RpcError::Io(std::io::Error::other(join))),
    }
}
