//! Parent-side multiplexing of client connections onto one child pipe.
//!
//! ```text
//! client A ─┐                      ┌── source=A ──┐
//! client B ─┼─► ProcessRouter ─────┤              ├──► child pipe
//! client C ─┘   (stamp source id)  └── source=C ──┘
//! ```
//!
//! Requests from a client are forwarded to the child stamped with the client's
//! connection id. Whatever the child sends back carries that id and is routed
//! to the matching client with the id cleared.
//!
//! Each target connection is fed through one [`Outbox`], so envelopes reach a
//! connection in the order the router saw them. Requests waiting on the child
//! are remembered until their outcome passes back; if the child goes away
//! first, the router answers them itself.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::address::Address;
use crate::codec::DefaultCodec;
use crate::connection::{Connection, ConnectionBuilder, ConnectionId, Relay};
use crate::error::{RemoteFault, RpcError};
use crate::message::{
    CallId, EndpointLostMessage, Message, MessageKind, RemoteCallFailureResponse, Wrap,
    WrappedMessage,
};

/// Routing stamp of an envelope, kept for error handling after it is sent.
#[derive(Debug, Clone, Copy)]
struct Stamp {
    source: Option<ConnectionId>,
    call_id: Option<CallId>,
    kind: MessageKind,
}

impl Stamp {
    fn of(message: &WrappedMessage) -> Self {
        Self {
            source: message.source_connection_id,
            call_id: message.call_id(),
            kind: message.kind,
        }
    }

    fn expects_response(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::CallRequest | MessageKind::EventRegistration
        )
    }
}

/// FIFO path to one connection, drained by a single task.
#[derive(Clone)]
struct Outbox {
    tx: mpsc::UnboundedSender<WrappedMessage>,
}

impl Outbox {
    fn open<F>(target: Connection, on_error: F) -> Self
    where
        F: Fn(Stamp, RpcError) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<WrappedMessage>();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let stamp = Stamp::of(&message);
                if let Err(e) = target.send_wrapped(message).await {
                    on_error(stamp, e);
                }
            }
        });
        Self { tx }
    }

    fn push(&self, message: WrappedMessage) {
        // A closed queue means the target was forgotten; nothing to deliver.
        let _ = self.tx.send(message);
    }

    fn push_message(&self, message: Message) {
        match message.wrap::<DefaultCodec>() {
            Ok(wrapped) => self.push(wrapped),
            Err(e) => tracing::warn!(error = %e, "Router reply not encodable"),
        }
    }
}

struct ChildLink {
    id: ConnectionId,
    outbox: Outbox,
}

struct RouterInner {
    process_address: Address,
    child: Mutex<Option<ChildLink>>,
    clients: Mutex<HashMap<ConnectionId, Outbox>>,
    /// Requests forwarded to a child, keyed by (client, call id).
    relayed: Mutex<HashMap<(ConnectionId, CallId), ConnectionId>>,
}

impl RouterInner {
    fn endpoint_lost(&self) -> Message {
        Message::EndpointLost(EndpointLostMessage {
            endpoint_address: self.process_address.clone(),
        })
    }

    fn client_outbox(&self, client: &Connection) -> Outbox {
        self.clients
            .lock()
            .entry(client.id())
            .or_insert_with(|| {
                let id = client.id();
                Outbox::open(client.clone(), move |stamp, e| {
                    tracing::debug!(connection_id = id, kind = ?stamp.kind, error = %e, "Forward to client failed");
                })
            })
            .clone()
    }

    fn fail_call(&self, client: ConnectionId, call_id: CallId, error: RemoteFault) {
        let outbox = self.clients.lock().get(&client).cloned();
        if let Some(outbox) = outbox {
            outbox.push_message(Message::Failure(RemoteCallFailureResponse { call_id, error }));
        }
    }

    /// A send to the child failed; answer the client in its place.
    fn child_send_failed(&self, stamp: Stamp, error: RpcError) {
        let Some(client) = stamp.source else {
            return;
        };
        tracing::debug!(connection_id = client, error = %error, "Child unreachable, answering client directly");
        if let (true, Some(call_id)) = (stamp.expects_response(), stamp.call_id) {
            if self.relayed.lock().remove(&(client, call_id)).is_some() {
                self.fail_call(client, call_id, RemoteFault::from(&error));
            }
        }
        let outbox = self.clients.lock().get(&client).cloned();
        if let Some(outbox) = outbox {
            outbox.push_message(self.endpoint_lost());
        }
    }
}

/// Routes traffic between external clients and one child process.
#[derive(Clone)]
pub struct ProcessRouter {
    inner: Arc<RouterInner>,
}

impl ProcessRouter {
    /// Router for the child reachable at `process_address`.
    pub fn new(process_address: Address) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                process_address,
                child: Mutex::new(None),
                clients: Mutex::new(HashMap::new()),
                relayed: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn process_address(&self) -> &Address {
        &self.inner.process_address
    }

    /// Relay to install on the child connection's builder.
    pub fn child_relay(&self) -> Arc<impl Relay> {
        Arc::new(ChildSide {
            inner: self.inner.clone(),
        })
    }

    /// Use `child` as the pipe to the child process.
    pub fn attach_child(&self, child: Connection) {
        tracing::debug!(
            process = %self.inner.process_address,
            connection_id = child.id(),
            "Child attached"
        );
        let inner: Weak<RouterInner> = Arc::downgrade(&self.inner);
        let link = ChildLink {
            id: child.id(),
            outbox: Outbox::open(child, move |stamp, e| {
                if let Some(inner) = inner.upgrade() {
                    inner.child_send_failed(stamp, e);
                }
            }),
        };
        *self.inner.child.lock() = Some(link);
    }

    /// Builder for client connections; relays everything to the child.
    pub fn client_builder(&self) -> ConnectionBuilder {
        Connection::builder().relay(Arc::new(ClientSide {
            inner: self.inner.clone(),
        }))
    }

    /// Start a client connection on a raw stream and register it.
    pub fn accept_client<R, W>(&self, reader: R, writer: W) -> Connection
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let client = self.client_builder().spawn(reader, writer);
        self.inner.client_outbox(&client);
        client
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Requests forwarded to the child and still waiting for an outcome.
    pub fn relayed_calls(&self) -> usize {
        self.inner.relayed.lock().len()
    }
}

struct ClientSide {
    inner: Arc<RouterInner>,
}

impl Relay for ClientSide {
    fn relay(&self, from: &Connection, mut message: WrappedMessage) {
        let client = self.inner.client_outbox(from);
        message.source_connection_id = Some(from.id());
        let stamp = Stamp::of(&message);

        let child = self
            .inner
            .child
            .lock()
            .as_ref()
            .map(|link| (link.id, link.outbox.clone()));
        match child {
            Some((child_id, outbox)) => {
                if let (true, Some(call_id)) = (stamp.expects_response(), stamp.call_id) {
                    self.inner.relayed.lock().insert((from.id(), call_id), child_id);
                }
                outbox.push(message);
            }
            None => {
                let error = RpcError::EndpointNotFound(self.inner.process_address.to_string());
                tracing::debug!(connection_id = from.id(), "No child attached, answering client directly");
                if let (true, Some(call_id)) = (stamp.expects_response(), stamp.call_id) {
                    client.push_message(Message::Failure(RemoteCallFailureResponse {
                        call_id,
                        error: RemoteFault::from(&error),
                    }));
                }
                client.push_message(self.inner.endpoint_lost());
            }
        }
    }

    fn connection_lost(&self, connection: &Connection, _cause: &RpcError) {
        let id = connection.id();
        self.inner.clients.lock().remove(&id);
        self.inner.relayed.lock().retain(|(client, _), _| *client != id);
        tracing::debug!(connection_id = id, "Client forgotten");
    }
}

struct ChildSide {
    inner: Arc<RouterInner>,
}

impl Relay for ChildSide {
    fn relay(&self, from: &Connection, mut message: WrappedMessage) {
        let source = message.source_connection_id.take();
        if message.is_response() {
            if let (Some(client), Some(call_id)) = (source, message.call_id()) {
                self.inner.relayed.lock().remove(&(client, call_id));
            }
        }

        let targets: Vec<Outbox> = {
            let clients = self.inner.clients.lock();
            match source.and_then(|id| clients.get(&id)) {
                Some(client) => vec![client.clone()],
                // Unaddressed traffic from the child goes to every client.
                None if source.is_none() || source == Some(from.id()) => {
                    clients.values().cloned().collect()
                }
                None => {
                    tracing::debug!(?source, kind = ?message.kind, "Client gone, dropping message");
                    Vec::new()
                }
            }
        };

        for client in targets {
            client.push(message.clone());
        }
    }

    fn connection_lost(&self, connection: &Connection, cause: &RpcError) {
        let child_id = connection.id();
        {
            let mut child = self.inner.child.lock();
            if child.as_ref().is_some_and(|link| link.id == child_id) {
                *child = None;
            }
        }
        tracing::warn!(
            process = %self.inner.process_address,
            error = %cause,
            "Child pipe lost"
        );

        let orphaned: Vec<(ConnectionId, CallId)> = {
            let mut relayed = self.inner.relayed.lock();
            let keys: Vec<_> = relayed
                .iter()
                .filter(|(_, child)| **child == child_id)
                .map(|(key, _)| *key)
                .collect();
            for key in &keys {
                relayed.remove(key);
            }
            keys
        };
        let fault = RemoteFault::new(
            "ConnectionLost",
            format!("process {} lost: {cause}", self.inner.process_address),
        );
        for (client, call_id) in orphaned {
            self.inner.fail_call(client, call_id, fault.clone());
        }

        let clients: Vec<Outbox> = self.inner.clients.lock().values().cloned().collect();
        for client in clients {
            client.push_message(self.inner.endpoint_lost());
        }
    }
}
