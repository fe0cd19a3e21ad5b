//! Serves hosted endpoints to one or more connections.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::endpoint::{BoxFuture, Dispatch, MethodHandler};
use super::{CallContext, Endpoint};
use crate::address::Address;
use crate::codec::{Codec, DefaultCodec};
use crate::connection::{Connection, ConnectionId, InboundRequest, RequestHandler};
use crate::error::{RemoteFault, Result, RpcError};
use crate::message::{
    CallId, EndpointLostMessage, EventRaisedMessage, EventRegistrationRequest, Message,
    RemoteCallCancelledResponse, RemoteCallFailureResponse, RemoteCallRequest,
    RemoteCallSuccessResponse, Wrap,
};

/// A caller as seen by the host: the connection plus the relay's client id.
type PeerKey = (ConnectionId, Option<u64>);

type CallKey = (ConnectionId, Option<u64>, CallId);

#[derive(Clone)]
struct Peer {
    connection: Connection,
    source: Option<u64>,
    /// Address the peer used for the endpoint.
    address: Address,
}

#[derive(Default)]
struct Tables {
    in_flight: HashMap<CallKey, CancellationToken>,
    /// endpoint key -> event -> subscribers
    subscribers: HashMap<String, HashMap<String, HashMap<PeerKey, Peer>>>,
    /// endpoint key -> peers that have called it
    callers: HashMap<String, HashMap<PeerKey, Peer>>,
}

impl Tables {
    fn forget_connection(&mut self, id: ConnectionId) -> Vec<CancellationToken> {
        let mut cancelled = Vec::new();
        self.in_flight.retain(|(conn, _, _), token| {
            if *conn == id {
                cancelled.push(token.clone());
                false
            } else {
                true
            }
        });
        for events in self.subscribers.values_mut() {
            for peers in events.values_mut() {
                peers.retain(|(conn, _), _| *conn != id);
            }
            events.retain(|_, peers| !peers.is_empty());
        }
        self.subscribers.retain(|_, events| !events.is_empty());
        for peers in self.callers.values_mut() {
            peers.retain(|(conn, _), _| *conn != id);
        }
        self.callers.retain(|_, peers| !peers.is_empty());
        cancelled
    }
}

/// Hosts endpoints and answers requests for them.
///
/// Install on any number of connections with
/// [`ConnectionBuilder::handler`](crate::connection::ConnectionBuilder::handler).
#[derive(Default)]
pub struct EndpointHost {
    endpoints: Mutex<HashMap<String, Arc<dyn Dispatch>>>,
    tables: Arc<Mutex<Tables>>,
}

fn endpoint_key(id: &str) -> String {
    id.to_ascii_lowercase()
}

impl EndpointHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host `endpoint`, replacing any endpoint with the same id.
    pub fn add_endpoint<C: Codec>(&self, endpoint: Endpoint<C>) {
        let key = endpoint_key(endpoint.id());
        tracing::debug!(endpoint = %endpoint.id(), methods = ?endpoint.method_names(), "Endpoint added");
        self.endpoints.lock().insert(key, Arc::new(endpoint));
    }

    pub fn has_endpoint(&self, id: &str) -> bool {
        self.endpoints.lock().contains_key(&endpoint_key(id))
    }

    /// Stop hosting `id` and tell every caller and subscriber it is gone.
    /// Returns whether the endpoint was hosted.
    pub async fn remove_endpoint(&self, id: &str) -> bool {
        let key = endpoint_key(id);
        if self.endpoints.lock().remove(&key).is_none() {
            return false;
        }

        let peers: HashMap<PeerKey, Peer> = {
            let mut tables = self.tables.lock();
            let mut peers = tables.callers.remove(&key).unwrap_or_default();
            for subscribers in tables.subscribers.remove(&key).unwrap_or_default().into_values() {
                peers.extend(subscribers);
            }
            peers
        };

        tracing::debug!(endpoint = %id, notified = peers.len(), "Endpoint removed");
        for peer in peers.into_values() {
            let lost = Message::EndpointLost(EndpointLostMessage {
                endpoint_address: peer.address.clone(),
            });
            if let Err(e) = send_to(&peer, lost).await {
                tracing::debug!(error = %e, "Endpoint-lost notice not delivered");
            }
        }
        true
    }

    /// Send `event` with `args` to every subscriber of `(endpoint, event)`.
    /// Returns how many subscribers it was sent to.
    pub async fn raise_event<T: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        event: &str,
        args: &T,
    ) -> Result<usize> {
        self.raise_event_with::<DefaultCodec, T>(endpoint, event, args)
            .await
    }

    /// [`raise_event`](Self::raise_event) with the payload encoded by `C`.
    pub async fn raise_event_with<C: Codec, T: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        event: &str,
        args: &T,
    ) -> Result<usize> {
        let payload = C::encode(args)?;
        let peers: Vec<Peer> = {
            let tables = self.tables.lock();
            tables
                .subscribers
                .get(&endpoint_key(endpoint))
                .and_then(|events| events.get(event))
                .map(|peers| peers.values().cloned().collect())
                .unwrap_or_default()
        };

        let mut sent = 0;
        for peer in peers {
            let message = Message::EventRaised(EventRaisedMessage {
                endpoint: peer.address.clone(),
                event_name: event.to_string(),
                event_args: payload.clone().into(),
            });
            match send_to(&peer, message).await {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!(%endpoint, event, error = %e, "Event not delivered"),
            }
        }
        Ok(sent)
    }

    /// Number of subscribers for `(endpoint, event)`.
    pub fn subscriber_count(&self, endpoint: &str, event: &str) -> usize {
        self.tables
            .lock()
            .subscribers
            .get(&endpoint_key(endpoint))
            .and_then(|events| events.get(event))
            .map_or(0, HashMap::len)
    }

    /// Calls currently running.
    pub fn in_flight(&self) -> usize {
        self.tables.lock().in_flight.len()
    }

    fn lookup(&self, destination: Option<&Address>) -> Result<(String, Arc<dyn Dispatch>)> {
        let destination = destination
            .ok_or_else(|| RpcError::Protocol("request without destination".to_string()))?;
        let id = destination
            .endpoint_id()?
            .ok_or_else(|| RpcError::EndpointNotFound(destination.to_string()))?;
        let key = endpoint_key(id);
        let endpoint = self
            .endpoints
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| RpcError::EndpointNotFound(destination.to_string()))?;
        Ok((key, endpoint))
    }

    fn handle_call(&self, connection: &Connection, request: RemoteCallRequest, source: Option<u64>) {
        let call_id = request.call_id;
        let (key, endpoint) = match self.lookup(request.destination.as_ref()) {
            Ok(found) => found,
            Err(e) => return respond_failure(connection, call_id, &e, source),
        };
        let Some(method) = endpoint.method(&request.method) else {
            let e = RpcError::MethodNotFound {
                endpoint: endpoint.id().to_string(),
                method: request.method.clone(),
            };
            return respond_failure(connection, call_id, &e, source);
        };
        let address = request
            .destination
            .clone()
            .unwrap_or_else(Address::root);

        let token = CancellationToken::new();
        let call_key = (connection.id(), source, call_id);
        {
            let mut tables = self.tables.lock();
            if tables.in_flight.contains_key(&call_key) {
                drop(tables);
                let e = RpcError::Protocol(format!("call id {call_id} is already running"));
                return respond_failure(connection, call_id, &e, source);
            }
            tables.in_flight.insert(call_key, token.clone());
            tables.callers.entry(key).or_default().insert(
                (connection.id(), source),
                Peer {
                    connection: connection.clone(),
                    source,
                    address: address.clone(),
                },
            );
        }

        let ctx = CallContext::new(
            connection.clone(),
            address,
            request.method.clone(),
            call_id,
            source,
            token.clone(),
        );
        tracing::trace!(call_id, method = %request.method, connection_id = connection.id(), "Call started");
        let call = method.call(&request.arguments, ctx);
        let deadline = request.remaining().map(|left| Instant::now() + left);
        let tables = self.tables.clone();
        let connection = connection.clone();

        tokio::spawn(async move {
            let outcome = run_with_deadline(call, deadline, &token).await;
            tables.lock().in_flight.remove(&call_key);

            let reply = match outcome {
                Ok(result) => Message::Success(RemoteCallSuccessResponse {
                    call_id,
                    result: result.into(),
                }),
                Err(RpcError::Cancelled) => {
                    Message::Cancelled(RemoteCallCancelledResponse { call_id })
                }
                Err(e) => {
                    tracing::debug!(call_id, error = %e, "Call failed");
                    Message::Failure(RemoteCallFailureResponse {
                        call_id,
                        error: RemoteFault::from(&e),
                    })
                }
            };
            if let Err(e) = connection.respond(reply, source).await {
                tracing::debug!(call_id, error = %e, "Response not sent");
            }
        });
    }

    fn handle_registration(
        &self,
        connection: &Connection,
        request: EventRegistrationRequest,
        source: Option<u64>,
    ) {
        let call_id = request.call_id;
        let (key, _) = match self.lookup(request.destination.as_ref()) {
            Ok(found) => found,
            Err(e) => return respond_failure(connection, call_id, &e, source),
        };
        let address = request
            .destination
            .clone()
            .unwrap_or_else(Address::root);
        let peer_key = (connection.id(), source);

        {
            let mut tables = self.tables.lock();
            let events = tables.subscribers.entry(key.clone()).or_default();
            for event in &request.added {
                events.entry(event.clone()).or_default().insert(
                    peer_key,
                    Peer {
                        connection: connection.clone(),
                        source,
                        address: address.clone(),
                    },
                );
            }
            for event in &request.removed {
                if let Some(peers) = events.get_mut(event) {
                    peers.remove(&peer_key);
                    if peers.is_empty() {
                        events.remove(event);
                    }
                }
            }
            if events.is_empty() {
                tables.subscribers.remove(&key);
            }
        }
        tracing::debug!(
            endpoint = %address,
            added = ?request.added,
            removed = ?request.removed,
            "Subscriptions changed"
        );

        let ack = RemoteCallSuccessResponse::encode::<DefaultCodec, _>(call_id, &());
        let connection = connection.clone();
        tokio::spawn(async move {
            let sent = match ack {
                Ok(ack) => connection.respond(Message::Success(ack), source).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                tracing::debug!(call_id, error = %e, "Registration ack not sent");
            }
        });
    }

    fn handle_cancellation(&self, connection: &Connection, call_id: CallId, source: Option<u64>) {
        let token = self
            .tables
            .lock()
            .in_flight
            .get(&(connection.id(), source, call_id))
            .cloned();
        match token {
            Some(token) => {
                tracing::debug!(call_id, "Cancelling call");
                token.cancel();
            }
            None => tracing::debug!(call_id, "Cancellation for a call that is not running"),
        }
    }
}

impl RequestHandler for EndpointHost {
    fn handle(&self, connection: &Connection, request: InboundRequest) {
        let source = request.source_connection_id;
        match request.message {
            Message::CallRequest(call) => self.handle_call(connection, call, source),
            Message::EventRegistration(registration) => {
                self.handle_registration(connection, registration, source)
            }
            Message::Cancellation(cancel) => {
                self.handle_cancellation(connection, cancel.call_id, source)
            }
            other => tracing::warn!(kind = ?other.kind(), "Host ignoring non-request message"),
        }
    }

    fn connection_lost(&self, connection: &Connection, _cause: &RpcError) {
        let cancelled = self.tables.lock().forget_connection(connection.id());
        if !cancelled.is_empty() {
            tracing::debug!(
                connection_id = connection.id(),
                calls = cancelled.len(),
                "Cancelling calls of lost connection"
            );
        }
        for token in cancelled {
            token.cancel();
        }
    }
}

async fn run_with_deadline(
    call: BoxFuture<'static, Result<Vec<u8>>>,
    deadline: Option<Instant>,
    token: &CancellationToken,
) -> Result<Vec<u8>> {
    tokio::pin!(call);
    let mut deadline = deadline;
    loop {
        tokio::select! {
            outcome = &mut call => return outcome,
            _ = sleep_until(deadline), if deadline.is_some() => {
                deadline = None;
                token.cancel();
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn send_to(peer: &Peer, message: Message) -> Result<()> {
    let mut wrapped = message.wrap::<DefaultCodec>()?;
    wrapped.source_connection_id = peer.source;
    peer.connection.send_wrapped(wrapped).await
}

fn respond_failure(connection: &Connection, call_id: CallId, error: &RpcError, source: Option<u64>) {
    tracing::debug!(call_id, error = %error, "Rejecting request");
    let reply = Message::Failure(RemoteCallFailureResponse {
        call_id,
        error: RemoteFault::from(error),
    });
    let connection = connection.clone();
    tokio::spawn(async move {
        if let Err(e) = connection.respond(reply, source).await {
            tracing::debug!(call_id, error = %e, "Failure response not sent");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forget_connection_clears_tables() {
        let mut tables = Tables::default();
        let token = CancellationToken::new();
        tables.in_flight.insert((1, None, 5), token.clone());
        tables.in_flight.insert((2, None, 5), CancellationToken::new());

        let cancelled = tables.forget_connection(1);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(tables.in_flight.len(), 1);
        assert!(tables.in_flight.contains_key(&(2, None, 5)));
    }

    #[test]
    fn test_endpoint_keys_ignore_case() {
        let host = EndpointHost::new();
        host.add_endpoint(Endpoint::new("Calc"));
        assert!(host.has_endpoint("calc"));
        assert!(host.has_endpoint("CALC"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_token() {
        let token = CancellationToken::new();
        let observed = token.clone();
        let call: BoxFuture<'static, Result<Vec<u8>>> = Box::pin(async move {
            observed.cancelled().await;
            Err(RpcError::Cancelled)
        });
        let deadline = Instant::now() + std::time::Duration::from_millis(100);
        let outcome = run_with_deadline(call, Some(deadline), &token).await;
        assert!(matches!(outcome, Err(RpcError::Cancelled)));
        assert!(token.is_cancelled());
    }
}
