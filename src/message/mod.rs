//! Message kinds exchanged between peers.
//!
//! [`Message`] is a closed set: requests that expect a response
//! ([`RemoteCallRequest`], [`EventRegistrationRequest`]), the one-way
//! [`RemoteCallCancellationRequest`], the three call outcomes, and the two
//! one-way notifications ([`EventRaisedMessage`], [`EndpointLostMessage`]).
//!
//! Destination and call id are not part of a variant's serialized body. They
//! travel once, in the [`WrappedMessage`] envelope, and are reattached on
//! unwrap.

mod arguments;
mod envelope;

pub use arguments::{Arguments, FromArguments, IntoArguments};
pub use envelope::{WrappedMessage, Wrap};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::address::Address;
use crate::codec::Codec;
use crate::error::{RemoteFault, Result};

/// Per-connection call identifier.
pub type CallId = u64;

/// Sentinel meaning "no call id". Never used to look up a pending call.
pub const NO_CALL_ID: CallId = 0;

/// Variant tag carried by the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// [`RemoteCallRequest`]
    CallRequest,
    /// [`EventRegistrationRequest`]
    EventRegistration,
    /// [`RemoteCallCancellationRequest`]
    Cancellation,
    /// [`RemoteCallSuccessResponse`]
    Success,
    /// [`RemoteCallFailureResponse`]
    Failure,
    /// [`RemoteCallCancelledResponse`]
    Cancelled,
    /// [`EventRaisedMessage`]
    EventRaised,
    /// [`EndpointLostMessage`]
    EndpointLost,
}

impl MessageKind {
    /// Request kinds (including the one-way cancellation).
    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageKind::CallRequest | MessageKind::EventRegistration | MessageKind::Cancellation
        )
    }

    /// Call outcome kinds.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageKind::Success | MessageKind::Failure | MessageKind::Cancelled
        )
    }
}

/// Invoke a method on a remote endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCallRequest {
    #[serde(skip)]
    pub call_id: CallId,
    #[serde(skip)]
    pub destination: Option<Address>,
    pub method: String,
    pub arguments: Arguments,
    pub cancellable: bool,
    /// Deadline in milliseconds since the Unix epoch.
    #[serde(default)]
    pub absolute_timeout: Option<u64>,
}

impl RemoteCallRequest {
    /// Build a cancellable request with no deadline.
    pub fn new(destination: Address, method: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            call_id: NO_CALL_ID,
            destination: Some(destination),
            method: method.into(),
            arguments,
            cancellable: true,
            absolute_timeout: None,
        }
    }

    /// Set whether the call forwards local cancellation to the peer.
    pub fn cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    /// Set the deadline to `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let deadline = SystemTime::now() + timeout;
        self.absolute_timeout = deadline
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_millis() as u64);
        self
    }

    /// Time left until the deadline, saturating at zero. `None` if no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        let deadline = UNIX_EPOCH + Duration::from_millis(self.absolute_timeout?);
        Some(
            deadline
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
        )
    }
}

/// Change the set of events a connection is subscribed to on an endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventRegistrationRequest {
    #[serde(skip)]
    pub call_id: CallId,
    #[serde(skip)]
    pub destination: Option<Address>,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

/// Ask the peer to cancel an outstanding call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteCallCancellationRequest {
    #[serde(skip)]
    pub call_id: CallId,
    #[serde(skip)]
    pub destination: Option<Address>,
}

/// Call completed with an encoded result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteCallSuccessResponse {
    #[serde(skip)]
    pub call_id: CallId,
    pub result: ByteBuf,
}

impl RemoteCallSuccessResponse {
    /// Encode `value` as the result of call `call_id`.
    pub fn encode<C: Codec, T: Serialize>(call_id: CallId, value: &T) -> Result<Self> {
        Ok(Self {
            call_id,
            result: ByteBuf::from(C::encode(value)?),
        })
    }

    /// Decode the result.
    pub fn decode<C: Codec, T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        C::decode(&self.result)
    }
}

/// Call failed on the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCallFailureResponse {
    #[serde(skip)]
    pub call_id: CallId,
    pub error: RemoteFault,
}

/// Call was cancelled on the remote side.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteCallCancelledResponse {
    #[serde(skip)]
    pub call_id: CallId,
}

/// An endpoint raised an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRaisedMessage {
    pub endpoint: Address,
    pub event_name: String,
    pub event_args: ByteBuf,
}

impl EventRaisedMessage {
    /// Encode `args` as the payload of `event_name` raised by `endpoint`.
    pub fn encode<C: Codec, T: Serialize + ?Sized>(
        endpoint: Address,
        event_name: impl Into<String>,
        args: &T,
    ) -> Result<Self> {
        Ok(Self {
            endpoint,
            event_name: event_name.into(),
            event_args: ByteBuf::from(C::encode(args)?),
        })
    }

    /// Decode the event payload.
    pub fn decode_args<C: Codec, T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        C::decode(&self.event_args)
    }
}

/// An endpoint (or a whole process or cluster) is gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointLostMessage {
    pub endpoint_address: Address,
}

/// Every message kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    CallRequest(RemoteCallRequest),
    EventRegistration(EventRegistrationRequest),
    Cancellation(RemoteCallCancellationRequest),
    Success(RemoteCallSuccessResponse),
    Failure(RemoteCallFailureResponse),
    Cancelled(RemoteCallCancelledResponse),
    EventRaised(EventRaisedMessage),
    EndpointLost(EndpointLostMessage),
}

impl Message {
    /// Variant tag.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::CallRequest(_) => MessageKind::CallRequest,
            Message::EventRegistration(_) => MessageKind::EventRegistration,
            Message::Cancellation(_) => MessageKind::Cancellation,
            Message::Success(_) => MessageKind::Success,
            Message::Failure(_) => MessageKind::Failure,
            Message::Cancelled(_) => MessageKind::Cancelled,
            Message::EventRaised(_) => MessageKind::EventRaised,
            Message::EndpointLost(_) => MessageKind::EndpointLost,
        }
    }

    fn call_id_slot(&mut self) -> Option<&mut CallId> {
        match self {
            Message::CallRequest(m) => Some(&mut m.call_id),
            Message::EventRegistration(m) => Some(&mut m.call_id),
            Message::Cancellation(m) => Some(&mut m.call_id),
            Message::Success(m) => Some(&mut m.call_id),
            Message::Failure(m) => Some(&mut m.call_id),
            Message::Cancelled(m) => Some(&mut m.call_id),
            Message::EventRaised(_) | Message::EndpointLost(_) => None,
        }
    }

    /// Whether this kind carries a call id at all.
    pub fn is_stateful(&self) -> bool {
        !matches!(self, Message::EventRaised(_) | Message::EndpointLost(_))
    }

    /// Call id, `None` when the kind has none or it is still [`NO_CALL_ID`].
    pub fn call_id(&self) -> Option<CallId> {
        let id = match self {
            Message::CallRequest(m) => m.call_id,
            Message::EventRegistration(m) => m.call_id,
            Message::Cancellation(m) => m.call_id,
            Message::Success(m) => m.call_id,
            Message::Failure(m) => m.call_id,
            Message::Cancelled(m) => m.call_id,
            Message::EventRaised(_) | Message::EndpointLost(_) => NO_CALL_ID,
        };
        (id != NO_CALL_ID).then_some(id)
    }

    /// Set the call id. Returns `false` for kinds that carry none.
    pub fn set_call_id(&mut self, id: CallId) -> bool {
        match self.call_id_slot() {
            Some(slot) => {
                *slot = id;
                true
            }
            None => false,
        }
    }

    /// Routing destination, for request kinds.
    pub fn destination(&self) -> Option<&Address> {
        match self {
            Message::CallRequest(m) => m.destination.as_ref(),
            Message::EventRegistration(m) => m.destination.as_ref(),
            Message::Cancellation(m) => m.destination.as_ref(),
            _ => None,
        }
    }

    /// Attach a destination. Ignored for kinds that are not routed by address.
    pub fn set_destination(&mut self, destination: Option<Address>) {
        match self {
            Message::CallRequest(m) => m.destination = destination,
            Message::EventRegistration(m) => m.destination = destination,
            Message::Cancellation(m) => m.destination = destination,
            _ => {}
        }
    }

    /// Whether the sender waits for a call outcome.
    pub fn expects_response(&self) -> bool {
        matches!(self, Message::CallRequest(_) | Message::EventRegistration(_))
    }

    /// Whether this is a call outcome.
    pub fn is_response(&self) -> bool {
        self.kind().is_response()
    }

    /// Whether local cancellation is forwarded to the peer.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Message::CallRequest(m) if m.cancellable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Message {
        Message::CallRequest(RemoteCallRequest::new(
            Address::lazy("/p1/e1"),
            "Test",
            Arguments::default(),
        ))
    }

    #[test]
    fn test_sentinel_call_id_reads_as_none() {
        let mut msg = request();
        assert_eq!(msg.call_id(), None);
        assert!(msg.set_call_id(7));
        assert_eq!(msg.call_id(), Some(7));
    }

    #[test]
    fn test_one_way_kinds_have_no_id() {
        let mut msg = Message::EndpointLost(EndpointLostMessage {
            endpoint_address: Address::lazy("/p1"),
        });
        assert!(!msg.is_stateful());
        assert!(!msg.set_call_id(3));
        assert_eq!(msg.call_id(), None);
        assert!(!msg.expects_response());
    }

    #[test]
    fn test_classification() {
        assert!(request().expects_response());
        assert!(request().is_cancellable());
        assert!(!request().is_response());

        let cancel = Message::Cancellation(RemoteCallCancellationRequest::default());
        assert!(!cancel.expects_response());
        assert!(cancel.kind().is_request());

        let done = Message::Cancelled(RemoteCallCancelledResponse { call_id: 1 });
        assert!(done.is_response());
    }

    #[test]
    fn test_timeout_remaining() {
        let req = RemoteCallRequest::new(Address::lazy("/p/e"), "m", Arguments::default())
            .with_timeout(Duration::from_secs(60));
        let left = req.remaining().unwrap();
        assert!(left > Duration::from_secs(58) && left <= Duration::from_secs(60));

        let mut past = req.clone();
        past.absolute_timeout = Some(1);
        assert_eq!(past.remaining(), Some(Duration::ZERO));
    }
}
