//! Wire envelope.
//!
//! ```text
//! WrappedMessage
//! ├── destination           (out of band, sent once)
//! ├── kind                  (variant tag)
//! ├── payload               (variant body encoded with the codec)
//! ├── call_id               (0 = none)
//! ├── source_connection_id  (set by a relay that multiplexes clients)
//! └── is_request
//! ```
//!
//! The envelope is itself encoded with the codec into a data frame payload.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{CallId, Message, MessageKind, NO_CALL_ID};
use crate::address::Address;
use crate::codec::Codec;
use crate::error::Result;

/// Routing metadata plus an opaque encoded message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedMessage {
    #[serde(default)]
    pub destination: Option<Address>,
    pub kind: MessageKind,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub call_id: CallId,
    #[serde(default)]
    pub source_connection_id: Option<u64>,
    #[serde(default)]
    pub is_request: bool,
}

/// Conversion into a [`WrappedMessage`].
///
/// Implemented for [`Message`] and, as the identity, for [`WrappedMessage`]
/// so that wrapping twice is a no-op.
pub trait Wrap {
    /// Produce the envelope.
    fn wrap<C: Codec>(&self) -> Result<WrappedMessage>;
}

impl Wrap for Message {
    fn wrap<C: Codec>(&self) -> Result<WrappedMessage> {
        let payload = match self {
            Message::CallRequest(m) => C::encode(m)?,
            Message::EventRegistration(m) => C::encode(m)?,
            Message::Cancellation(m) => C::encode(m)?,
            Message::Success(m) => C::encode(m)?,
            Message::Failure(m) => C::encode(m)?,
            Message::Cancelled(m) => C::encode(m)?,
            Message::EventRaised(m) => C::encode(m)?,
            Message::EndpointLost(m) => C::encode(m)?,
        };

        Ok(WrappedMessage {
            destination: self.destination().cloned(),
            kind: self.kind(),
            payload,
            call_id: self.call_id().unwrap_or(NO_CALL_ID),
            source_connection_id: None,
            is_request: self.kind().is_request(),
        })
    }
}

impl Wrap for WrappedMessage {
    fn wrap<C: Codec>(&self) -> Result<WrappedMessage> {
        Ok(self.clone())
    }
}

impl WrappedMessage {
    /// Decode the body by its tag and reattach destination and call id.
    ///
    /// The call id is only reattached when it is not [`NO_CALL_ID`].
    pub fn open<C: Codec>(&self) -> Result<Message> {
        let bytes = self.payload.as_slice();
        let mut message = match self.kind {
            MessageKind::CallRequest => Message::CallRequest(C::decode(bytes)?),
            MessageKind::EventRegistration => Message::EventRegistration(C::decode(bytes)?),
            MessageKind::Cancellation => Message::Cancellation(C::decode(bytes)?),
            MessageKind::Success => Message::Success(C::decode(bytes)?),
            MessageKind::Failure => Message::Failure(C::decode(bytes)?),
            MessageKind::Cancelled => Message::Cancelled(C::decode(bytes)?),
            MessageKind::EventRaised => Message::EventRaised(C::decode(bytes)?),
            MessageKind::EndpointLost => Message::EndpointLost(C::decode(bytes)?),
        };

        message.set_destination(self.destination.clone());
        if self.call_id != NO_CALL_ID {
            message.set_call_id(self.call_id);
        }
        Ok(message)
    }

    /// Call id, `None` for the sentinel.
    pub fn call_id(&self) -> Option<CallId> {
        (self.call_id != NO_CALL_ID).then_some(self.call_id)
    }

    /// Whether this carries a call outcome.
    pub fn is_response(&self) -> bool {
        self.kind.is_response()
    }

    /// Encode the whole envelope as a data frame payload.
    pub fn encode<C: Codec>(&self) -> Result<Bytes> {
        Ok(Bytes::from(C::encode(self)?))
    }

    /// Decode an envelope from a data frame payload.
    pub fn decode<C: Codec>(bytes: &[u8]) -> Result<Self> {
        C::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use crate::error::RemoteFault;
    use crate::message::{
        Arguments, EndpointLostMessage, EventRaisedMessage, IntoArguments,
        RemoteCallCancellationRequest, RemoteCallFailureResponse, RemoteCallRequest,
        RemoteCallSuccessResponse,
    };
    use serde_bytes::ByteBuf;

    fn call(id: CallId) -> Message {
        let mut req = RemoteCallRequest::new(
            Address::lazy("/p1/e1"),
            "Test",
            (1i32, "x").into_arguments::<MsgPackCodec>().unwrap(),
        );
        req.call_id = id;
        Message::CallRequest(req)
    }

    #[test]
    fn test_unwrap_restores_destination_and_id() {
        let original = call(7);
        let wrapped = original.wrap::<MsgPackCodec>().unwrap();
        assert_eq!(wrapped.call_id, 7);
        assert!(wrapped.is_request);
        assert_eq!(wrapped.destination.as_ref().unwrap().as_str(), "/p1/e1");

        let back = wrapped.open::<MsgPackCodec>().unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_destination_not_in_payload() {
        let wrapped = call(7).wrap::<MsgPackCodec>().unwrap();
        let needle = b"/p1/e1";
        assert!(!wrapped
            .payload
            .windows(needle.len())
            .any(|w| w == needle));
    }

    #[test]
    fn test_wrap_is_idempotent() {
        let wrapped = call(9).wrap::<MsgPackCodec>().unwrap();
        assert_eq!(wrapped.wrap::<MsgPackCodec>().unwrap(), wrapped);
    }

    #[test]
    fn test_sentinel_id_not_reattached() {
        let msg = Message::Cancellation(RemoteCallCancellationRequest {
            call_id: 0,
            destination: Some(Address::lazy("/p/e")),
        });
        let wrapped = msg.wrap::<MsgPackCodec>().unwrap();
        assert_eq!(wrapped.call_id(), None);
        assert_eq!(wrapped.open::<MsgPackCodec>().unwrap().call_id(), None);
    }

    #[test]
    fn test_every_kind_survives_the_envelope() {
        let messages = vec![
            call(1),
            Message::Success(RemoteCallSuccessResponse::encode::<MsgPackCodec, _>(2, &12345i64).unwrap()),
            Message::Failure(RemoteCallFailureResponse {
                call_id: 3,
                error: RemoteFault::new("Boom", "it broke").with_stack("at remote"),
            }),
            Message::EventRaised(EventRaisedMessage {
                endpoint: Address::lazy("/p/e"),
                event_name: "Changed".into(),
                event_args: ByteBuf::from(vec![1, 2, 3]),
            }),
            Message::EndpointLost(EndpointLostMessage {
                endpoint_address: Address::lazy("proclink://h/p"),
            }),
        ];

        for msg in messages {
            let bytes = msg
                .wrap::<MsgPackCodec>()
                .unwrap()
                .encode::<MsgPackCodec>()
                .unwrap();
            let decoded = WrappedMessage::decode::<MsgPackCodec>(&bytes)
                .unwrap()
                .open::<MsgPackCodec>()
                .unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_empty_arguments_roundtrip() {
        let msg = Message::CallRequest(RemoteCallRequest::new(
            Address::lazy("/p/e"),
            "Ping",
            Arguments::default(),
        ));
        let back = msg.wrap::<MsgPackCodec>().unwrap().open::<MsgPackCodec>().unwrap();
        assert_eq!(back, msg);
    }
}
