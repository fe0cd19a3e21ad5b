//! Error types for proclink.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for all proclink operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error during pipe/socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (control preamble only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed address text.
    #[error("Invalid address '{text}': {reason}")]
    AddressFormat {
        /// The offending text.
        text: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Corrupt frame on the wire.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Declared frame length exceeds the configured maximum.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared payload length.
        size: u32,
        /// Configured maximum.
        max: u32,
    },

    /// Stream ended in the middle of a frame.
    #[error("Unexpected end of stream inside a frame")]
    UnexpectedEof,

    /// Peer closed the stream at a frame boundary.
    #[error("Stream closed by peer")]
    StreamClosed,

    /// Connection was closed locally.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Handshake or preamble violation.
    #[error("Handshake protocol error: {0}")]
    Handshake(String),

    /// The connection failed; carries the originating cause.
    #[error("Connection lost: {0}")]
    ConnectionLost(#[source] Arc<RpcError>),

    /// The remote handler raised an application error.
    #[error("Remote fault: {0}")]
    RemoteFault(RemoteFault),

    /// The call was cancelled.
    #[error("Call cancelled")]
    Cancelled,

    /// No endpoint with this id is hosted by the peer.
    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    /// Endpoint exists but does not expose the method.
    #[error("Method '{method}' not found on endpoint '{endpoint}'")]
    MethodNotFound {
        /// Endpoint id.
        endpoint: String,
        /// Method name.
        method: String,
    },

    /// Protocol error (unexpected message kind, missing fields, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl RpcError {
    /// Wrap a cause as a connection-lost error.
    pub fn connection_lost(cause: RpcError) -> Self {
        match cause {
            RpcError::ConnectionLost(inner) => RpcError::ConnectionLost(inner),
            other => RpcError::ConnectionLost(Arc::new(other)),
        }
    }

    /// Check if this error means the connection is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, RpcError::ConnectionLost(_))
    }

    /// Short machine-readable name, used as [`RemoteFault::kind`].
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::Io(_) => "Io",
            RpcError::Json(_) => "Json",
            RpcError::MsgPackEncode(_) | RpcError::MsgPackDecode(_) => "Serialization",
            RpcError::AddressFormat { .. } => "AddressFormat",
            RpcError::Framing(_) | RpcError::FrameTooLarge { .. } | RpcError::UnexpectedEof => {
                "Framing"
            }
            RpcError::StreamClosed => "StreamClosed",
            RpcError::ConnectionClosed => "ConnectionClosed",
            RpcError::Handshake(_) => "HandshakeProtocol",
            RpcError::ConnectionLost(_) => "ConnectionLost",
            RpcError::RemoteFault(_) => "RemoteFault",
            RpcError::Cancelled => "Cancelled",
            RpcError::EndpointNotFound(_) => "EndpointNotFound",
            RpcError::MethodNotFound { .. } => "MethodNotFound",
            RpcError::Protocol(_) => "Protocol",
            RpcError::BackpressureTimeout => "BackpressureTimeout",
        }
    }

    pub(crate) fn address(text: &str, reason: impl Into<String>) -> Self {
        RpcError::AddressFormat {
            text: text.to_string(),
            reason: reason.into(),
        }
    }
}

/// An application error raised by a remote handler.
///
/// Travels inside a `RemoteCallFailureResponse` and is re-materialized on the
/// caller as [`RpcError::RemoteFault`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    /// Error kind on the remote side (e.g. `MethodNotFound`).
    pub kind: String,
    /// Human readable message.
    pub message: String,
    /// Remote diagnostic trace, if the handler provided one.
    pub remote_stack: Option<String>,
}

impl RemoteFault {
    /// Create a fault with no remote trace.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            remote_stack: None,
        }
    }

    /// Attach a remote trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.remote_stack = Some(stack.into());
        self
    }
}

impl From<&RpcError> for RemoteFault {
    fn from(err: &RpcError) -> Self {
        match err {
            RpcError::RemoteFault(fault) => fault.clone(),
            other => RemoteFault::new(other.kind(), other.to_string())
                .with_stack(format!("{:?}", other)),
        }
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
