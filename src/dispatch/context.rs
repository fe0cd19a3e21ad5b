//! Per-call context handed to endpoint methods.

use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::connection::Connection;
use crate::message::CallId;

/// Context of one incoming call.
///
/// Cancellation is cooperative: the token fires when the caller cancels or
/// the call's deadline passes, and the method decides when to stop. Returning
/// [`RpcError::Cancelled`](crate::RpcError::Cancelled) answers the caller with
/// a cancelled response.
#[derive(Debug, Clone)]
pub struct CallContext {
    connection: Connection,
    endpoint: Address,
    method: String,
    call_id: CallId,
    source_connection_id: Option<u64>,
    cancellation: CancellationToken,
}

impl CallContext {
    pub(crate) fn new(
        connection: Connection,
        endpoint: Address,
        method: String,
        call_id: CallId,
        source_connection_id: Option<u64>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            connection,
            endpoint,
            method,
            call_id,
            source_connection_id,
            cancellation,
        }
    }

    /// Connection the call arrived on.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Address the caller used.
    pub fn endpoint(&self) -> &Address {
        &self.endpoint
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Client id stamped by a relay, if the call came through one.
    pub fn source_connection_id(&self) -> Option<u64> {
        self.source_connection_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the call is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}
