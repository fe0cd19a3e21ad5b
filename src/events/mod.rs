//! Remote event subscriptions.
//!
//! Each connection keeps a [`SubscriptionManager`] that mirrors the events it
//! has asked the peer to deliver. Local handlers are reference counted per
//! `(address, event)`: only the first add and the last remove reach the wire.
//! Endpoint-lost notices, and failure of the connection itself, cascade through
//! the subscription tree and fire lost callbacks.

mod manager;
mod tree;

use std::fmt;
use std::sync::Arc;

pub use manager::{SubscriptionBatch, SubscriptionManager};

use crate::address::Address;
use crate::message::EventRaisedMessage;

/// Callback for a raised event.
pub type EventHandler = Arc<dyn Fn(&EventRaisedMessage) + Send + Sync>;

/// Callback for a lost endpoint.
pub type LostCallback = Arc<dyn Fn(&LostNotification) + Send + Sync>;

/// Identifies one event handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub(crate) u64);

/// Identifies one lost-callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LostToken(pub(crate) u64);

/// Why a subscription node was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LostReason {
    /// The peer reported the endpoint (or an ancestor) as gone.
    RemoteEndpointLost,
    /// The connection failed.
    LocalFailure,
    /// Discarded locally.
    Destroyed,
}

impl fmt::Display for LostReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LostReason::RemoteEndpointLost => "remote endpoint lost",
            LostReason::LocalFailure => "local failure",
            LostReason::Destroyed => "destroyed",
        };
        f.write_str(text)
    }
}

/// Passed to lost callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostNotification {
    /// Address named by the cascade trigger.
    pub original_address: Address,
    /// Address of the node whose callback is firing.
    pub current_address: Address,
    pub reason: LostReason,
}
