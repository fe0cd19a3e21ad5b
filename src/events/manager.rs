//! Subscription manager: local registrations, wire deltas and delivery.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::tree::SubscriptionTree;
use super::{EventHandler, LostCallback, LostNotification, LostReason, LostToken, SubscriptionToken};
use crate::address::{Address, RelativeKey};
use crate::connection::{into_success, Connection};
use crate::error::Result;
use crate::message::{EventRaisedMessage, EventRegistrationRequest, Message};

enum Delivery {
    Event {
        handlers: Vec<EventHandler>,
        message: EventRaisedMessage,
    },
    Lost {
        callbacks: Vec<LostCallback>,
        notification: LostNotification,
    },
}

enum Change {
    Add(u64, EventHandler),
    Remove(u64),
}

struct Op {
    address: Address,
    event: String,
    change: Change,
}

/// How to take back one applied op.
enum Undo {
    Added {
        address: Address,
        event: String,
        token: u64,
    },
    Removed {
        address: Address,
        event: String,
        token: u64,
        handler: EventHandler,
    },
}

/// Wire request for one destination plus the local ops behind it.
struct Staged {
    request: EventRegistrationRequest,
    undo: Vec<Undo>,
}

fn roll_back(tree: &mut SubscriptionTree, undo: Vec<Undo>) {
    for step in undo.into_iter().rev() {
        match step {
            Undo::Added {
                address,
                event,
                token,
            } => {
                tree.take_handler(&address, &event, token);
            }
            Undo::Removed {
                address,
                event,
                token,
                handler,
            } => {
                tree.add_handler(&address, &event, token, handler);
            }
        }
    }
}

/// A set of handler additions and removals applied together.
///
/// Obtained from [`SubscriptionManager::batch`] and applied with
/// [`SubscriptionManager::apply`].
pub struct SubscriptionBatch {
    tokens: Arc<AtomicU64>,
    ops: Vec<Op>,
}

impl SubscriptionBatch {
    /// Queue a handler for `event` raised by `address`.
    pub fn add<F>(&mut self, address: Address, event: impl Into<String>, handler: F) -> SubscriptionToken
    where
        F: Fn(&EventRaisedMessage) + Send + Sync + 'static,
    {
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        self.ops.push(Op {
            address,
            event: event.into(),
            change: Change::Add(token, Arc::new(handler)),
        });
        SubscriptionToken(token)
    }

    /// Queue removal of a handler added earlier.
    pub fn remove(&mut self, address: Address, event: impl Into<String>, token: SubscriptionToken) {
        self.ops.push(Op {
            address,
            event: event.into(),
            change: Change::Remove(token.0),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Per-connection event subscriptions.
pub struct SubscriptionManager {
    tree: Mutex<SubscriptionTree>,
    /// Held from staging until the last ack of a batch.
    wire: tokio::sync::Mutex<()>,
    tokens: Arc<AtomicU64>,
    delivery: mpsc::UnboundedSender<Delivery>,
}

impl SubscriptionManager {
    /// Create a manager rooted at the cluster of `root` and start its delivery
    /// task. Must be called inside a tokio runtime.
    pub fn new(root: Address) -> Self {
        let (delivery, rx) = mpsc::unbounded_channel();
        tokio::spawn(delivery_loop(rx));
        Self {
            tree: Mutex::new(SubscriptionTree::new(root)),
            wire: tokio::sync::Mutex::new(()),
            tokens: Arc::new(AtomicU64::new(1)),
            delivery,
        }
    }

    /// Start an empty batch.
    pub fn batch(&self) -> SubscriptionBatch {
        SubscriptionBatch {
            tokens: self.tokens.clone(),
            ops: Vec::new(),
        }
    }

    /// Apply `batch` locally, then send one registration request per
    /// destination whose wire-visible set changed and await each ack.
    ///
    /// Batches reach the wire one at a time, in the order they were applied.
    /// If a destination's registration fails, the local changes for that
    /// destination and for every destination not yet sent are undone and the
    /// error is returned; destinations already acknowledged stay applied.
    pub async fn apply(&self, connection: &Connection, batch: SubscriptionBatch) -> Result<()> {
        let _wire = self.wire.lock().await;
        let mut staged = self.stage(batch).into_iter();
        while let Some(Staged { request, undo }) = staged.next() {
            tracing::debug!(
                destination = ?request.destination,
                added = ?request.added,
                removed = ?request.removed,
                "Sending event registration"
            );
            let outcome = match connection
                .send_request(Message::EventRegistration(request), CancellationToken::new())
                .await
            {
                Ok(reply) => into_success(reply).map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                tracing::debug!(error = %e, "Event registration refused, rolling back");
                let mut tree = self.tree.lock();
                roll_back(&mut tree, undo);
                for rest in staged.by_ref() {
                    roll_back(&mut tree, rest.undo);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Apply the batch to the tree under one lock and compute the wire deltas,
    /// grouped by destination in first-seen order.
    fn stage(&self, batch: SubscriptionBatch) -> Vec<Staged> {
        let mut groups: Vec<(RelativeKey, Staged)> = Vec::new();
        let mut tree = self.tree.lock();

        for op in batch.ops {
            let key = RelativeKey::new(op.address.clone());
            let index = match groups.iter().position(|(k, _)| *k == key) {
                Some(index) => index,
                None => {
                    groups.push((
                        key,
                        Staged {
                            request: EventRegistrationRequest {
                                destination: Some(op.address.clone()),
                                ..Default::default()
                            },
                            undo: Vec::new(),
                        },
                    ));
                    groups.len() - 1
                }
            };
            let staged = &mut groups[index].1;

            let (is_add, changed) = match op.change {
                Change::Add(token, handler) => {
                    let first = tree.add_handler(&op.address, &op.event, token, handler);
                    staged.undo.push(Undo::Added {
                        address: op.address,
                        event: op.event.clone(),
                        token,
                    });
                    (true, first)
                }
                Change::Remove(token) => match tree.take_handler(&op.address, &op.event, token) {
                    Some((handler, last)) => {
                        staged.undo.push(Undo::Removed {
                            address: op.address,
                            event: op.event.clone(),
                            token,
                            handler,
                        });
                        (false, last)
                    }
                    None => (false, false),
                },
            };
            if !changed {
                continue;
            }

            let request = &mut staged.request;
            let (same, opposite) = if is_add {
                (&mut request.added, &mut request.removed)
            } else {
                (&mut request.removed, &mut request.added)
            };
            // A transition undone within the batch never reaches the wire.
            match opposite.iter().position(|name| *name == op.event) {
                Some(pos) => {
                    opposite.remove(pos);
                }
                None => same.push(op.event),
            }
        }

        groups
            .into_iter()
            .map(|(_, staged)| staged)
            .filter(|s| !s.request.added.is_empty() || !s.request.removed.is_empty())
            .collect()
    }

    /// Register a callback fired when `address` (or an ancestor) is lost.
    pub fn subscribe_endpoint_lost<F>(&self, address: &Address, callback: F) -> LostToken
    where
        F: Fn(&LostNotification) + Send + Sync + 'static,
    {
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        self.tree.lock().add_lost(address, token, Arc::new(callback));
        LostToken(token)
    }

    /// Remove a lost callback. Returns whether it was registered.
    pub fn unsubscribe_endpoint_lost(&self, address: &Address, token: LostToken) -> bool {
        self.tree.lock().remove_lost(address, token.0)
    }

    /// Number of local handlers for `(address, event)`.
    pub fn handler_count(&self, address: &Address, event: &str) -> usize {
        self.tree.lock().handler_count(address, event)
    }

    /// Discard the subtree at `address`, firing lost callbacks with
    /// [`LostReason::Destroyed`].
    pub fn discard(&self, address: &Address) {
        self.cascade(address, LostReason::Destroyed);
    }

    pub(crate) fn on_event(&self, message: EventRaisedMessage) {
        let handlers = self
            .tree
            .lock()
            .handlers(&message.endpoint, &message.event_name);
        if handlers.is_empty() {
            tracing::debug!(
                endpoint = %message.endpoint,
                event = %message.event_name,
                "Dropping event with no local handlers"
            );
            return;
        }
        let _ = self.delivery.send(Delivery::Event { handlers, message });
    }

    pub(crate) fn on_endpoint_lost(&self, address: &Address) {
        self.cascade(address, LostReason::RemoteEndpointLost);
    }

    pub(crate) fn connection_failed(&self) {
        let root = self.tree.lock().root_address().cloned();
        if let Some(root) = root {
            self.cascade(&root, LostReason::LocalFailure);
        }
    }

    fn cascade(&self, address: &Address, reason: LostReason) {
        let detached = self.tree.lock().detach(address);
        if !detached.is_empty() {
            tracing::debug!(%address, %reason, nodes = detached.len(), "Subscription cascade");
        }
        for node in detached {
            if node.lost.is_empty() {
                continue;
            }
            let notification = LostNotification {
                original_address: address.clone(),
                current_address: node.address,
                reason,
            };
            let _ = self.delivery.send(Delivery::Lost {
                callbacks: node.lost,
                notification,
            });
        }
    }
}

async fn delivery_loop(mut rx: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Event { handlers, message } => {
                for handler in handlers {
                    if catch_unwind(AssertUnwindSafe(|| handler(&message))).is_err() {
                        tracing::error!(
                            endpoint = %message.endpoint,
                            event = %message.event_name,
                            "Event handler panicked"
                        );
                    }
                }
            }
            Delivery::Lost {
                callbacks,
                notification,
            } => {
                for callback in callbacks {
                    if catch_unwind(AssertUnwindSafe(|| callback(&notification))).is_err() {
                        tracing::error!(
                            address = %notification.current_address,
                            "Endpoint-lost callback panicked"
                        );
                    }
                }
            }
        }
    }
}
