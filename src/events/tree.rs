//! Subscription tree.
//!
//! ```text
//! /                      (root: the remote cluster)
//! ├── /worker-1          (process)
//! │   ├── /worker-1/calc   handlers{ "Changed": {t1, t2} }, lost{ l1 }
//! │   └── /worker-1/log    handlers{ "Line": {t3} }
//! └── /worker-2
//!     └── /worker-2/calc   lost{ l2 }
//! ```
//!
//! Nodes are keyed by [`RelativeKey`] so registrations made through a relative
//! address match absolute addresses reported by the peer. A node exists while
//! it has handlers, lost callbacks or children; the root always exists.
//! The tree is plain data: the manager holds it under one lock.

use std::collections::{HashMap, HashSet};

use super::{EventHandler, LostCallback};
use crate::address::{Address, RelativeKey};

struct Node {
    address: Address,
    parent: Option<RelativeKey>,
    children: HashSet<RelativeKey>,
    handlers: HashMap<String, Vec<(u64, EventHandler)>>,
    lost: Vec<(u64, LostCallback)>,
}

impl Node {
    fn new(address: Address, parent: Option<RelativeKey>) -> Self {
        Self {
            address,
            parent,
            children: HashSet::new(),
            handlers: HashMap::new(),
            lost: Vec::new(),
        }
    }

    fn is_unused(&self) -> bool {
        self.children.is_empty() && self.handlers.is_empty() && self.lost.is_empty()
    }
}

/// A node removed by a cascade, with the callbacks it still held.
pub(crate) struct DetachedNode {
    pub(crate) address: Address,
    pub(crate) lost: Vec<LostCallback>,
}

pub(crate) struct SubscriptionTree {
    root: RelativeKey,
    nodes: HashMap<RelativeKey, Node>,
}

impl SubscriptionTree {
    pub(crate) fn new(root: Address) -> Self {
        let root_address = root.cluster_address().cloned().unwrap_or(root);
        let key = RelativeKey::new(root_address.clone());
        let mut nodes = HashMap::new();
        nodes.insert(key.clone(), Node::new(root_address, None));
        Self { root: key, nodes }
    }

    pub(crate) fn root_address(&self) -> Option<&Address> {
        self.nodes.get(&self.root).map(|n| &n.address)
    }

    /// Ancestor chain from the root down to `address` (inclusive).
    fn lineage(address: &Address) -> Vec<Address> {
        let mut chain = Vec::with_capacity(3);
        if let Ok(Some(_)) = address.process_id() {
            if let Ok(process) = address.process_address() {
                if process != address {
                    chain.push(process.clone());
                }
            }
            chain.push(address.clone());
        }
        chain
    }

    fn ensure(&mut self, address: &Address) -> RelativeKey {
        let mut parent = self.root.clone();
        for step in Self::lineage(address) {
            let key = RelativeKey::new(step.clone());
            if !self.nodes.contains_key(&key) {
                self.nodes
                    .insert(key.clone(), Node::new(step, Some(parent.clone())));
                if let Some(p) = self.nodes.get_mut(&parent) {
                    p.children.insert(key.clone());
                }
            }
            parent = key;
        }
        parent
    }

    /// Add a handler. Returns `true` when this is the first handler for the
    /// event on that node.
    pub(crate) fn add_handler(
        &mut self,
        address: &Address,
        event: &str,
        token: u64,
        handler: EventHandler,
    ) -> bool {
        let key = self.ensure(address);
        let Some(node) = self.nodes.get_mut(&key) else {
            return false;
        };
        let set = node.handlers.entry(event.to_string()).or_default();
        set.push((token, handler));
        set.len() == 1
    }

    /// Remove a handler. Returns `true` when the last handler for the event
    /// on that node went away.
    pub(crate) fn remove_handler(&mut self, address: &Address, event: &str, token: u64) -> bool {
        self.take_handler(address, event, token)
            .is_some_and(|(_, last)| last)
    }

    /// Remove a handler and hand it back, with whether it was the last one
    /// for the event. `None` if the token was not registered there.
    pub(crate) fn take_handler(
        &mut self,
        address: &Address,
        event: &str,
        token: u64,
    ) -> Option<(EventHandler, bool)> {
        let key = RelativeKey::new(address.clone());
        let node = self.nodes.get_mut(&key)?;
        let set = node.handlers.get_mut(event)?;
        let index = set.iter().position(|(t, _)| *t == token)?;
        let (_, handler) = set.remove(index);
        let last = set.is_empty();
        if last {
            node.handlers.remove(event);
        }
        self.prune(key);
        Some((handler, last))
    }

    pub(crate) fn add_lost(&mut self, address: &Address, token: u64, callback: LostCallback) {
        let key = self.ensure(address);
        if let Some(node) = self.nodes.get_mut(&key) {
            node.lost.push((token, callback));
        }
    }

    pub(crate) fn remove_lost(&mut self, address: &Address, token: u64) -> bool {
        let key = RelativeKey::new(address.clone());
        let Some(node) = self.nodes.get_mut(&key) else {
            return false;
        };
        let before = node.lost.len();
        node.lost.retain(|(t, _)| *t != token);
        let removed = node.lost.len() != before;
        self.prune(key);
        removed
    }

    /// Snapshot of the handlers for `(address, event)`.
    pub(crate) fn handlers(&self, address: &Address, event: &str) -> Vec<EventHandler> {
        self.nodes
            .get(&RelativeKey::new(address.clone()))
            .and_then(|node| node.handlers.get(event))
            .map(|set| set.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of handlers for `(address, event)`.
    pub(crate) fn handler_count(&self, address: &Address, event: &str) -> usize {
        self.nodes
            .get(&RelativeKey::new(address.clone()))
            .and_then(|node| node.handlers.get(event))
            .map_or(0, Vec::len)
    }

    pub(crate) fn contains(&self, address: &Address) -> bool {
        self.nodes.contains_key(&RelativeKey::new(address.clone()))
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Remove the subtree at `address`, depth-first (node before its
    /// children). The root itself is emptied but kept.
    pub(crate) fn detach(&mut self, address: &Address) -> Vec<DetachedNode> {
        let key = RelativeKey::new(address.clone());
        let parent = match self.nodes.get(&key) {
            Some(node) => node.parent.clone(),
            None => return Vec::new(),
        };

        let mut detached = Vec::new();
        let mut stack = vec![key.clone()];
        while let Some(current) = stack.pop() {
            let is_root = current == self.root;
            let node = if is_root {
                self.nodes.get_mut(&current).map(|root| {
                    let children = std::mem::take(&mut root.children);
                    let lost = std::mem::take(&mut root.lost);
                    root.handlers.clear();
                    (root.address.clone(), children, lost)
                })
            } else {
                self.nodes
                    .remove(&current)
                    .map(|node| (node.address, node.children, node.lost))
            };
            let Some((address, children, lost)) = node else {
                continue;
            };

            detached.push(DetachedNode {
                address,
                lost: lost.into_iter().map(|(_, cb)| cb).collect(),
            });

            // Reverse so the stack pops children in a stable order.
            let mut children: Vec<_> = children.into_iter().collect();
            children.sort_by(|a, b| b.address().as_str().cmp(a.address().as_str()));
            stack.extend(children);
        }

        if let Some(parent) = parent {
            if let Some(node) = self.nodes.get_mut(&parent) {
                node.children.remove(&key);
            }
            self.prune(parent);
        }

        detached
    }

    /// Remove `key` and its ancestors while they are unused.
    fn prune(&mut self, mut key: RelativeKey) {
        while key != self.root {
            let Some(node) = self.nodes.get(&key) else {
                return;
            };
            if !node.is_unused() {
                return;
            }
            let parent = node.parent.clone();
            self.nodes.remove(&key);
            match parent {
                Some(parent) => {
                    if let Some(p) = self.nodes.get_mut(&parent) {
                        p.children.remove(&key);
                    }
                    key = parent;
                }
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LostNotification;
    use crate::message::EventRaisedMessage;
    use std::sync::Arc;

    fn handler() -> EventHandler {
        Arc::new(|_: &EventRaisedMessage| {})
    }

    fn lost() -> LostCallback {
        Arc::new(|_: &LostNotification| {})
    }

    fn addr(text: &str) -> Address {
        Address::parse(text).unwrap()
    }

    #[test]
    fn test_ancestors_created_and_pruned() {
        let mut tree = SubscriptionTree::new(addr("proclink://h"));
        assert_eq!(tree.len(), 1);

        assert!(tree.add_handler(&addr("/p/e"), "Changed", 1, handler()));
        assert!(tree.contains(&addr("/p")));
        assert!(tree.contains(&addr("proclink://h/p/e")));
        assert_eq!(tree.len(), 3);

        assert!(tree.remove_handler(&addr("/p/e"), "Changed", 1));
        assert_eq!(tree.len(), 1);
        assert!(!tree.contains(&addr("/p")));
    }

    #[test]
    fn test_counts_transitions() {
        let mut tree = SubscriptionTree::new(Address::root());
        let e = addr("/p/e");
        assert!(tree.add_handler(&e, "X", 1, handler()));
        assert!(!tree.add_handler(&e, "X", 2, handler()));
        assert_eq!(tree.handler_count(&e, "X"), 2);

        assert!(!tree.remove_handler(&e, "X", 1));
        assert!(!tree.remove_handler(&e, "X", 1));
        assert!(tree.remove_handler(&e, "X", 2));
    }

    #[test]
    fn test_lost_callbacks_keep_node_alive() {
        let mut tree = SubscriptionTree::new(Address::root());
        let e = addr("/p/e");
        tree.add_lost(&e, 7, lost());
        assert!(tree.contains(&e));
        assert!(tree.remove_lost(&e, 7));
        assert!(!tree.contains(&e));
    }

    #[test]
    fn test_detach_process_cascades_depth_first() {
        let mut tree = SubscriptionTree::new(Address::root());
        tree.add_lost(&addr("/p"), 1, lost());
        tree.add_lost(&addr("/p/a"), 2, lost());
        tree.add_lost(&addr("/p/b"), 3, lost());
        tree.add_lost(&addr("/q/c"), 4, lost());

        let detached = tree.detach(&addr("proclink://remote/p"));
        let order: Vec<_> = detached.iter().map(|d| d.address.as_str().to_string()).collect();
        assert_eq!(order, vec!["/p", "/p/a", "/p/b"]);
        assert!(detached.iter().all(|d| d.lost.len() == 1));

        assert!(!tree.contains(&addr("/p")));
        assert!(tree.contains(&addr("/q/c")));

        // Detaching again finds nothing.
        assert!(tree.detach(&addr("/p")).is_empty());
    }

    #[test]
    fn test_detach_root_keeps_root() {
        let mut tree = SubscriptionTree::new(Address::root());
        tree.add_lost(&addr("/p/a"), 1, lost());
        tree.add_handler(&addr("/q/b"), "X", 2, handler());

        let detached = tree.detach(&Address::root());
        assert_eq!(detached.len(), 5);
        assert_eq!(tree.len(), 1);
        assert!(tree.root_address().is_some());
    }

    #[test]
    fn test_detach_endpoint_prunes_emptied_process() {
        let mut tree = SubscriptionTree::new(Address::root());
        tree.add_lost(&addr("/p/a"), 1, lost());
        tree.add_lost(&addr("/p/b"), 2, lost());

        assert_eq!(tree.detach(&addr("/p/a")).len(), 1);
        assert!(tree.contains(&addr("/p")));

        assert_eq!(tree.detach(&addr("/p/b")).len(), 1);
        assert!(!tree.contains(&addr("/p")));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_take_handler_returns_it() {
        let mut tree = SubscriptionTree::new(Address::root());
        let e = addr("/p/e");
        tree.add_handler(&e, "X", 1, handler());
        tree.add_handler(&e, "X", 2, handler());

        let (_, last) = tree.take_handler(&e, "X", 1).unwrap();
        assert!(!last);
        assert!(tree.take_handler(&e, "X", 1).is_none());
        let (restored, last) = tree.take_handler(&e, "X", 2).unwrap();
        assert!(last);
        assert!(!tree.contains(&e));

        assert!(tree.add_handler(&e, "X", 2, restored));
        assert_eq!(tree.handler_count(&e, "X"), 1);
    }
}
