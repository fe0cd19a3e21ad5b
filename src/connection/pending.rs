//! Pending-call table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, RpcError};
use crate::message::{CallId, Message, NO_CALL_ID};

/// Completion channel of one outstanding call.
pub(crate) type Completion = oneshot::Sender<Result<Message>>;

#[derive(Default)]
struct State {
    calls: HashMap<CallId, Completion>,
    lost: Option<Arc<RpcError>>,
}

/// Outstanding calls of one connection, keyed by call id.
pub(crate) struct PendingCalls {
    state: Mutex<State>,
    next_id: AtomicU64,
    max: usize,
}

impl PendingCalls {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(1),
            max,
        }
    }

    /// Fresh call id, never [`NO_CALL_ID`].
    pub(crate) fn next_id(&self) -> CallId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != NO_CALL_ID {
                return id;
            }
        }
    }

    /// Register a call. Fails once the table has been failed, when the id is
    /// already outstanding, or when the limit is reached.
    pub(crate) fn register(&self, id: CallId) -> Result<oneshot::Receiver<Result<Message>>> {
        let mut state = self.state.lock();
        if let Some(cause) = &state.lost {
            return Err(RpcError::ConnectionLost(cause.clone()));
        }
        if state.calls.len() >= self.max {
            return Err(RpcError::Protocol(format!(
                "too many outstanding calls (limit {})",
                self.max
            )));
        }
        if state.calls.contains_key(&id) {
            return Err(RpcError::Protocol(format!("call id {id} is already outstanding")));
        }
        let (tx, rx) = oneshot::channel();
        state.calls.insert(id, tx);
        Ok(rx)
    }

    /// Remove and return the completion for `id`.
    pub(crate) fn take(&self, id: CallId) -> Option<Completion> {
        self.state.lock().calls.remove(&id)
    }

    /// Forget `id` without completing it.
    pub(crate) fn remove(&self, id: CallId) {
        self.state.lock().calls.remove(&id);
    }

    /// Fail every outstanding call and refuse new ones. Returns how many failed.
    pub(crate) fn fail_all(&self, cause: &Arc<RpcError>) -> usize {
        let drained: Vec<Completion> = {
            let mut state = self.state.lock();
            state.lost.get_or_insert_with(|| cause.clone());
            state.calls.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(RpcError::ConnectionLost(cause.clone())));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().calls.len()
    }
}

/// Removes a pending entry when the awaiting future goes away.
pub(crate) struct PendingGuard<'a> {
    calls: &'a PendingCalls,
    id: CallId,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(calls: &'a PendingCalls, id: CallId) -> Self {
        Self { calls, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.calls.remove(self.id);
    }
}
