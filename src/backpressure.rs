//! Bounded write budget for a connection's writer task.
//!
//! Every data frame handed to the writer takes one slot; the writer gives
//! slots back once the frame has hit the pipe (or was dropped on abort).
//! Producers that find the budget exhausted wait, but never longer than the
//! configured timeout, after which they get
//! [`RpcError::BackpressureTimeout`]. Keep-alives bypass the budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::{Result, RpcError};

/// Frames a connection may have queued before producers start waiting.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// How long a producer waits for a slot.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Slot accounting shared by producers and the writer task.
///
/// Clones share the same budget.
#[derive(Debug, Clone)]
pub struct WriteBudget {
    slots: Arc<Semaphore>,
    capacity: usize,
    timeout: Duration,
}

impl WriteBudget {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            timeout,
        }
    }

    /// Whether the next producer would have to wait.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.slots.available_permits() == 0
    }

    /// Slots currently held by queued frames.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> Result<()> {
        let permit = self
            .slots
            .try_acquire()
            .map_err(|_| RpcError::BackpressureTimeout)?;
        // Ownership of the slot moves to the queued frame.
        permit.forget();
        Ok(())
    }

    /// Take a slot, waiting up to the budget's timeout.
    pub async fn acquire(&self) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(())
            }
            // The semaphore is never closed, so only the timeout can land here.
            Ok(Err(_)) | Err(_) => Err(RpcError::BackpressureTimeout),
        }
    }

    /// Give back one slot.
    #[inline]
    pub fn give_back(&self) {
        self.give_back_many(1);
    }

    /// Give back `count` slots, never more than are in use.
    pub fn give_back_many(&self, count: usize) {
        let count = count.min(self.in_use());
        if count > 0 {
            self.slots.add_permits(count);
        }
    }
}

impl Default for WriteBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING, DEFAULT_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_budget_is_empty() {
        let budget = WriteBudget::default();
        assert_eq!(budget.capacity(), DEFAULT_MAX_PENDING);
        assert_eq!(budget.in_use(), 0);
        assert!(!budget.is_exhausted());
    }

    #[test]
    fn test_zero_capacity_still_admits_one_frame() {
        let budget = WriteBudget::new(0, DEFAULT_TIMEOUT);
        assert_eq!(budget.capacity(), 1);
        budget.try_acquire().unwrap();
        assert!(budget.is_exhausted());
    }

    #[test]
    fn test_exhausted_budget_refuses_immediately() {
        let budget = WriteBudget::new(3, DEFAULT_TIMEOUT);
        for _ in 0..3 {
            budget.try_acquire().unwrap();
        }
        assert!(matches!(budget.try_acquire(), Err(RpcError::BackpressureTimeout)));
        assert_eq!(budget.in_use(), 3);
    }

    #[test]
    fn test_give_back_never_exceeds_capacity() {
        let budget = WriteBudget::new(8, DEFAULT_TIMEOUT);
        for _ in 0..6 {
            budget.try_acquire().unwrap();
        }
        budget.give_back_many(4);
        assert_eq!(budget.in_use(), 2);

        // An abort may report more dropped frames than are still accounted for.
        budget.give_back_many(50);
        assert_eq!(budget.in_use(), 0);
        assert_eq!(budget.slots.available_permits(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_after_timeout() {
        let budget = WriteBudget::new(1, Duration::from_millis(250));
        budget.try_acquire().unwrap();

        let started = tokio::time::Instant::now();
        let err = budget.acquire().await.unwrap_err();
        assert!(matches!(err, RpcError::BackpressureTimeout));
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_progress_unblocks_producer() {
        let budget = WriteBudget::new(1, Duration::from_secs(5));
        budget.try_acquire().unwrap();

        let writer = budget.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.give_back();
        });

        budget.acquire().await.unwrap();
        assert_eq!(budget.in_use(), 1);
    }
}
