//! Bounded packet queue between the network and playback.
//!
//! Producers (network callbacks) and the consumer (playback task) live on
//! different threads, so every read-modify-write happens under one mutex.

use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// What to discard when a push finds the queue full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued packet to make room (favours latency)
    #[default]
    DropOldest,
    /// Reject the incoming packet (favours continuity)
    DropNewest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    DroppedOldest,
    DroppedNewest,
}

pub struct PacketQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl<T> PacketQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: T) -> PushOutcome {
        let mut items = self.lock();
        if items.len() < self.capacity {
            items.push_back(item);
            return PushOutcome::Queued;
        }

        self.dropped.fetch_add(1, Ordering::Relaxed);
        match self.policy {
            OverflowPolicy::DropOldest => {
                items.pop_front();
                items.push_back(item);
                PushOutcome::DroppedOldest
            }
            OverflowPolicy::DropNewest => PushOutcome::DroppedNewest,
        }
    }

    /// Remove and return the oldest packet
    pub fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Packets discarded because of overflow since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = PacketQueue::new(4, OverflowPolicy::DropOldest);
        for i in 0..3 {
            assert_eq!(queue.push(i), PushOutcome::Queued);
        }
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_drop_oldest_keeps_latest() {
        let queue = PacketQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.push(3), PushOutcome::DroppedOldest);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn test_drop_newest_keeps_earliest() {
        let queue = PacketQueue::new(2, OverflowPolicy::DropNewest);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.push(3), PushOutcome::DroppedNewest);

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let queue = PacketQueue::new(0, OverflowPolicy::DropOldest);
        assert_eq!(queue.push('a'), PushOutcome::Queued);
        assert_eq!(queue.push('b'), PushOutcome::DroppedOldest);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some('b'));
    }

    #[test]
    fn test_concurrent_producers_never_exceed_capacity() {
        let queue = Arc::new(PacketQueue::new(16, OverflowPolicy::DropOldest));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        queue.push(t * 1000 + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.len(), 16);
        assert_eq!(queue.dropped(), 400 - 16);
    }
}
