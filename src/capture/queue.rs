use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

use crate::frame::Frame;

/// Default number of frames between capture and dispatch.
pub const DEFAULT_QUEUE_CAPACITY: usize = 5;

/// A captured frame waiting for dispatch.
#[derive(Debug)]
pub struct QueueEntry {
    pub frame: Frame,
    /// Milliseconds since the dispatcher epoch at enqueue time.
    pub enqueued_ms: u64,
}

/// Bounded FIFO with drop-oldest overflow.
///
/// Cloning yields another handle to the same queue. With a single producer,
/// `push` always evicts the earliest entry still queued, and the length
/// never exceeds the capacity.
pub struct FrameQueue<T = QueueEntry> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> Clone for FrameQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> FrameQueue<T> {
    /// Queue holding at most `capacity` items (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Enqueue `item`. When the queue is full the oldest entry is removed
    /// and returned so the caller can count it and reclaim its buffer.
    pub fn push(&self, item: T) -> Option<T> {
        let mut item = item;
        let mut evicted = None;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    match self.rx.try_recv() {
                        // The consumer may have drained the queue in between;
                        // at most one entry is evicted per push.
                        Ok(oldest) if evicted.is_none() => evicted = Some(oldest),
                        Ok(oldest) => drop(oldest),
                        Err(TryRecvError::Empty) => {}
                        Err(TryRecvError::Disconnected) => return evicted,
                    }
                }
                // Both halves live in `self`.
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    /// Oldest entry, waiting up to `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn overflow_evicts_oldest() {
        let queue = FrameQueue::new(3);
        for i in 0..3 {
            assert!(queue.push(i).is_none());
        }
        assert_eq!(queue.push(3), Some(0));
        assert_eq!(queue.push(4), Some(1));
        let drained: Vec<i32> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, vec![2, 3, 4]);
    }

    #[test]
    fn random_push_pop_matches_fifo_model() {
        let mut rng = StdRng::seed_from_u64(11);
        let queue = FrameQueue::new(DEFAULT_QUEUE_CAPACITY);
        let mut model = VecDeque::new();
        for next in 0..2_000u64 {
            if rng.gen_bool(0.7) {
                let expected = if model.len() == DEFAULT_QUEUE_CAPACITY {
                    model.pop_front()
                } else {
                    None
                };
                assert_eq!(queue.push(next), expected);
                model.push_back(next);
            } else {
                assert_eq!(queue.try_pop(), model.pop_front());
            }
            assert!(queue.len() <= DEFAULT_QUEUE_CAPACITY);
            assert_eq!(queue.len(), model.len());
        }
    }

    #[test]
    fn pop_timeout_returns_none_when_empty() {
        let queue: FrameQueue<u8> = FrameQueue::new(1);
        assert!(queue.pop_timeout(Duration::from_millis(5)).is_none());
        assert_eq!(queue.capacity(), 1);
        assert!(queue.is_empty());
    }
}
