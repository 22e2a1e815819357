//! Frame consumers.
//!
//! Consumers are called synchronously from the dispatch thread, in
//! registration order, once per delivered frame. They must return quickly;
//! a consumer that cannot keep up should be wrapped in a `QueuedConsumer`,
//! which copies frames into its own bounded drop-oldest queue and processes
//! them on a dedicated worker thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};

use super::queue::FrameQueue;
use crate::frame::Frame;
use crate::pool::BufferPool;

/// Receives delivered frames.
pub trait FrameConsumer: Send {
    fn on_frame(&mut self, frame: &Frame, timestamp_ms: u64);
}

impl<F> FrameConsumer for F
where
    F: FnMut(&Frame, u64) + Send,
{
    fn on_frame(&mut self, frame: &Frame, timestamp_ms: u64) {
        self(frame, timestamp_ms)
    }
}

/// Reports the occupancy of some queue, sampled from another thread.
pub type OccupancyProbe = Arc<dyn Fn() -> usize + Send + Sync>;

const WORKER_POLL: Duration = Duration::from_millis(50);

/// Isolates a slow consumer behind its own queue and worker thread.
pub struct QueuedConsumer {
    name: String,
    queue: FrameQueue<Frame>,
    returns: Receiver<Vec<u8>>,
    pool: BufferPool,
    dropped: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl QueuedConsumer {
    pub fn spawn<C>(name: &str, capacity: usize, inner: C) -> Result<Self>
    where
        C: FrameConsumer + 'static,
    {
        let queue = FrameQueue::new(capacity);
        let (return_tx, returns) = bounded(queue.capacity() + 1);
        let running = Arc::new(AtomicBool::new(true));

        let worker_queue = queue.clone();
        let worker_running = running.clone();
        let worker = std::thread::Builder::new()
            .name(format!("consumer-{}", name))
            .spawn(move || run_worker(inner, worker_queue, return_tx, worker_running))
            .with_context(|| format!("failed to spawn consumer worker '{}'", name))?;

        Ok(Self {
            name: name.to_string(),
            queue,
            returns,
            pool: BufferPool::new(),
            dropped: Arc::new(AtomicU64::new(0)),
            running,
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frames waiting for the worker.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Frames evicted because the worker fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Probe over this consumer's queue, usable after the consumer has been
    /// moved into a dispatcher.
    pub fn occupancy_probe(&self) -> OccupancyProbe {
        let queue = self.queue.clone();
        Arc::new(move || queue.len())
    }

    /// Let the worker finish the queued frames and wait for it.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("consumer '{}' worker panicked", self.name);
            }
        }
    }
}

impl FrameConsumer for QueuedConsumer {
    fn on_frame(&mut self, frame: &Frame, _timestamp_ms: u64) {
        for buffer in self.returns.try_iter() {
            self.pool.release(frame.shape(), buffer);
        }
        let mut data = self.pool.get(frame.shape());
        data.copy_from_slice(frame.pixels());
        let copy = match Frame::new(frame.width, frame.height, data, frame.timestamp_ms) {
            Ok(copy) => copy,
            Err(err) => {
                log::warn!("consumer '{}': {}", self.name, err);
                return;
            }
        };
        if let Some(evicted) = self.queue.push(copy) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let shape = evicted.shape();
            self.pool.release(shape, evicted.into_data());
        }
    }
}

impl Drop for QueuedConsumer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<C: FrameConsumer>(
    mut inner: C,
    queue: FrameQueue<Frame>,
    returns: Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) || !queue.is_empty() {
        let Some(frame) = queue.pop_timeout(WORKER_POLL) else {
            continue;
        };
        let timestamp_ms = frame.timestamp_ms;
        inner.on_frame(&frame, timestamp_ms);
        // Full means the producer already has spares; let it drop.
        let _ = returns.try_send(frame.into_data());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn closures_are_consumers() {
        let mut seen = Vec::new();
        {
            let mut consumer = |frame: &Frame, ts: u64| seen.push((frame.width, ts));
            let frame = Frame::filled(2, 2, [0, 0, 0], 7);
            consumer.on_frame(&frame, 7);
        }
        assert_eq!(seen, vec![(2, 7)]);
    }

    #[test]
    fn queued_consumer_delivers_everything_on_shutdown() -> Result<()> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let mut consumer = QueuedConsumer::spawn("test", 64, move |frame: &Frame, ts: u64| {
            sink.lock().expect("lock").push((frame.pixel(0, 0)[0], ts));
        })?;
        for i in 0..10u8 {
            consumer.on_frame(&Frame::filled(3, 3, [i, i, i], i as u64), i as u64);
        }
        consumer.shutdown();

        let received = received.lock().expect("lock");
        let expected: Vec<(u8, u64)> = (0..10u8).map(|i| (i, i as u64)).collect();
        assert_eq!(*received, expected);
        assert_eq!(consumer.dropped(), 0);
        Ok(())
    }

    #[test]
    fn slow_worker_drops_oldest_and_probe_sees_backlog() -> Result<()> {
        let gate = Arc::new(AtomicBool::new(false));
        let worker_gate = gate.clone();
        let mut consumer = QueuedConsumer::spawn("slow", 2, move |_: &Frame, _: u64| {
            while !worker_gate.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        })?;
        let probe = consumer.occupancy_probe();

        for i in 0..20u8 {
            consumer.on_frame(&Frame::filled(2, 2, [i, i, i], 0), 0);
        }
        assert!(probe() <= 2);
        // The worker holds at most one frame, the queue at most two.
        assert!(consumer.dropped() >= 17);

        gate.store(true, Ordering::SeqCst);
        consumer.shutdown();
        assert_eq!(probe(), 0);
        Ok(())
    }
}
