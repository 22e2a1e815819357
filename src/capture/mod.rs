//! Capture and dispatch.
//!
//! `CaptureDispatcher` runs two threads around a bounded drop-oldest queue:
//!
//! - capture: pulls raw frames from the source, normalizes them into pooled
//!   RGB buffers, timestamps and enqueues them. A full queue evicts its
//!   oldest entry, which is counted as a drop.
//! - dispatch: waits (bounded) for queued frames and delivers each one
//!   synchronously to every registered consumer, in registration order. After
//!   delivery the frame buffer travels back to capture over a return channel
//!   so the capture pool stays single-owner.
//!
//! Shutdown is cooperative. `stop` clears the run flag; capture exits after
//! its current iteration, dispatch drains what is still queued and exits.

mod consumer;
mod fps;
mod queue;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::KernelError;
use crate::frame::{Frame, Shape};
use crate::ingest::{normalize_into, FrameSource, RawFrame};
use crate::pool::BufferPool;
use crate::status::{LogStatusSink, StatusSink};

pub use consumer::{FrameConsumer, OccupancyProbe, QueuedConsumer};
pub use fps::{FpsMeter, DEFAULT_FPS_WINDOW};
pub use queue::{FrameQueue, QueueEntry, DEFAULT_QUEUE_CAPACITY};

pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_millis(50);
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    /// Longest dispatch waits for a queued frame before re-checking the run flag.
    pub dispatch_timeout: Duration,
    pub fps_window: usize,
    /// Longest `start` waits for the source to open.
    pub open_timeout: Duration,
    /// Pause after a transient acquisition failure or an empty grab.
    pub retry_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            fps_window: DEFAULT_FPS_WINDOW,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// Where and at what size to capture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureParams {
    pub device: String,
    pub width: u32,
    pub height: u32,
}

impl CaptureParams {
    pub fn new(device: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            device: device.into(),
            width,
            height,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.trim().is_empty() {
            return Err(KernelError::configuration("device must not be empty"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(KernelError::configuration(format!(
                "frame dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|px| px.checked_mul(3))
            .is_none()
        {
            return Err(KernelError::configuration(format!(
                "frame dimensions {}x{} overflow",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatcherState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl DispatcherState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DispatcherState::Starting,
            2 => DispatcherState::Running,
            3 => DispatcherState::Stopping,
            _ => DispatcherState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatcherState::Stopped => "stopped",
            DispatcherState::Starting => "starting",
            DispatcherState::Running => "running",
            DispatcherState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time dispatcher metrics.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchMetrics {
    pub state: DispatcherState,
    pub fps: f64,
    pub queue_len: usize,
    pub queue_capacity: usize,
    pub frames_captured: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub transient_errors: u64,
}

impl fmt::Display for DispatchMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state={} fps={:.1} queue={}/{} captured={} delivered={} dropped={} errors={}",
            self.state,
            self.fps,
            self.queue_len,
            self.queue_capacity,
            self.frames_captured,
            self.frames_delivered,
            self.frames_dropped,
            self.transient_errors
        )
    }
}

/// Scalars shared between the dispatcher, its threads and metrics readers.
#[derive(Debug, Default)]
struct Shared {
    state: AtomicU8,
    fps_bits: AtomicU64,
    queue_len: AtomicUsize,
    queue_capacity: AtomicUsize,
    captured: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    transient_errors: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: DispatcherState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn reset_counters(&self, capacity: usize) {
        self.fps_bits.store(0f64.to_bits(), Ordering::Relaxed);
        self.queue_len.store(0, Ordering::Relaxed);
        self.queue_capacity.store(capacity, Ordering::Relaxed);
        self.captured.store(0, Ordering::Relaxed);
        self.delivered.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.transient_errors.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchMetrics {
        DispatchMetrics {
            state: self.state(),
            fps: f64::from_bits(self.fps_bits.load(Ordering::Relaxed)),
            queue_len: self.queue_len.load(Ordering::Relaxed),
            queue_capacity: self.queue_capacity.load(Ordering::Relaxed),
            frames_captured: self.captured.load(Ordering::Relaxed),
            frames_delivered: self.delivered.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable read-only view of a dispatcher's metrics.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    shared: Arc<Shared>,
}

impl MetricsHandle {
    pub fn snapshot(&self) -> DispatchMetrics {
        self.shared.snapshot()
    }

    /// Occupancy of the capture/dispatch queue.
    pub fn queue_probe(&self) -> OccupancyProbe {
        let shared = self.shared.clone();
        Arc::new(move || shared.queue_len.load(Ordering::Relaxed))
    }
}

type ConsumerList = Arc<Mutex<Vec<Box<dyn FrameConsumer>>>>;

/// Per-run flags. A fresh set is created on every start so a thread left
/// over from an abandoned start can never act on a later run.
#[derive(Debug, Default)]
struct RunFlags {
    running: AtomicBool,
    capture_done: AtomicBool,
}

/// Marks capture as finished even if the capture thread unwinds.
struct CaptureDone(Arc<RunFlags>);

impl Drop for CaptureDone {
    fn drop(&mut self) {
        self.0.capture_done.store(true, Ordering::SeqCst);
    }
}

struct ActiveRun {
    flags: Arc<RunFlags>,
    device: String,
    capture: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

pub struct CaptureDispatcher {
    config: DispatcherConfig,
    shared: Arc<Shared>,
    consumers: ConsumerList,
    status: Arc<dyn StatusSink>,
    run: Option<ActiveRun>,
}

impl CaptureDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let shared = Arc::new(Shared::default());
        shared.queue_capacity.store(config.queue_capacity.max(1), Ordering::Relaxed);
        Self {
            config,
            shared,
            consumers: Arc::new(Mutex::new(Vec::new())),
            status: Arc::new(LogStatusSink),
            run: None,
        }
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status = sink;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Add a consumer. Takes effect from the next delivered frame.
    pub fn register_consumer<C>(&self, consumer: C)
    where
        C: FrameConsumer + 'static,
    {
        lock_consumers(&self.consumers).push(Box::new(consumer));
    }

    pub fn consumer_count(&self) -> usize {
        lock_consumers(&self.consumers).len()
    }

    pub fn state(&self) -> DispatcherState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    pub fn metrics(&self) -> DispatchMetrics {
        self.shared.snapshot()
    }

    pub fn metrics_handle(&self) -> MetricsHandle {
        MetricsHandle {
            shared: self.shared.clone(),
        }
    }

    /// Open `source` and start capture and dispatch.
    ///
    /// A no-op when already running. On failure the error is reported to the
    /// status sink, no thread is left capturing and the state is `Stopped`.
    pub fn start(&mut self, source: Box<dyn FrameSource>, params: CaptureParams) -> Result<()> {
        if self.run.is_some() {
            log::debug!("start ignored: dispatcher is {}", self.state());
            return Ok(());
        }
        if let Err(err) = params.validate() {
            return self.fail_start(err);
        }

        self.shared.set_state(DispatcherState::Starting);
        self.shared.reset_counters(self.config.queue_capacity.max(1));

        let flags = Arc::new(RunFlags::default());
        flags.running.store(true, Ordering::SeqCst);
        let queue = FrameQueue::new(self.config.queue_capacity);
        let (recycle_tx, recycle_rx) = bounded(queue.capacity() + 2);
        let (ready_tx, ready_rx) = bounded(1);

        let capture_loop = CaptureLoop {
            queue: queue.clone(),
            recycle: recycle_rx,
            flags: flags.clone(),
            shared: self.shared.clone(),
            pool: BufferPool::with_capacity(queue.capacity() + 2),
            shape: Shape::rgb(params.width, params.height),
            epoch: Instant::now(),
            backoff: self.config.retry_backoff,
        };
        let capture_params = params.clone();
        let capture = match std::thread::Builder::new()
            .name("arena-capture".to_string())
            .spawn(move || capture_loop.run(source, capture_params, ready_tx))
        {
            Ok(handle) => handle,
            Err(err) => {
                return self.fail_start(
                    anyhow::Error::new(err).context("failed to spawn capture thread"),
                )
            }
        };

        match ready_rx.recv_timeout(self.config.open_timeout) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                flags.running.store(false, Ordering::SeqCst);
                if capture.join().is_err() {
                    log::error!("capture thread panicked during open");
                }
                let err = if KernelError::classify(&err).is_some() {
                    err
                } else {
                    KernelError::configuration(format!(
                        "failed to open {}: {:#}",
                        params.device, err
                    ))
                };
                return self.fail_start(err);
            }
            Err(_) => {
                // The capture thread closes the source as soon as open returns.
                flags.running.store(false, Ordering::SeqCst);
                return self.fail_start(KernelError::configuration(format!(
                    "opening {} timed out after {:?}",
                    params.device, self.config.open_timeout
                )));
            }
        }

        let dispatch_loop = DispatchLoop {
            queue,
            recycle: recycle_tx,
            consumers: self.consumers.clone(),
            flags: flags.clone(),
            shared: self.shared.clone(),
            timeout: self.config.dispatch_timeout,
            meter: FpsMeter::new(self.config.fps_window),
        };
        let dispatch = std::thread::Builder::new()
            .name("arena-dispatch".to_string())
            .spawn(move || dispatch_loop.run())
            .context("failed to spawn dispatch thread");
        let dispatch = match dispatch {
            Ok(handle) => handle,
            Err(err) => {
                flags.running.store(false, Ordering::SeqCst);
                if capture.join().is_err() {
                    log::error!("capture thread panicked");
                }
                return self.fail_start(err);
            }
        };

        self.run = Some(ActiveRun {
            flags,
            device: params.device.clone(),
            capture,
            dispatch,
        });
        self.shared.set_state(DispatcherState::Running);
        self.status.status(&format!(
            "capture started on {} ({}x{})",
            params.device, params.width, params.height
        ));
        Ok(())
    }

    /// Stop both threads, drain queued frames and release the source.
    /// A no-op when already stopped.
    pub fn stop(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        self.shared.set_state(DispatcherState::Stopping);
        run.flags.running.store(false, Ordering::SeqCst);
        if run.capture.join().is_err() {
            log::error!("capture thread panicked");
        }
        if run.dispatch.join().is_err() {
            log::error!("dispatch thread panicked");
        }
        self.shared.queue_len.store(0, Ordering::Relaxed);
        self.shared.set_state(DispatcherState::Stopped);
        self.status
            .status(&format!("capture stopped on {}: {}", run.device, self.metrics()));
    }

    fn fail_start(&self, err: anyhow::Error) -> Result<()> {
        self.shared.set_state(DispatcherState::Stopped);
        self.status.error(&format!("capture start failed: {:#}", err));
        Err(err)
    }
}

impl Drop for CaptureDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_consumers(
    consumers: &Mutex<Vec<Box<dyn FrameConsumer>>>,
) -> std::sync::MutexGuard<'_, Vec<Box<dyn FrameConsumer>>> {
    consumers.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Capture thread
// ----------------------------------------------------------------------------

struct CaptureLoop {
    queue: FrameQueue,
    recycle: Receiver<Vec<u8>>,
    flags: Arc<RunFlags>,
    shared: Arc<Shared>,
    pool: BufferPool,
    shape: Shape,
    epoch: Instant,
    backoff: Duration,
}

impl CaptureLoop {
    fn run(
        mut self,
        mut source: Box<dyn FrameSource>,
        params: CaptureParams,
        ready: Sender<Result<()>>,
    ) {
        let _done = CaptureDone(self.flags.clone());

        if let Err(err) = source.open(&params.device, params.width, params.height) {
            source.close();
            let _ = ready.send(Err(err));
            return;
        }
        if ready.send(Ok(())).is_err() || !self.flags.running.load(Ordering::SeqCst) {
            log::warn!("capture on {} abandoned after a late open", params.device);
            source.close();
            return;
        }

        while self.flags.running.load(Ordering::SeqCst) {
            self.reclaim_returned();
            match source.grab_frame() {
                Ok(Some(raw)) => {
                    if let Err(err) = self.enqueue(raw) {
                        self.transient(&err);
                    }
                }
                Ok(None) => std::thread::sleep(self.backoff),
                Err(err) => self.transient(&err),
            }
        }

        source.close();
        log::info!(
            "capture on {} finished: {} frames",
            params.device,
            source.stats().frames_captured
        );
    }

    fn reclaim_returned(&mut self) {
        for buffer in self.recycle.try_iter() {
            self.pool.release(self.shape, buffer);
        }
    }

    fn enqueue(&mut self, raw: RawFrame) -> Result<()> {
        self.shape = Shape::rgb(raw.width, raw.height);
        let mut data = self.pool.get(self.shape);
        if let Err(err) = normalize_into(&raw, &mut data) {
            self.pool.release(self.shape, data);
            return Err(err);
        }
        let enqueued_ms = self.epoch.elapsed().as_millis() as u64;
        let frame = Frame::new(raw.width, raw.height, data, enqueued_ms)?;
        self.shared.captured.fetch_add(1, Ordering::Relaxed);

        if let Some(evicted) = self.queue.push(QueueEntry { frame, enqueued_ms }) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            log::trace!("queue full, dropped frame from {} ms", evicted.enqueued_ms);
            let shape = evicted.frame.shape();
            self.pool.release(shape, evicted.frame.into_data());
        }
        self.shared
            .queue_len
            .store(self.queue.len(), Ordering::Relaxed);
        Ok(())
    }

    fn transient(&mut self, err: &anyhow::Error) {
        let count = self.shared.transient_errors.fetch_add(1, Ordering::Relaxed) + 1;
        // First failure and then every hundredth, to keep a flapping source
        // from flooding the log.
        if count == 1 || count % 100 == 0 {
            log::warn!("transient acquisition failure #{}: {:#}", count, err);
        }
        std::thread::sleep(self.backoff);
    }
}

// ----------------------------------------------------------------------------
// Dispatch thread
// ----------------------------------------------------------------------------

struct DispatchLoop {
    queue: FrameQueue,
    recycle: Sender<Vec<u8>>,
    consumers: ConsumerList,
    flags: Arc<RunFlags>,
    shared: Arc<Shared>,
    timeout: Duration,
    meter: FpsMeter,
}

impl DispatchLoop {
    fn run(mut self) {
        loop {
            let stopping = !self.flags.running.load(Ordering::SeqCst)
                && self.flags.capture_done.load(Ordering::SeqCst);
            if stopping && self.queue.is_empty() {
                break;
            }
            let Some(entry) = self.queue.pop_timeout(self.timeout) else {
                continue;
            };
            self.shared
                .queue_len
                .store(self.queue.len(), Ordering::Relaxed);
            self.deliver(entry);
        }
    }

    fn deliver(&mut self, entry: QueueEntry) {
        let fps = self.meter.record(Instant::now());
        self.shared.fps_bits.store(fps.to_bits(), Ordering::Relaxed);

        {
            let mut consumers = lock_consumers(&self.consumers);
            for consumer in consumers.iter_mut() {
                consumer.on_frame(&entry.frame, entry.enqueued_ms);
            }
        }
        self.shared.delivered.fetch_add(1, Ordering::Relaxed);

        // Full means capture already holds enough spares.
        let _ = self.recycle.try_send(entry.frame.into_data());
    }
}
