//! Status reporting and the periodic metrics/speed tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::capture::{MetricsHandle, OccupancyProbe};
use crate::speed::{PlaybackSpeed, SpeedBalancer};

/// Accepts human-readable status, error and metrics lines.
pub trait StatusSink: Send + Sync {
    fn status(&self, message: &str);
    fn error(&self, message: &str);
    fn metrics(&self, message: &str);
}

/// Forwards everything to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn status(&self, message: &str) {
        log::info!(target: "arena::status", "{}", message);
    }

    fn error(&self, message: &str) {
        log::error!(target: "arena::status", "{}", message);
    }

    fn metrics(&self, message: &str) {
        log::info!(target: "arena::metrics", "{}", message);
    }
}

// ----------------------------------------------------------------------------
// Speed governor
// ----------------------------------------------------------------------------

/// Closes the loop between a downstream queue and a playback speed.
pub struct SpeedGovernor {
    balancer: SpeedBalancer,
    speed: PlaybackSpeed,
    probe: OccupancyProbe,
}

impl SpeedGovernor {
    pub fn new(balancer: SpeedBalancer, speed: PlaybackSpeed, probe: OccupancyProbe) -> Self {
        Self {
            balancer,
            speed,
            probe,
        }
    }

    /// Sample occupancy once; returns the new speed when it was published.
    pub fn tick(&mut self) -> Option<f64> {
        let occupancy = (self.probe)();
        let current = self.balancer.speed();
        self.balancer.update(current, occupancy);
        if !self.balancer.changed() {
            return None;
        }
        let speed = self.balancer.get_speed();
        self.speed.set(speed);
        Some(speed)
    }

    pub fn balancer(&self) -> &SpeedBalancer {
        &self.balancer
    }
}

// ----------------------------------------------------------------------------
// Metrics reporter
// ----------------------------------------------------------------------------

/// Background thread that periodically reports dispatcher metrics and, when
/// given a governor, adjusts playback speed.
pub struct MetricsReporter {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

/// Upper bound on how long the reporter takes to notice `stop`.
const SHUTDOWN_POLL: Duration = Duration::from_millis(25);

impl MetricsReporter {
    pub fn spawn(
        interval: Duration,
        metrics: MetricsHandle,
        sink: Arc<dyn StatusSink>,
        governor: Option<SpeedGovernor>,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let interval = interval.max(Duration::from_millis(1));
        let join = std::thread::Builder::new()
            .name("arena-metrics".to_string())
            .spawn(move || run_reporter(interval, metrics, sink, governor, shutdown_thread))
            .context("failed to spawn metrics reporter")?;
        Ok(Self {
            shutdown,
            join: Some(join),
        })
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("metrics reporter panicked");
            }
        }
    }
}

impl Drop for MetricsReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_reporter(
    interval: Duration,
    metrics: MetricsHandle,
    sink: Arc<dyn StatusSink>,
    mut governor: Option<SpeedGovernor>,
    shutdown: Arc<AtomicBool>,
) {
    let mut next_tick = Instant::now() + interval;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now < next_tick {
            std::thread::sleep((next_tick - now).min(SHUTDOWN_POLL));
            continue;
        }
        next_tick += interval;

        sink.metrics(&metrics.snapshot().to_string());
        if let Some(governor) = governor.as_mut() {
            if let Some(speed) = governor.tick() {
                sink.status(&format!("playback speed set to {:.2}", speed));
            }
        }
    }
}
