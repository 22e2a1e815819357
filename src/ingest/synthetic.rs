//! Synthetic scene source (`stub://` devices).
//!
//! Renders a bright disk moving across a uniform background with additive
//! Gaussian noise and a slow global illumination drift. Rendering is fully
//! determined by the seed, so tests can assert on detection results.
//!
//! Device strings take optional query parameters:
//! `stub://disk?seed=7&occlude=true&fps=30&noise=10&radius=10&fail_every=0`.

use std::f64::consts::TAU;
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{normalize_into, FrameSource, PixelFormat, RawFrame, SourceStats};
use crate::error::KernelError;
use crate::frame::Frame;

pub const STUB_SCHEME: &str = "stub://";

#[derive(Clone, Debug)]
pub struct SceneConfig {
    pub width: u32,
    pub height: u32,
    pub radius: f64,
    pub foreground: u8,
    pub background: u8,
    /// Standard deviation of the per-pixel additive noise.
    pub noise_sigma: f64,
    /// Peak offset of the global illumination drift, in intensity levels.
    pub drift_amplitude: f64,
    /// Drift period in frames.
    pub drift_period: u32,
    /// Horizontal disk speed in pixels per frame.
    pub speed: f64,
    /// Repaint the right half of the disk with the background intensity.
    pub occlude: bool,
    pub seed: u64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            width: 160,
            height: 120,
            radius: 10.0,
            foreground: 220,
            background: 120,
            noise_sigma: 10.0,
            drift_amplitude: 3.0,
            drift_period: 200,
            speed: 4.0,
            occlude: false,
            seed: 0,
        }
    }
}

/// Deterministic moving-disk generator.
pub struct SyntheticScene {
    config: SceneConfig,
    rng: StdRng,
    spare_normal: Option<f64>,
    index: u64,
}

impl SyntheticScene {
    pub fn new(config: SceneConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            spare_normal: None,
            index: 0,
        }
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    /// Number of frames rendered so far.
    pub fn frame_index(&self) -> u64 {
        self.index
    }

    /// Disk center for frame `index`.
    ///
    /// The disk sweeps left to right, wrapping inside a margin that keeps it
    /// fully visible, while bobbing gently up and down.
    pub fn disk_center(&self, index: u64) -> (f64, f64) {
        let c = &self.config;
        let margin = c.radius + 2.0;
        let span = (c.width as f64 - 2.0 * margin).max(1.0);
        let cx = margin + (c.speed * index as f64).rem_euclid(span);
        let amplitude = (c.height as f64 / 2.0 - margin).max(0.0) * 0.5;
        let cy = c.height as f64 / 2.0 + amplitude * (TAU * index as f64 / 80.0).sin();
        (cx, cy)
    }

    /// Illumination offset for frame `index`.
    pub fn drift(&self, index: u64) -> f64 {
        let period = self.config.drift_period.max(1) as f64;
        self.config.drift_amplitude * (TAU * index as f64 / period).sin()
    }

    /// Render the next frame as a single-channel raw frame.
    pub fn next_raw(&mut self) -> RawFrame {
        let (width, height) = (self.config.width, self.config.height);
        let (cx, cy) = self.disk_center(self.index);
        let drift = self.drift(self.index);
        let r2 = self.config.radius * self.config.radius;
        let fg = self.config.foreground as f64;
        let bg = self.config.background as f64;
        let sigma = self.config.noise_sigma;
        let occlude = self.config.occlude;

        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                let inside = dx * dx + dy * dy <= r2;
                let occluded = occlude && dx > 0.0;
                let base = if inside && !occluded { fg } else { bg };
                let value = base + drift + sigma * self.normal();
                data.push(value.round().clamp(0.0, 255.0) as u8);
            }
        }
        self.index += 1;
        RawFrame::new(width, height, PixelFormat::Gray8, data)
    }

    /// Render the next frame as a packed RGB `Frame`.
    pub fn next_frame(&mut self, timestamp_ms: u64) -> Result<Frame> {
        let raw = self.next_raw();
        let mut rgb = vec![0u8; raw.width as usize * raw.height as usize * 3];
        normalize_into(&raw, &mut rgb)?;
        Frame::new(raw.width, raw.height, rgb, timestamp_ms)
    }

    /// Standard normal sample (Box-Muller, pairs cached).
    fn normal(&mut self) -> f64 {
        if let Some(z) = self.spare_normal.take() {
            return z;
        }
        let u1: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        let u2: f64 = self.rng.gen();
        let mag = (-2.0 * u1.ln()).sqrt();
        self.spare_normal = Some(mag * (TAU * u2).sin());
        mag * (TAU * u2).cos()
    }
}

// ----------------------------------------------------------------------------
// FrameSource adapter
// ----------------------------------------------------------------------------

/// `FrameSource` over a `SyntheticScene`.
///
/// With `fps` set, frames are only produced once per frame interval and
/// `grab_frame` reports "not yet" in between. `fail_every = n` makes every
/// n-th grab fail with a transient error.
#[derive(Default)]
pub struct SyntheticSource {
    scene: Option<SyntheticScene>,
    device: String,
    interval: Option<Duration>,
    next_due: Option<Instant>,
    fail_every: u64,
    grabs: u64,
    frames_captured: u64,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.scene.is_some()
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self, device: &str, width: u32, height: u32) -> Result<()> {
        let Some(rest) = device.strip_prefix(STUB_SCHEME) else {
            return Err(KernelError::configuration(format!(
                "synthetic source needs a {} device, got '{}'",
                STUB_SCHEME, device
            )));
        };
        if width == 0 || height == 0 {
            return Err(KernelError::configuration(format!(
                "frame dimensions must be non-zero, got {}x{}",
                width, height
            )));
        }
        let options = StubOptions::parse(rest)?;
        let scene = SceneConfig {
            width,
            height,
            seed: options.seed,
            occlude: options.occlude,
            noise_sigma: options.noise.unwrap_or(SceneConfig::default().noise_sigma),
            radius: options.radius.unwrap_or(SceneConfig::default().radius),
            ..SceneConfig::default()
        };

        self.scene = Some(SyntheticScene::new(scene));
        self.device = device.to_string();
        self.interval = options
            .fps
            .filter(|fps| *fps > 0.0)
            .map(|fps| Duration::from_secs_f64(1.0 / fps));
        self.next_due = None;
        self.fail_every = options.fail_every;
        self.grabs = 0;
        log::info!(
            "SyntheticSource: opened {} ({}x{}, synthetic)",
            device,
            width,
            height
        );
        Ok(())
    }

    fn grab_frame(&mut self) -> Result<Option<RawFrame>> {
        let Some(scene) = self.scene.as_mut() else {
            return Err(KernelError::transient("synthetic source is not open"));
        };
        if let (Some(interval), Some(due)) = (self.interval, self.next_due) {
            if Instant::now() < due {
                return Ok(None);
            }
            self.next_due = Some(due + interval);
        } else if let Some(interval) = self.interval {
            self.next_due = Some(Instant::now() + interval);
        }

        self.grabs += 1;
        if self.fail_every > 0 && self.grabs % self.fail_every == 0 {
            return Err(KernelError::transient(format!(
                "simulated dropout on grab {}",
                self.grabs
            )));
        }
        self.frames_captured += 1;
        Ok(Some(scene.next_raw()))
    }

    fn close(&mut self) {
        if self.scene.take().is_some() {
            log::info!("SyntheticSource: closed {}", self.device);
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            device: self.device.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct StubOptions {
    seed: u64,
    occlude: bool,
    fps: Option<f64>,
    noise: Option<f64>,
    radius: Option<f64>,
    fail_every: u64,
}

impl StubOptions {
    fn parse(rest: &str) -> Result<Self> {
        let mut options = Self::default();
        let Some((_, query)) = rest.split_once('?') else {
            return Ok(options);
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, "true"));
            let bad = || KernelError::configuration(format!("invalid stub option '{}'", pair));
            match key {
                "seed" => options.seed = value.parse().map_err(|_| bad())?,
                "occlude" => options.occlude = value.parse().map_err(|_| bad())?,
                "fps" => options.fps = Some(value.parse().map_err(|_| bad())?),
                "noise" => options.noise = Some(value.parse().map_err(|_| bad())?),
                "radius" => options.radius = Some(value.parse().map_err(|_| bad())?),
                "fail_every" => options.fail_every = value.parse().map_err(|_| bad())?,
                other => log::warn!("SyntheticSource: ignoring unknown option '{}'", other),
            }
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_renders_same_frames() {
        let config = SceneConfig {
            seed: 42,
            ..SceneConfig::default()
        };
        let mut a = SyntheticScene::new(config.clone());
        let mut b = SyntheticScene::new(config);
        for _ in 0..3 {
            assert_eq!(a.next_raw().data, b.next_raw().data);
        }
    }

    #[test]
    fn disk_is_brighter_than_background() {
        let mut scene = SyntheticScene::new(SceneConfig {
            noise_sigma: 0.0,
            drift_amplitude: 0.0,
            ..SceneConfig::default()
        });
        let (cx, cy) = scene.disk_center(0);
        let raw = scene.next_raw();
        let at = |x: f64, y: f64| raw.data[y.round() as usize * 160 + x.round() as usize];
        assert_eq!(at(cx, cy), 220);
        assert_eq!(at(1.0, 1.0), 120);
    }

    #[test]
    fn occlusion_paints_right_half_background() {
        let mut scene = SyntheticScene::new(SceneConfig {
            noise_sigma: 0.0,
            drift_amplitude: 0.0,
            occlude: true,
            ..SceneConfig::default()
        });
        let (cx, cy) = scene.disk_center(0);
        let raw = scene.next_raw();
        let at = |x: f64, y: f64| raw.data[y.round() as usize * 160 + x.round() as usize];
        assert_eq!(at(cx - 5.0, cy), 220);
        assert_eq!(at(cx + 5.0, cy), 120);
    }

    #[test]
    fn disk_stays_inside_frame() {
        let scene = SyntheticScene::new(SceneConfig::default());
        for index in 0..500 {
            let (cx, cy) = scene.disk_center(index);
            assert!(cx - 10.0 >= 0.0 && cx + 10.0 < 160.0, "cx {}", cx);
            assert!(cy - 10.0 >= 0.0 && cy + 10.0 < 120.0, "cy {}", cy);
        }
    }

    #[test]
    fn source_parses_options_and_injects_failures() -> Result<()> {
        let mut source = SyntheticSource::new();
        source.open("stub://disk?seed=3&fail_every=2", 32, 24)?;
        assert!(source.grab_frame()?.is_some());
        assert!(source.grab_frame().is_err());
        let raw = source.grab_frame()?.expect("third grab succeeds");
        assert_eq!((raw.width, raw.height), (32, 24));
        assert_eq!(source.stats().frames_captured, 2);
        source.close();
        assert!(!source.is_open());
        Ok(())
    }

    #[test]
    fn open_rejects_bad_device_and_dimensions() {
        let mut source = SyntheticSource::new();
        assert!(source.open("/dev/video0", 32, 24).is_err());
        assert!(source.open("stub://disk", 0, 24).is_err());
        assert!(source.open("stub://disk?seed=abc", 32, 24).is_err());
        assert!(!source.is_open());
    }

    #[test]
    fn paced_source_reports_not_ready_between_frames() -> Result<()> {
        let mut source = SyntheticSource::new();
        source.open("stub://disk?fps=1", 8, 8)?;
        assert!(source.grab_frame()?.is_some());
        assert!(source.grab_frame()?.is_none());
        Ok(())
    }
}
