use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{CaptureParams, DispatcherConfig, DEFAULT_FPS_WINDOW};
use crate::error::KernelError;
use crate::speed::{self, SpeedBalancer, SpeedLaw, SpeedLimits};

const DEFAULT_DEVICE: &str = "stub://arena";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: f64 = 30.0;
const DEFAULT_QUEUE_CAPACITY: usize = 5;
const DEFAULT_DISPATCH_TIMEOUT_MS: u64 = 50;
const DEFAULT_OPEN_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 10;
const DEFAULT_SESSION_QUEUE_CAPACITY: usize = 30;
const DEFAULT_METRICS_INTERVAL_MS: u64 = 1_000;
const DEFAULT_SPEED_LAW: &str = "proportional";

#[derive(Debug, Deserialize, Default)]
struct ArenaConfigFile {
    source: Option<SourceConfigFile>,
    dispatcher: Option<DispatcherConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    speed: Option<SpeedConfigFile>,
    session: Option<SessionConfigFile>,
    metrics: Option<MetricsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f64>,
    looping: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DispatcherConfigFile {
    queue_capacity: Option<usize>,
    dispatch_timeout_ms: Option<u64>,
    open_timeout_ms: Option<u64>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct SpeedConfigFile {
    law: Option<String>,
    target: Option<f64>,
    dead_band: Option<f64>,
    gain: Option<f64>,
    factor: Option<f64>,
    low_water: Option<usize>,
    high_water: Option<usize>,
    k: Option<f64>,
    fixed: Option<f64>,
    lower: Option<f64>,
    upper: Option<f64>,
    hysteresis: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct MetricsConfigFile {
    interval_ms: Option<u64>,
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    pub source: SourceSettings,
    pub dispatcher: DispatcherConfig,
    /// Pipeline description; `None` runs the built-in tracking pipeline.
    pub pipeline_path: Option<PathBuf>,
    pub speed: SpeedSettings,
    /// Capacity of the queue in front of the tracking session.
    pub session_queue_capacity: usize,
    pub metrics_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub looping: bool,
}

impl SourceSettings {
    pub fn capture_params(&self) -> CaptureParams {
        CaptureParams::new(self.device.clone(), self.width, self.height)
    }
}

#[derive(Debug, Clone)]
pub struct SpeedSettings {
    pub law: String,
    pub target: f64,
    pub dead_band: f64,
    pub gain: f64,
    pub factor: f64,
    pub low_water: usize,
    pub high_water: usize,
    pub k: f64,
    pub fixed: f64,
    pub lower: f64,
    pub upper: f64,
    pub hysteresis: f64,
}

impl Default for SpeedSettings {
    fn default() -> Self {
        Self {
            law: DEFAULT_SPEED_LAW.to_string(),
            target: speed::DEFAULT_TARGET_OCCUPANCY,
            dead_band: speed::DEFAULT_DEAD_BAND,
            gain: speed::DEFAULT_GAIN,
            factor: speed::DEFAULT_STEP_FACTOR,
            low_water: speed::DEFAULT_LOW_WATER,
            high_water: speed::DEFAULT_HIGH_WATER,
            k: speed::DEFAULT_DECAY,
            fixed: 1.0,
            lower: speed::DEFAULT_LOWER_LIMIT,
            upper: speed::DEFAULT_UPPER_LIMIT,
            hysteresis: speed::DEFAULT_HYSTERESIS,
        }
    }
}

impl SpeedSettings {
    /// Law named by `law`, parameterised from these settings.
    pub fn law(&self) -> Result<SpeedLaw> {
        let law = SpeedLaw::from_name(&self.law).ok_or_else(|| {
            KernelError::configuration(format!("unknown speed law '{}'", self.law))
        })?;
        Ok(match law {
            SpeedLaw::Proportional { .. } => SpeedLaw::Proportional {
                target: self.target,
                dead_band: self.dead_band,
                gain: self.gain,
            },
            SpeedLaw::ThresholdStep { .. } => SpeedLaw::ThresholdStep {
                factor: self.factor,
                low_water: self.low_water,
                high_water: self.high_water,
            },
            SpeedLaw::Exponential { .. } => SpeedLaw::Exponential { k: self.k },
            SpeedLaw::Fixed { .. } => SpeedLaw::Fixed { speed: self.fixed },
        })
    }

    pub fn limits(&self) -> Result<SpeedLimits> {
        SpeedLimits::new(self.lower, self.upper, self.hysteresis)
            .map_err(|e| KernelError::configuration(e.to_string()))
    }

    pub fn balancer(&self) -> Result<SpeedBalancer> {
        Ok(SpeedBalancer::new(self.law()?, self.limits()?))
    }
}

impl ArenaConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ARENA_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ArenaConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let dispatcher = file.dispatcher.unwrap_or_default();
        let speed = file.speed.unwrap_or_default();
        let defaults = SpeedSettings::default();

        Self {
            source: SourceSettings {
                device: source.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
                width: source.width.unwrap_or(DEFAULT_WIDTH),
                height: source.height.unwrap_or(DEFAULT_HEIGHT),
                fps: source.fps.unwrap_or(DEFAULT_FPS),
                looping: source.looping.unwrap_or(false),
            },
            dispatcher: DispatcherConfig {
                queue_capacity: dispatcher.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
                dispatch_timeout: Duration::from_millis(
                    dispatcher
                        .dispatch_timeout_ms
                        .unwrap_or(DEFAULT_DISPATCH_TIMEOUT_MS),
                ),
                fps_window: DEFAULT_FPS_WINDOW,
                open_timeout: Duration::from_millis(
                    dispatcher.open_timeout_ms.unwrap_or(DEFAULT_OPEN_TIMEOUT_MS),
                ),
                retry_backoff: Duration::from_millis(
                    dispatcher
                        .retry_backoff_ms
                        .unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
                ),
            },
            pipeline_path: file.pipeline.and_then(|pipeline| pipeline.path),
            speed: SpeedSettings {
                law: speed.law.unwrap_or(defaults.law),
                target: speed.target.unwrap_or(defaults.target),
                dead_band: speed.dead_band.unwrap_or(defaults.dead_band),
                gain: speed.gain.unwrap_or(defaults.gain),
                factor: speed.factor.unwrap_or(defaults.factor),
                low_water: speed.low_water.unwrap_or(defaults.low_water),
                high_water: speed.high_water.unwrap_or(defaults.high_water),
                k: speed.k.unwrap_or(defaults.k),
                fixed: speed.fixed.unwrap_or(defaults.fixed),
                lower: speed.lower.unwrap_or(defaults.lower),
                upper: speed.upper.unwrap_or(defaults.upper),
                hysteresis: speed.hysteresis.unwrap_or(defaults.hysteresis),
            },
            session_queue_capacity: file
                .session
                .and_then(|session| session.queue_capacity)
                .unwrap_or(DEFAULT_SESSION_QUEUE_CAPACITY),
            metrics_interval: Duration::from_millis(
                file.metrics
                    .and_then(|metrics| metrics.interval_ms)
                    .unwrap_or(DEFAULT_METRICS_INTERVAL_MS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("ARENA_DEVICE") {
            if !device.trim().is_empty() {
                self.source.device = device;
            }
        }
        if let Some(width) = env_parse::<u32>("ARENA_WIDTH")? {
            self.source.width = width;
        }
        if let Some(height) = env_parse::<u32>("ARENA_HEIGHT")? {
            self.source.height = height;
        }
        if let Some(fps) = env_parse::<f64>("ARENA_FPS")? {
            self.source.fps = fps;
        }
        if let Ok(path) = std::env::var("ARENA_PIPELINE") {
            if !path.trim().is_empty() {
                self.pipeline_path = Some(PathBuf::from(path));
            }
        }
        if let Some(capacity) = env_parse::<usize>("ARENA_QUEUE_CAPACITY")? {
            self.dispatcher.queue_capacity = capacity;
        }
        if let Ok(law) = std::env::var("ARENA_SPEED_LAW") {
            if !law.trim().is_empty() {
                self.speed.law = law;
            }
        }
        if let Some(interval) = env_parse::<u64>("ARENA_METRICS_INTERVAL_MS")? {
            self.metrics_interval = Duration::from_millis(interval);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.source.capture_params().validate()?;
        if !(self.source.fps.is_finite() && self.source.fps >= 0.0) {
            return Err(KernelError::configuration(format!(
                "source fps must be >= 0, got {}",
                self.source.fps
            )));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(KernelError::configuration("queue capacity must be >= 1"));
        }
        if self.session_queue_capacity == 0 {
            return Err(KernelError::configuration(
                "session queue capacity must be >= 1",
            ));
        }
        if self.metrics_interval.is_zero() {
            return Err(KernelError::configuration(
                "metrics interval must be greater than zero",
            ));
        }
        self.speed.balancer()?;
        self.speed.law = self.speed.law.trim().to_ascii_lowercase();
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ArenaConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a number, got '{}'", key, value)),
        _ => Ok(None),
    }
}
