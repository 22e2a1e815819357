//! Closed-loop playback speed control.
//!
//! A `SpeedBalancer` is fed the occupancy of a downstream queue once per tick
//! and proposes a playback speed for a file-based source. The proposal is
//! applied through a `PlaybackSpeed`, a lock-free scalar shared with the
//! source that paces its frame pulls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};

pub const DEFAULT_LOWER_LIMIT: f64 = 0.1;
pub const DEFAULT_UPPER_LIMIT: f64 = 10.0;
pub const DEFAULT_HYSTERESIS: f64 = 0.2;

pub const DEFAULT_TARGET_OCCUPANCY: f64 = 10.0;
pub const DEFAULT_DEAD_BAND: f64 = 3.0;
pub const DEFAULT_GAIN: f64 = 0.01;
pub const DEFAULT_STEP_FACTOR: f64 = 1.1;
pub const DEFAULT_LOW_WATER: usize = 5;
pub const DEFAULT_HIGH_WATER: usize = 15;
pub const DEFAULT_DECAY: f64 = 0.1;

/// Clamp range and change threshold shared by every law.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpeedLimits {
    pub lower: f64,
    pub upper: f64,
    /// Relative change, against the last published speed, that raises the
    /// changed flag.
    pub hysteresis: f64,
}

impl SpeedLimits {
    pub fn new(lower: f64, upper: f64, hysteresis: f64) -> Result<Self> {
        if !(lower > 0.0 && lower <= upper && upper.is_finite()) {
            return Err(anyhow!(
                "speed limits must satisfy 0 < lower <= upper, got [{}, {}]",
                lower,
                upper
            ));
        }
        if !(hysteresis >= 0.0 && hysteresis.is_finite()) {
            return Err(anyhow!("hysteresis must be >= 0, got {}", hysteresis));
        }
        Ok(Self {
            lower,
            upper,
            hysteresis,
        })
    }

    pub fn clamp(&self, speed: f64) -> f64 {
        if speed.is_nan() {
            return self.lower;
        }
        speed.clamp(self.lower, self.upper)
    }
}

impl Default for SpeedLimits {
    fn default() -> Self {
        Self {
            lower: DEFAULT_LOWER_LIMIT,
            upper: DEFAULT_UPPER_LIMIT,
            hysteresis: DEFAULT_HYSTERESIS,
        }
    }
}

/// Control law mapping (current speed, occupancy) to a candidate speed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SpeedLaw {
    /// Nudge speed toward a target occupancy; no correction inside the band.
    Proportional {
        target: f64,
        dead_band: f64,
        gain: f64,
    },
    /// Speed up by `factor` at or below `low_water`, slow down at or above
    /// `high_water`, hold in between.
    ThresholdStep {
        factor: f64,
        low_water: usize,
        high_water: usize,
    },
    /// `upper * exp(-k * occupancy)`.
    Exponential { k: f64 },
    Fixed { speed: f64 },
}

impl SpeedLaw {
    pub fn proportional() -> Self {
        SpeedLaw::Proportional {
            target: DEFAULT_TARGET_OCCUPANCY,
            dead_band: DEFAULT_DEAD_BAND,
            gain: DEFAULT_GAIN,
        }
    }

    pub fn threshold_step() -> Self {
        SpeedLaw::ThresholdStep {
            factor: DEFAULT_STEP_FACTOR,
            low_water: DEFAULT_LOW_WATER,
            high_water: DEFAULT_HIGH_WATER,
        }
    }

    pub fn exponential() -> Self {
        SpeedLaw::Exponential { k: DEFAULT_DECAY }
    }

    pub fn fixed(speed: f64) -> Self {
        SpeedLaw::Fixed { speed }
    }

    /// Law with default parameters for a configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "proportional" => Some(Self::proportional()),
            "thresholdstep" | "threshold" | "step" => Some(Self::threshold_step()),
            "exponential" | "exp" => Some(Self::exponential()),
            "fixed" => Some(Self::fixed(1.0)),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SpeedLaw::Proportional { .. } => "proportional",
            SpeedLaw::ThresholdStep { .. } => "threshold-step",
            SpeedLaw::Exponential { .. } => "exponential",
            SpeedLaw::Fixed { .. } => "fixed",
        }
    }

    /// Unclamped candidate speed.
    pub fn candidate(&self, current: f64, occupancy: usize, limits: &SpeedLimits) -> f64 {
        let occupancy_f = occupancy as f64;
        match *self {
            SpeedLaw::Proportional {
                target,
                dead_band,
                gain,
            } => {
                let error = occupancy_f - target;
                if error.abs() <= dead_band {
                    current
                } else {
                    current - gain * error
                }
            }
            SpeedLaw::ThresholdStep {
                factor,
                low_water,
                high_water,
            } => {
                if occupancy <= low_water {
                    current * factor
                } else if occupancy >= high_water {
                    current / factor
                } else {
                    current
                }
            }
            SpeedLaw::Exponential { k } => limits.upper * (-k * occupancy_f).exp(),
            SpeedLaw::Fixed { speed } => speed,
        }
    }
}

/// Edge-triggered speed controller.
#[derive(Clone, Debug)]
pub struct SpeedBalancer {
    law: SpeedLaw,
    limits: SpeedLimits,
    speed: f64,
    published: f64,
    changed: bool,
}

impl SpeedBalancer {
    pub fn new(law: SpeedLaw, limits: SpeedLimits) -> Self {
        let speed = limits.clamp(1.0);
        Self {
            law,
            limits,
            speed,
            published: speed,
            changed: false,
        }
    }

    pub fn law(&self) -> &SpeedLaw {
        &self.law
    }

    pub fn limits(&self) -> &SpeedLimits {
        &self.limits
    }

    /// Evaluate the law once. Returns the new (clamped) speed.
    ///
    /// `current_speed` only feeds the law. The changed flag is raised when
    /// the candidate moves more than the hysteresis fraction away from the
    /// speed last returned by `get_speed`, not away from `current_speed`.
    pub fn update(&mut self, current_speed: f64, occupancy: usize) -> f64 {
        let candidate = self
            .limits
            .clamp(self.law.candidate(current_speed, occupancy, &self.limits));
        self.speed = candidate;
        let delta = (candidate - self.published).abs() / self.published;
        if delta > self.limits.hysteresis {
            self.changed = true;
        }
        candidate
    }

    /// Current speed without clearing the changed flag.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Current speed; clears the changed flag and marks it published.
    pub fn get_speed(&mut self) -> f64 {
        self.changed = false;
        self.published = self.speed;
        self.speed
    }
}

/// Shared playback speed scalar.
///
/// Clones observe the same value. Writes of non-finite or non-positive
/// values are ignored.
#[derive(Clone, Debug)]
pub struct PlaybackSpeed {
    bits: Arc<AtomicU64>,
}

impl PlaybackSpeed {
    pub fn new(speed: f64) -> Self {
        let speed = if speed.is_finite() && speed > 0.0 {
            speed
        } else {
            1.0
        };
        Self {
            bits: Arc::new(AtomicU64::new(speed.to_bits())),
        }
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, speed: f64) {
        if speed.is_finite() && speed > 0.0 {
            self.bits.store(speed.to_bits(), Ordering::Relaxed);
        } else {
            log::warn!("ignoring invalid playback speed {}", speed);
        }
    }
}

impl Default for PlaybackSpeed {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_step_holds_between_marks() {
        let mut balancer = SpeedBalancer::new(SpeedLaw::threshold_step(), SpeedLimits::default());
        for occupancy in 6..15 {
            for _ in 0..10 {
                let current = balancer.speed();
                assert_eq!(balancer.update(current, occupancy), 1.0);
            }
        }
        assert!(!balancer.changed());
    }

    #[test]
    fn threshold_step_moves_at_the_marks() {
        let mut balancer = SpeedBalancer::new(SpeedLaw::threshold_step(), SpeedLimits::default());
        let up = balancer.update(1.0, 5);
        assert!((up - 1.1).abs() < 1e-12);
        let down = balancer.update(1.0, 15);
        assert!((down - 1.0 / 1.1).abs() < 1e-12);
    }

    #[test]
    fn hysteresis_accumulates_small_steps_then_fires_once() {
        let mut balancer = SpeedBalancer::new(SpeedLaw::threshold_step(), SpeedLimits::default());
        // 1.1 alone is within 20%, 1.21 is not.
        let speed = balancer.update(balancer.speed(), 0);
        assert!(!balancer.changed(), "speed {}", speed);
        balancer.update(balancer.speed(), 0);
        assert!(balancer.changed());

        let published = balancer.get_speed();
        assert!((published - 1.21).abs() < 1e-9);
        assert!(!balancer.changed());
    }

    #[test]
    fn changed_flag_tracks_published_speed_not_argument() {
        let mut balancer = SpeedBalancer::new(SpeedLaw::threshold_step(), SpeedLimits::default());
        // Held at 1.15: equal to the argument, within 20% of the published 1.0.
        assert_eq!(balancer.update(1.15, 10), 1.15);
        assert!(!balancer.changed());

        // Held at 5.0: equal to the argument, far from the published 1.0.
        assert_eq!(balancer.update(5.0, 10), 5.0);
        assert!(balancer.changed());
        assert_eq!(balancer.get_speed(), 5.0);

        assert_eq!(balancer.update(5.5, 10), 5.5);
        assert!(!balancer.changed());
    }

    #[test]
    fn proportional_ignores_dead_band_and_corrects_outside() {
        let mut balancer = SpeedBalancer::new(SpeedLaw::proportional(), SpeedLimits::default());
        for occupancy in 7..=13 {
            assert_eq!(balancer.update(2.0, occupancy), 2.0);
        }
        assert!((balancer.update(2.0, 20) - 1.9).abs() < 1e-12);
        assert!((balancer.update(2.0, 0) - 2.1).abs() < 1e-12);
    }

    #[test]
    fn exponential_is_monotonically_decreasing() {
        let mut balancer = SpeedBalancer::new(SpeedLaw::exponential(), SpeedLimits::default());
        let mut previous = f64::INFINITY;
        for occupancy in 0..40 {
            let speed = balancer.update(1.0, occupancy);
            assert!(speed <= previous);
            assert!((DEFAULT_LOWER_LIMIT..=DEFAULT_UPPER_LIMIT).contains(&speed));
            previous = speed;
        }
        assert_eq!(balancer.update(1.0, 0), DEFAULT_UPPER_LIMIT);
    }

    #[test]
    fn fixed_ignores_occupancy_and_output_is_clamped() {
        let mut balancer = SpeedBalancer::new(SpeedLaw::fixed(3.0), SpeedLimits::default());
        assert_eq!(balancer.update(1.0, 0), 3.0);
        assert_eq!(balancer.update(1.0, 1000), 3.0);

        let mut wild = SpeedBalancer::new(SpeedLaw::fixed(50.0), SpeedLimits::default());
        assert_eq!(wild.update(1.0, 0), DEFAULT_UPPER_LIMIT);
    }

    #[test]
    fn limits_validation() {
        assert!(SpeedLimits::new(0.5, 2.0, 0.1).is_ok());
        assert!(SpeedLimits::new(0.0, 2.0, 0.1).is_err());
        assert!(SpeedLimits::new(3.0, 2.0, 0.1).is_err());
        assert!(SpeedLimits::new(0.5, 2.0, -0.1).is_err());
    }

    #[test]
    fn law_names_round_trip() {
        for law in [
            SpeedLaw::proportional(),
            SpeedLaw::threshold_step(),
            SpeedLaw::exponential(),
            SpeedLaw::fixed(1.0),
        ] {
            assert_eq!(SpeedLaw::from_name(law.name()), Some(law));
        }
        assert!(SpeedLaw::from_name("bang-bang").is_none());
    }

    #[test]
    fn playback_speed_is_shared_and_guarded() {
        let speed = PlaybackSpeed::new(1.0);
        let reader = speed.clone();
        speed.set(2.5);
        assert_eq!(reader.get(), 2.5);
        speed.set(f64::NAN);
        speed.set(-1.0);
        assert_eq!(reader.get(), 2.5);
    }
}
