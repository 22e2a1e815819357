use std::collections::VecDeque;
use std::time::Instant;

pub const DEFAULT_FPS_WINDOW: usize = 60;

/// Delivery-rate estimate over a sliding window of inter-delivery intervals.
#[derive(Debug)]
pub struct FpsMeter {
    window: usize,
    intervals_ms: VecDeque<f64>,
    sum_ms: f64,
    last: Option<Instant>,
}

impl FpsMeter {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            intervals_ms: VecDeque::with_capacity(window),
            sum_ms: 0.0,
            last: None,
        }
    }

    /// Record a delivery at `now` and return the updated estimate.
    pub fn record(&mut self, now: Instant) -> f64 {
        if let Some(last) = self.last {
            let interval = now.saturating_duration_since(last).as_secs_f64() * 1000.0;
            if self.intervals_ms.len() == self.window {
                if let Some(old) = self.intervals_ms.pop_front() {
                    self.sum_ms -= old;
                }
            }
            self.intervals_ms.push_back(interval);
            self.sum_ms += interval;
        }
        self.last = Some(now);
        self.fps()
    }

    /// Frames per second; 0.0 until two deliveries have been seen.
    pub fn fps(&self) -> f64 {
        if self.intervals_ms.is_empty() {
            return 0.0;
        }
        // Floor the mean at 1 µs so back-to-back deliveries stay finite.
        let mean = (self.sum_ms / self.intervals_ms.len() as f64).max(0.001);
        1000.0 / mean
    }

    pub fn samples(&self) -> usize {
        self.intervals_ms.len()
    }

    pub fn reset(&mut self) {
        self.intervals_ms.clear();
        self.sum_ms = 0.0;
        self.last = None;
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new(DEFAULT_FPS_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn steady_interval_gives_expected_rate() {
        let mut meter = FpsMeter::default();
        let start = Instant::now();
        assert_eq!(meter.record(start), 0.0);
        for i in 1..=10 {
            meter.record(start + Duration::from_millis(40 * i));
        }
        assert!((meter.fps() - 25.0).abs() < 1e-6);
    }

    #[test]
    fn window_forgets_old_intervals() {
        let mut meter = FpsMeter::new(4);
        let mut t = Instant::now();
        meter.record(t);
        for _ in 0..4 {
            t += Duration::from_millis(1000);
            meter.record(t);
        }
        for _ in 0..4 {
            t += Duration::from_millis(10);
            meter.record(t);
        }
        assert_eq!(meter.samples(), 4);
        assert!((meter.fps() - 100.0).abs() < 1e-3);
    }

    #[test]
    fn simultaneous_deliveries_stay_finite() {
        let mut meter = FpsMeter::default();
        let now = Instant::now();
        meter.record(now);
        let fps = meter.record(now);
        assert!(fps.is_finite() && fps >= 0.0);
    }
}
