//! Time-decayed smoothing of a step signal
//!
//! A `SteadyHeuristic` follows a piecewise-constant input (for example "busy" = 1.0,
//! "idle" = 0.0) and reports an exponential moving average weighted by wall-clock
//! time rather than by the number of samples. Short spikes barely move the value;
//! a sustained level pulls it all the way over after a few time constants.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct SteadyHeuristic {
    /// Smoothed value as of `last_update`
    value: f64,
    /// Level the input has held since `last_update`
    level: f64,
    last_update: Instant,
    time_constant: Duration,
}

impl SteadyHeuristic {
    pub fn new(initial: f64, time_constant: Duration) -> Self {
        Self::new_at(initial, time_constant, Instant::now())
    }

    pub fn new_at(initial: f64, time_constant: Duration, now: Instant) -> Self {
        Self {
            value: initial,
            level: initial,
            last_update: now,
            time_constant,
        }
    }

    /// Smoothed value at `now`, accounting for the time the current level has been held
    pub fn value_at(&self, now: Instant) -> f64 {
        let tau = self.time_constant.as_secs_f64();
        if tau <= 0.0 {
            return self.level;
        }
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        let weight = 1.0 - (-elapsed / tau).exp();
        self.value + (self.level - self.value) * weight
    }

    pub fn value(&self) -> f64 {
        self.value_at(Instant::now())
    }

    /// Commits the blend up to `now` and switches the input to `level`
    pub fn set_level_at(&mut self, level: f64, now: Instant) {
        self.value = self.value_at(now);
        self.level = level;
        if now > self.last_update {
            self.last_update = now;
        }
    }

    pub fn set_level(&mut self, level: f64) {
        self.set_level_at(level, Instant::now());
    }

    pub fn level(&self) -> f64 {
        self.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_holds_initial_value() {
        let start = Instant::now();
        let h = SteadyHeuristic::new_at(0.0, Duration::from_secs(1), start);
        assert_approx_eq!(h.value_at(start + Duration::from_secs(10)), 0.0, 1e-9);
    }

    #[test]
    fn test_one_time_constant_reaches_63_percent() {
        let start = Instant::now();
        let mut h = SteadyHeuristic::new_at(0.0, Duration::from_secs(1), start);
        h.set_level_at(1.0, start);
        assert_approx_eq!(
            h.value_at(start + Duration::from_secs(1)),
            1.0 - (-1.0f64).exp(),
            1e-9
        );
    }

    #[test]
    fn test_short_spike_is_damped() {
        let start = Instant::now();
        let mut h = SteadyHeuristic::new_at(0.0, Duration::from_secs(1), start);
        h.set_level_at(1.0, start);
        h.set_level_at(0.0, start + Duration::from_millis(10));
        let value = h.value_at(start + Duration::from_millis(10));
        assert!(value < 0.02, "spike moved value to {}", value);
        assert!(h.value_at(start + Duration::from_secs(5)) < value);
    }

    #[test]
    fn test_sustained_level_converges() {
        let start = Instant::now();
        let mut h = SteadyHeuristic::new_at(0.0, Duration::from_millis(100), start);
        h.set_level_at(1.0, start);
        assert_approx_eq!(h.value_at(start + Duration::from_secs(5)), 1.0, 1e-6);
    }

    #[test]
    fn test_blend_is_piecewise() {
        let start = Instant::now();
        let tau = Duration::from_secs(1);
        let mut h = SteadyHeuristic::new_at(0.0, tau, start);
        h.set_level_at(1.0, start);
        h.set_level_at(0.0, start + tau);
        let peak = 1.0 - (-1.0f64).exp();
        assert_approx_eq!(
            h.value_at(start + tau * 2),
            peak * (-1.0f64).exp(),
            1e-9
        );
    }

    #[test]
    fn test_zero_time_constant_tracks_level() {
        let mut h = SteadyHeuristic::new(0.0, Duration::ZERO);
        h.set_level(0.5);
        assert_approx_eq!(h.value(), 0.5, 1e-12);
        assert_approx_eq!(h.level(), 0.5, 1e-12);
    }
}
