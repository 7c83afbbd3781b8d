//! Capped exponential backoff for feed reconnection.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Produces the delays between reconnection attempts.
///
/// Each call to [`next_delay`](Self::next_delay) returns the current delay and
/// then grows it by the configured multiplier, never beyond the cap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            jitter: 0.0,
            current: initial,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_ms),
            Duration::from_millis(config.max_ms),
            config.multiplier,
        )
        .with_jitter(config.jitter)
    }

    /// Adds up to `fraction` of the current delay as random extra wait.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// Returns the delay to wait now and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);

        if self.jitter > 0.0 {
            let extra = rand::rng().random_range(0.0..=self.jitter);
            delay + delay.mul_f64(extra)
        } else {
            delay
        }
    }

    /// Returns the schedule to its initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// The delay the next call to `next_delay` will be based on.
    pub fn current(&self) -> Duration {
        self.current
    }
}
