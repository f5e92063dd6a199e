//! Capped exponential backoff for reconnects

use crate::config::SyncConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self { initial, max, multiplier: multiplier.max(1.0), attempt: 0 }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.backoff_initial, config.backoff_max, config.backoff_multiplier)
    }

    /// Delay before the next attempt; `initial * multiplier^n`, capped at `max`
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.multiplier.powi(self.attempt as i32);
        self.attempt = self.attempt.saturating_add(1);
        let secs = self.initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
