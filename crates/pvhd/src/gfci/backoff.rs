//! Bounded exponential backoff for bridge reconnection.

use std::time::Duration;

use crate::config::BridgeConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            current: initial,
        }
    }

    pub fn from_config(bridge: &BridgeConfig) -> Self {
        Self::new(
            Duration::from_millis(bridge.backoff_initial_ms),
            Duration::from_millis(bridge.backoff_max_ms),
            bridge.backoff_multiplier,
        )
    }

    /// Returns the delay to wait now and grows the next one, capped at max.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        let next_ms = (delay.as_millis() as f64 * self.multiplier) as u64;
        self.current = Duration::from_millis(next_ms).min(self.max);
        delay
    }

    /// Back to the initial delay after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
