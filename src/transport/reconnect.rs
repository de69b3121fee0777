//! Reconnection backoff for the relay client
//!
//! Delays grow exponentially from `initial_delay` up to `max_delay`, with a
//! little jitter so both endpoints do not hammer a restarted relay in step.

use rand::Rng;
use std::time::Duration;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    /// Maximum number of consecutive failed attempts (0 = infinite)
    pub max_attempts: u32,

    /// Initial delay between reconnection attempts
    pub initial_delay: Duration,

    /// Maximum delay between attempts
    pub max_delay: Duration,

    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Jitter factor to randomize delays (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Backoff state across consecutive failures
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectionConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: ReconnectionConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Failed attempts since the last success
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forget past failures after a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Record a failure and return how long to wait, or `None` to give up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempts >= self.config.max_attempts {
            return None;
        }

        let base = self.base_delay(self.attempts);
        self.attempts += 1;

        let jitter = self.config.jitter_factor.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Some(base);
        }
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        Some(base.mul_f64(factor).min(self.config.max_delay))
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.config.backoff_multiplier.max(1.0);
        let scale = multiplier.powi(attempt.min(32) as i32);
        let millis = (self.config.initial_delay.as_millis() as f64 * scale)
            .min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}
