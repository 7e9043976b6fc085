//! Exponential backoff
//!
//! [`BackoffPolicy::delay`] is a pure function of the attempt number so
//! schedules can be tested without time passing; jitter is applied on top by
//! [`BackoffPolicy::jittered`] with a caller-supplied RNG.

use rand::Rng;
use std::time::Duration;

use crate::config::{ResilienceConfig, SchedulerConfig};

/// Exponential backoff with a cap and optional jitter
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,

    /// Maximum delay (caps exponential growth)
    pub max_delay: Duration,

    /// Multiplier for exponential backoff
    pub multiplier: f64,

    /// Fraction of the delay randomized in both directions (0.0 - 1.0)
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_ratio: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy without jitter
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
            jitter_ratio: 0.0,
        }
    }

    /// Builder-style jitter override
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Delay between outbound call attempts
    pub fn for_calls(config: &ResilienceConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.backoff_multiplier,
        )
        .with_jitter(config.jitter_ratio)
    }

    /// Delay before a retrying item becomes due again
    pub fn for_items(config: &SchedulerConfig) -> Self {
        Self::new(
            Duration::from_secs(config.retry_base_delay_secs),
            Duration::from_secs(config.retry_max_delay_secs),
            config.retry_multiplier,
        )
    }

    /// Delay before retry number `attempt` (1-based); attempt 0 has none
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let exponential = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = exponential.min(self.max_delay.as_secs_f64());

        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else if capped > 0.0 {
            self.max_delay
        } else {
            Duration::ZERO
        }
    }

    /// [`Self::delay`] randomized by up to `jitter_ratio` in either direction
    pub fn jittered<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }

        let factor = rng.gen_range((1.0 - self.jitter_ratio)..=(1.0 + self.jitter_ratio));
        delay.mul_f64(factor)
    }
}
