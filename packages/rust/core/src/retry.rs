//! Exponential backoff with jitter.

use chrono::Duration;
use rand::Rng;

use cartograph_shared::{AppConfig, RetryConfig};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
    /// Fraction of the delay added or removed at random.
    pub jitter: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay_secs: config.base_delay_secs,
            max_delay_secs: config.max_delay_secs.max(config.base_delay_secs),
            max_attempts: config.max_attempts,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }
}

impl From<&AppConfig> for RetryPolicy {
    fn from(config: &AppConfig) -> Self {
        Self::from(&config.retry)
    }
}

impl RetryPolicy {
    /// Whether a job that has made `attempt_count` attempts is out of retries.
    pub fn exhausted(&self, attempt_count: u32) -> bool {
        attempt_count > self.max_attempts
    }

    /// `base * 2^attempt_count`, capped, before jitter.
    pub fn base_delay(&self, attempt_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt_count.min(32));
        let secs = self
            .base_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs);
        Duration::seconds(secs as i64)
    }

    /// Backoff for a job that has made `attempt_count` attempts.
    pub fn delay(&self, attempt_count: u32) -> Duration {
        let spread = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with(attempt_count, spread)
    }

    /// Backoff with a fixed jitter position in `[-1, 1]`.
    pub fn delay_with(&self, attempt_count: u32, spread: f64) -> Duration {
        let base = self.base_delay(attempt_count).num_milliseconds() as f64;
        let jittered = base * (1.0 + self.jitter * spread.clamp(-1.0, 1.0));
        Duration::milliseconds(jittered.max(0.0).round() as i64)
    }
}
