use std::time::Duration;

use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    /// Extra random delay as a fraction of the exponential step, in [0, 1].
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.5,
        }
    }
}

/// Exponential reconnect delay: `base * 2^attempt` plus jitter, capped at `max`.
///
/// Jitter never exceeds one step so consecutive delays never shrink.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let step = self
            .config
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.config.max);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let extra = if jitter > 0.0 {
            step.mul_f64(rand::rng().random_range(0.0..=jitter))
        } else {
            Duration::ZERO
        };

        self.attempt = self.attempt.saturating_add(1);
        step.saturating_add(extra).min(self.config.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
