//! Exponential backoff with full jitter

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// `delay(n) = uniform(0, min(cap, base * 2^n))`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
        }
    }

    /// Upper bound of the delay before attempt `attempt` (0-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Randomized delay before attempt `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

impl From<BackoffConfig> for Backoff {
    fn from(config: BackoffConfig) -> Self {
        Backoff::new(config.base, config.cap)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        BackoffConfig::default().into()
    }
}
