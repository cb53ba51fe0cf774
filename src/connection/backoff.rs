use std::time::Duration;

use rand::Rng;

/// Exponential backoff: `base * 2^exponent`, capped at `max`, plus random jitter
/// in `[0, jitter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self { base, max, jitter }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64, jitter_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
            Duration::from_millis(jitter_ms),
        )
    }

    /// Deterministic part of the delay.
    pub fn delay(&self, exponent: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let factor = 1u64.checked_shl(exponent.min(32)).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }

    pub fn delay_with_jitter(&self, exponent: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_ms)
        };
        self.delay(exponent) + Duration::from_millis(jitter)
    }
}
