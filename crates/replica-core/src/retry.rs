use std::time::Duration;

/// Fixed relist delay after a failed protocol run.
pub const DEFAULT_RELIST_DELAY_MS: u64 = 5_000;

/// Backoff policy used between relist attempts.
///
/// The default is a fixed delay; a growing policy is available through
/// [`RetryPolicy::new`] but the synchronizer never requires one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        let delay_ms = delay.as_millis().min(u128::from(u64::MAX)) as u64;
        Self::new(delay_ms, delay_ms)
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn is_fixed(&self) -> bool {
        self.base_delay_ms == self.max_delay_ms
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(DEFAULT_RELIST_DELAY_MS))
    }
}
