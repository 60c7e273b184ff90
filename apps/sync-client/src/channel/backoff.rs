use std::time::Duration;

/// Linear reconnect backoff: attempt `n` waits `base_delay * n`, capped at
/// [`ReconnectPolicy::MAX_DELAY`], and no attempt is made past `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    /// Longest wait between attempts, whatever the base delay.
    pub const MAX_DELAY: Duration = Duration::from_secs(3600);

    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// Delay before 1-based `attempt`, or `None` once the budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let delay = self
            .base_delay
            .checked_mul(attempt)
            .unwrap_or(Self::MAX_DELAY);
        Some(delay.min(Self::MAX_DELAY))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Self::DEFAULT_MAX_ATTEMPTS)
    }
}
