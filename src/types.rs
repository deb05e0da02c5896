use std::time::Duration;

/// Exponential backoff bookkeeping for reconnects and other repeated attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryInfo {
    /// Number of times this operation has been retried
    pub attempt: u32,
    /// Maximum number of retry attempts allowed
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,
    /// Upper bound for a single delay
    pub max_delay_ms: u64,
}

impl RetryInfo {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            max_attempts: 10,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }

    pub fn with_limits(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn next_attempt(&self) -> Option<Self> {
        if self.attempt >= self.max_attempts {
            None
        } else {
            Some(Self {
                attempt: self.attempt + 1,
                ..self.clone()
            })
        }
    }

    pub fn delay_ms(&self) -> u64 {
        let factor = 2_u64.checked_pow(self.attempt).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms())
    }

    pub fn should_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Starts over after a successful attempt.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for RetryInfo {
    fn default() -> Self {
        Self::new()
    }
}
