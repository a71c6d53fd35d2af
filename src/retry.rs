//! Backoff policy applied when a failed job is released for another attempt.

/// Upper bound on any backoff delay: one hour.
pub const MAX_BACKOFF_SECS: u64 = 3600;

/// Exponential backoff, `min(2^attempts, 3600)` seconds, or no delay at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub enabled: bool,
    pub max_delay_secs: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            enabled: true,
            max_delay_secs: MAX_BACKOFF_SECS,
        }
    }
}

impl Backoff {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay in seconds before the next attempt, given the attempt count
    /// *after* the failed attempt was recorded. The first retry waits 2s.
    #[must_use]
    pub fn delay_for_attempt(&self, attempts: u32) -> u64 {
        if !self.enabled {
            return 0;
        }
        2u64.checked_pow(attempts)
            .map_or(self.max_delay_secs, |delay| delay.min(self.max_delay_secs))
    }
}

/// Whether a job that has run `attempts` times may run again.
#[must_use]
pub const fn should_retry(attempts: u32, max_attempts: u32) -> bool {
    attempts < max_attempts
}
