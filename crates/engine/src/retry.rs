//! Retry policy for outbound webhook deliveries.

use std::time::Duration;

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// No delay between retries.
    None,
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Delay doubles every attempt, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl BackoffStrategy {
    /// Delay to wait after the given failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, max } => {
                let multiplier = 2u32.saturating_pow(attempt);
                base.saturating_mul(multiplier).min(*max)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Whether another attempt follows the given failed one (1-indexed).
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
