//! Exponential backoff policy and the sleeper seam that carries it out.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use gridharvest_shared::RetryConfig;

/// Pure backoff arithmetic. Never sleeps; callers own the suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// `base_delay * 2^attempt`, saturating at `Duration::MAX`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(0);
        if factor == 0 {
            return if self.base_delay.is_zero() {
                Duration::ZERO
            } else {
                Duration::MAX
            };
        }
        self.base_delay.saturating_mul(factor)
    }

    /// Whether `attempt` attempts use up the budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Sum of every delay slept when all attempts fail.
    ///
    /// Attempts are numbered from 0; failed attempt `n` is followed by
    /// `delay_for_attempt(n)` unless it was the last one.
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|n| self.delay_for_attempt(n))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
        )
    }
}

/// Suspends the current task between attempts.
pub trait Sleeper: Send + Sync + 'static {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Real wall-clock sleeping on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested sleeps and returns immediately.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every duration requested so far, in order.
    pub fn recorded(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn total(&self) -> Duration {
        self.recorded()
            .into_iter()
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy::new(8, Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(256));
    }

    #[test]
    fn delay_saturates() {
        let policy = RetryPolicy::new(8, Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(40), Duration::MAX);
        assert_eq!(policy.delay_for_attempt(64), Duration::MAX);

        let zero = RetryPolicy::new(8, Duration::ZERO);
        assert_eq!(zero.delay_for_attempt(64), Duration::ZERO);
    }

    #[test]
    fn exhaustion_boundary() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[test]
    fn total_backoff_for_eight_attempts() {
        let policy = RetryPolicy::new(8, Duration::from_secs(2));
        // 2 + 4 + ... + 128
        assert_eq!(policy.total_backoff(), Duration::from_secs(254));
    }

    #[tokio::test]
    async fn recording_sleeper_does_not_wait() {
        let sleeper = RecordingSleeper::new();
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_secs(3600)).await;
        sleeper.sleep(Duration::from_secs(1)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(sleeper.total(), Duration::from_secs(3601));
    }
}
