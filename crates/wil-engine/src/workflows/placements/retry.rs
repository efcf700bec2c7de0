use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Bounded replay schedule for transactions that lose an optimistic write
/// race. Delays grow exponentially with equal jitter so colliding callers
/// spread out instead of stampeding the same row again.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay before replaying after the given 1-based failed attempt:
    /// half the capped exponential step is fixed, the rest is random.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let exponential = self
            .base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay);
        let half = exponential / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }
}

/// Runs one transaction attempt under a hard deadline. Elapsing maps to the
/// caller's dependency-class error rather than hanging the operation.
pub(crate) async fn with_deadline<T, E, F>(
    limit: Duration,
    attempt: F,
    on_timeout: impl FnOnce() -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, attempt).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}
