//! Bounded retry with capped exponential backoff for transport operations.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Retry budget applied at the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based), with up to
    /// 10% random jitter so concurrent retriers spread out.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1_u32 << exp)
            .min(self.max_delay);
        let jitter_cap = u64::try_from(base.as_millis() / 10).unwrap_or(u64::MAX);
        if jitter_cap == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_cap))
    }

    /// Runs `op` until it succeeds or the attempt budget is spent.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt once the budget is exhausted.
    pub async fn run<T, E, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_attempts => {
                    error!(op = op_name, attempt, error = %e, "retry budget exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        op = op_name,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "transport operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
