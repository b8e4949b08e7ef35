use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use turnstile_store::app_config::RetryConfig;

use crate::error::{InventoryError, InventoryResult};

/// Backoff for optimistic-write retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` means try once.
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    /// No sleeping between attempts. Used by tests.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// delay = initial_delay * multiplier^attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }
}

/// Re-run `operation` while it loses an optimistic race.
///
/// Only [`InventoryError::ConflictAbort`] is retried. Every other error
/// (including `Insufficient` and `SeatTaken`) is returned unchanged on the
/// first occurrence. Each attempt must re-read whatever it guards on.
pub async fn retry_on_conflict<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> InventoryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = InventoryResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "Write succeeded after conflict retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() => {
                if attempt >= policy.max_retries {
                    tracing::warn!(attempts = attempt + 1, error = %err, "Conflict retries exhausted");
                    return Err(InventoryError::RetriesExhausted {
                        attempts: attempt + 1,
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(attempt, ?delay, error = %err, "Write conflict, retrying");
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
