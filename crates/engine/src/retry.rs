use std::time::Duration;

use concord_storage::StorageError;
use tracing::warn;

use crate::config::RetryConfig;

/// Exponential backoff for transient storage failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// The last error seen once every attempt has failed.
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last: StorageError,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// Non-transient errors are returned after the first attempt.
    pub fn run<T>(
        &self,
        label: &str,
        mut op: impl FnMut() -> Result<T, StorageError>,
    ) -> Result<T, RetryExhausted> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(label, attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient storage failure, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
            }
        }
    }
}
