// Retry with optional exponential backoff for external calls

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            exponential_backoff: true,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            retry_delay: Duration::ZERO,
            exponential_backoff: false,
        }
    }

    /// Delay before retry number `attempt + 1`; `retry_delay × 2^attempt` with backoff
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.exponential_backoff {
            let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
            self.retry_delay.saturating_mul(factor)
        } else {
            self.retry_delay
        }
    }
}

/// Run `task` until it succeeds or the policy is exhausted, returning the last failure
pub async fn execute_with_retry<T, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    mut task: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match task().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                if policy.max_retries > 0 {
                    warn!(operation, attempts = attempt + 1, error = %error, "Retries exhausted");
                }
                return Err(error);
            }
        }
    }
}
