//! Transport retry policy for storage calls.
//!
//! Backend failures that may succeed on a second attempt (throttling, I/O
//! hiccups) are retried with exponential backoff: `base_delay * 2^(attempt-1)`,
//! capped at `max_delay`. Internal errors are returned immediately.

use std::future::Future;
use std::time::Duration;

use common::StorageResult;
use serde::Deserialize;

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after the first one. Zero disables retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Runs `op`, retrying retryable failures up to `max_retries` times.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempts <= self.max_retries => {
                    let backoff = self.backoff(attempts);
                    tracing::warn!(
                        op = op_name,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "storage call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    if attempts > 1 {
                        tracing::warn!(
                            op = op_name,
                            attempts,
                            error = %err,
                            "storage call failed after retries"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}
