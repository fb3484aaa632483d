//! Bounded retries with exponential backoff and bounded-concurrency batches.

use std::future::Future;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::warn;

use crate::error::VaultError;

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt + 1` (attempt is zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Runs remote operations under a [`RetryPolicy`].
///
/// Only [`VaultError::is_retryable`] failures are retried; terminal errors
/// (not found, permission denied, validation) surface on the first attempt.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn retry<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, VaultError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VaultError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                    let delay = self.policy.delay_for(attempt) + jitter();
                    warn!(
                        op = op_name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `worker` over `items` with at most `concurrency` in flight.
    ///
    /// Results come back in input order; a failed item never cancels the rest.
    pub async fn process_batch<I, T, F, Fut>(
        &self,
        items: Vec<I>,
        concurrency: usize,
        worker: F,
    ) -> Vec<Result<T, VaultError>>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T, VaultError>>,
    {
        let mut results: Vec<(usize, Result<T, VaultError>)> =
            stream::iter(items.into_iter().enumerate().map(|(index, item)| {
                let fut = worker(item);
                async move { (index, fut.await) }
            }))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }
}

/// Up to 100ms of jitter derived from the clock.
fn jitter() -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    Duration::from_millis(u64::from(nanos % 100))
}
