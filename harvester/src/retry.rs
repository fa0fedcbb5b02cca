//! Retry with backoff for transient CMS and storage failures.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{HarvestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, first one included.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// Adds 0-50% random jitter to every delay.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            base_delay: delay,
            max_delay: delay,
            backoff: Backoff::Fixed,
            jitter: false,
        }
    }

    /// `delay`, `2 * delay`, `3 * delay`, ... between attempts.
    pub fn linear(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            base_delay: delay,
            max_delay: delay.saturating_mul(attempts.max(1)),
            backoff: Backoff::Linear,
            jitter: false,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before attempt `attempt + 1` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let raw = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base.saturating_mul(attempt as u64 + 1),
            Backoff::Exponential => base.saturating_mul(2_u64.saturating_pow(attempt)),
        };
        let delay = raw.min(self.max_delay.as_millis() as u64);

        if self.jitter && delay > 0 {
            let jitter = fastrand::u64(0..=delay / 2);
            Duration::from_millis(delay + jitter)
        } else {
            Duration::from_millis(delay)
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the attempts are spent. The last error is returned.
pub async fn retry_async<T, F, Fut>(config: &RetryConfig, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = config.delay(attempt);
                warn!(
                    operation = what,
                    attempt = attempt + 1,
                    of = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after error: {}",
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Same as [`retry_async`] but gives up as soon as `cancel` fires, backoff
/// sleeps included.
pub async fn retry_cancellable<T, F, Fut>(
    config: &RetryConfig,
    what: &str,
    cancel: &tokio_util::sync::CancellationToken,
    operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(HarvestError::Cancelled),
        result = retry_async(config, what, operation) => result,
    }
}
