//! Exponential backoff for bridge operations.
//!
//! The query cache spaces its error retries with [`RetryConfig::backoff`];
//! the IPC client uses [`retry_async`] while the backend is still starting.

use crate::error::{BridgeError, ErrorKind, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Doubling backoff with an upper bound and optional jitter.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (0 = first retry).
    ///
    /// `base_delay * 2^retry`, capped at `max_delay`. With jitter the result
    /// is scaled by a factor in `[0.5, 1.5)` and capped again.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter {
            return delay;
        }
        let scale = rand::rng().random_range(0.5..1.5);
        delay.mul_f64(scale).min(self.max_delay)
    }
}

/// What [`retry_async`] went through.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub attempts: u32,
    pub total_delay: Duration,
    /// Kind of the most recent failure, if any attempt failed.
    pub last_error: Option<ErrorKind>,
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or runs out of attempts.
pub async fn retry_async<F, Fut, T>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&BridgeError) -> bool,
) -> (Result<T>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut stats = RetryStats::default();

    loop {
        stats.attempts += 1;
        let err = match operation().await {
            Ok(value) => return (Ok(value), stats),
            Err(err) => err,
        };
        stats.last_error = Some(err.kind());

        if !should_retry(&err) {
            debug!("Giving up on non-retryable error: {}", err);
            return (Err(err), stats);
        }
        if stats.attempts >= max_attempts {
            warn!("Giving up after {} attempts: {}", stats.attempts, err);
            return (Err(err), stats);
        }

        let delay = config.backoff(stats.attempts - 1);
        stats.total_delay += delay;
        debug!(
            "Attempt {}/{} failed ({}), retrying in {:?}",
            stats.attempts, max_attempts, err, delay
        );
        tokio::time::sleep(delay).await;
    }
}
