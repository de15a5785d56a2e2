//! Retry logic with exponential backoff for establishing streams
//!
//! - Exponential backoff with configurable base delay
//! - Maximum retry attempts
//! - Jitter to prevent thundering herd
//! - Non-retryable errors (see `Error::is_retryable`) end the loop at once

use crate::config::RetryConfig;
use crate::Result;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry executor with exponential backoff
///
/// # Example
///
/// ```
/// use remotemedia_decoupled::config::RetryConfig;
/// use remotemedia_decoupled::client::RetryExecutor;
///
/// let executor = RetryExecutor::new(RetryConfig {
///     max_retries: 3,
///     backoff_ms: 100,
/// });
/// assert_eq!(executor.max_attempts(), 4);
/// ```
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create new retry executor
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// First attempt plus retries
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries + 1
    }

    /// Backoff before retry number `attempt` (1-based), without jitter
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.config.backoff_ms.saturating_mul(1 << exponent))
    }

    /// Execute operation with retry logic
    ///
    /// `on_attempt` is called with the 1-based attempt number before every
    /// attempt, so callers can count retries.
    ///
    /// # Returns
    ///
    /// * `Ok(T)` - Operation succeeded (possibly after retries)
    /// * `Err(Error)` - Operation failed after all retries exhausted, or with
    ///   an error that retrying cannot fix
    pub async fn execute<F, Fut, T, A>(&self, mut operation: F, mut on_attempt: A) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
        A: FnMut(u32),
    {
        let max_attempts = self.max_attempts();
        let mut attempts = 0;

        loop {
            attempts += 1;
            on_attempt(attempts);

            match operation().await {
                Ok(result) => {
                    if attempts > 1 {
                        debug!("Operation succeeded after {} attempts", attempts);
                    }
                    return Ok(result);
                }
                Err(e) if !e.is_retryable() => {
                    warn!("Operation failed with non-retryable error: {}", e);
                    return Err(e);
                }
                Err(e) if attempts < max_attempts => {
                    let backoff =
                        u64::try_from(self.backoff_for(attempts).as_millis()).unwrap_or(u64::MAX);

                    // Add jitter (±25%) to prevent thundering herd
                    let jitter_range = (backoff / 4) as f64;
                    let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
                    let backoff_with_jitter = (backoff as f64 + jitter).max(0.0) as u64;

                    warn!(
                        "Operation failed (attempt {}/{}): {} - retrying in {}ms",
                        attempts, max_attempts, e, backoff_with_jitter
                    );

                    tokio::time::sleep(Duration::from_millis(backoff_with_jitter)).await;
                }
                Err(e) => {
                    warn!("Operation failed after {} attempts: {}", attempts, e);
                    return Err(e);
                }
            }
        }
    }
}
