//! Retry policy for cloud calls
//!
//! Retryable errors (network, timeout, server, rate limit, file in use) are
//! retried with exponential backoff: `base * 2^attempt`, capped at
//! `max_delay`. With the default configuration this gives 1s, 2s, 4s, ...
//! up to 60s. A rate-limit hint from the server is honoured when it asks
//! for a longer wait.
//!
//! Every attempt runs under its own timeout; an elapsed timeout becomes
//! [`SyncError::ConnectionTimeout`] and is retried like any other network
//! failure. Cancellation interrupts both the call and the backoff sleep.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cloudsync_core::config::RetryConfig;
use cloudsync_core::domain::SyncError;

/// Backoff and timeout settings for port calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default(), Duration::from_secs(300))
    }
}

impl RetryPolicy {
    /// Creates a policy; `max_attempts` counts the first try
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            call_timeout,
        }
    }

    pub fn from_config(config: &RetryConfig, call_timeout: Duration) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_secs(config.base_delay_secs),
            Duration::from_secs(config.max_delay_secs),
            call_timeout,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Backoff before retry number `attempt` (0-based)
    pub fn calculate_retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .saturating_mul(factor)
            .clamp(self.base_delay, self.max_delay.max(self.base_delay))
    }

    /// True if `err` is retryable and attempts remain after `attempt`
    pub fn should_retry(&self, err: &SyncError, attempt: u32) -> bool {
        err.is_retryable() && attempt + 1 < self.max_attempts
    }

    fn delay_for(&self, err: &SyncError, attempt: u32) -> Duration {
        let backoff = self.calculate_retry_delay(attempt);
        match err {
            SyncError::RateLimitExceeded {
                retry_after_secs: Some(secs),
            } => backoff.max(Duration::from_secs(*secs)).min(self.max_delay),
            _ => backoff,
        }
    }

    /// Runs `f` with a per-attempt timeout, retrying retryable failures
    ///
    /// Returns the last error once attempts are exhausted, or
    /// [`SyncError::Cancelled`] as soon as `cancel` fires.
    pub async fn with_retry<T, F, Fut>(
        &self,
        operation_name: &str,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                outcome = tokio::time::timeout(self.call_timeout, f()) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::ConnectionTimeout(format!(
                        "{operation_name} exceeded {}s",
                        self.call_timeout.as_secs_f64()
                    ))),
                },
            };

            match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation = operation_name, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if self.should_retry(&err, attempt) => {
                    let delay = self.delay_for(&err, attempt);
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient error, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!(
                            operation = operation_name,
                            attempts = attempt + 1,
                            error = %err,
                            "Giving up after retries"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}
