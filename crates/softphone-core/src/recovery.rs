//! Retry, backoff and timeout helpers
//!
//! Registration, presence subscription and transport reconnection share the same
//! exponential schedule: the delay before retry *n* is
//! `initial_delay × multiplier^(n-1)`, capped at `max_delay`.
//!
//! ```rust
//! # use rvoip_softphone_core::recovery::RetryConfig;
//! # use std::time::Duration;
//! let config = RetryConfig {
//!     max_attempts: 4,
//!     initial_delay: Duration::from_secs(2),
//!     max_delay: Duration::from_secs(30),
//!     backoff_multiplier: 2.0,
//!     use_jitter: false,
//! };
//!
//! assert_eq!(config.delay_for(1), Duration::from_secs(2));
//! assert_eq!(config.delay_for(2), Duration::from_secs(4));
//! assert_eq!(config.delay_for(3), Duration::from_secs(8));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{PhoneError, PhoneResult};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Spread each delay by up to ±10%
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to wait before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);

        let millis = if self.use_jitter {
            let jitter: f64 = rand::thread_rng().gen_range(-0.1..=0.1);
            (capped * (1.0 + jitter)).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(millis as u64)
    }
}

/// Stateful cursor over a [`RetryConfig`] schedule
///
/// Used where the retries are driven by timers rather than a loop, such as
/// transport reconnection.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempts: 0 }
    }

    /// Delay before the next attempt, or `None` once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.config.delay_for(self.attempts))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Why a retried operation gave up
#[derive(Debug, Clone, PartialEq)]
pub enum RetryFailure {
    Exhausted { attempts: u32, last_error: PhoneError },
    Cancelled { attempts: u32 },
}

impl RetryFailure {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryFailure::Exhausted { attempts, .. } | RetryFailure::Cancelled { attempts } => *attempts,
        }
    }
}

/// Retry an operation with exponential backoff
///
/// All errors count against the budget. An operation returning
/// [`PhoneError::Cancelled`] stops the loop, and so does cancelling `cancel`,
/// whether it happens during an attempt or during a backoff sleep.
/// The closure receives the 1-based attempt number.
pub async fn retry_with_backoff<T, F, Fut>(
    operation_name: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = PhoneResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(
            operation = operation_name,
            attempt = attempt,
            max_attempts = max_attempts,
            "Attempting operation"
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryFailure::Cancelled { attempts: attempt }),
            result = operation(attempt) => result,
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(value);
            }
            Err(PhoneError::Cancelled { .. }) => {
                return Err(RetryFailure::Cancelled { attempts: attempt });
            }
            Err(e) if attempt < max_attempts => {
                let delay = config.delay_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    error = %e,
                    category = %e.category(),
                    next_delay_ms = delay.as_millis() as u64,
                    "Attempt failed, will retry"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryFailure::Cancelled { attempts: attempt }),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                error!(
                    operation = operation_name,
                    attempts = attempt,
                    error = %e,
                    "Operation failed after all retry attempts"
                );
                return Err(RetryFailure::Exhausted {
                    attempts: attempt,
                    last_error: e,
                });
            }
        }
    }
}

/// Run a future under a timeout, converting its error into [`PhoneError`]
pub async fn with_timeout<T, E, F>(operation_name: &str, timeout: Duration, future: F) -> PhoneResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<PhoneError>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            warn!(
                operation = operation_name,
                timeout_ms = timeout.as_millis() as u64,
                "Operation timed out"
            );
            Err(PhoneError::OperationTimeout {
                operation: operation_name.to_string(),
                duration_ms: timeout.as_millis() as u64,
            })
        }
    }
}

/// [`with_timeout`] that also gives up when `cancel` fires
pub async fn cancellable<T, E, F>(
    operation_name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    future: F,
) -> PhoneResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<PhoneError>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(PhoneError::cancelled(operation_name)),
        result = with_timeout(operation_name, timeout, future) => result,
    }
}
