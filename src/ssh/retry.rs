//! Caller-side retry with exponential backoff.
//!
//! Sessions never retry on their own; callers that want another attempt at
//! connecting wrap the whole connect-and-login sequence in [`with_retry_if`].

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::SshError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Random spread applied to each delay (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn no_retry() -> Self {
        Self::with_max_attempts(1)
    }

    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Delay before attempt number `attempt` (0-indexed); none before the first.
    #[expect(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let max_delay = self.max_delay_ms as f64;
        let delay = (self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent))
            .min(max_delay);

        let spread = delay * self.jitter;
        let jitter = if spread > 0.0 {
            clock_fraction().mul_add(2.0, -1.0) * spread
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).clamp(0.0, max_delay) as u64)
    }
}

/// Sub-second clock noise in `[0, 1)`, enough to spread concurrent retries.
fn clock_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos) / 1_000_000_000.0
}

/// Whether another attempt could succeed: the connection failed or went
/// away, as opposed to being refused for a reason that will not change.
#[must_use]
pub const fn is_retryable_error(error: &SshError) -> bool {
    matches!(
        error,
        SshError::Connect { .. } | SshError::Timeout { .. } | SshError::Disconnect { .. }
    )
}

/// Run `operation` until it succeeds, `should_retry` rejects its error or
/// `config.max_attempts` attempts have been made.
///
/// # Errors
///
/// Returns the error of the last attempt.
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let delay = config.delay_for_attempt(attempt);
        if !delay.is_zero() {
            debug!(
                operation = %operation_name,
                attempt = attempt + 1,
                delay_ms = delay.as_millis(),
                "Retrying after delay"
            );
            sleep(delay).await;
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(operation = %operation_name, attempt = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if attempt + 1 < max_attempts && should_retry(&e) => {
                warn!(
                    operation = %operation_name,
                    attempt = attempt + 1,
                    max_attempts,
                    error = %e,
                    "Operation failed, will retry"
                );
            }
            Err(e) => {
                warn!(operation = %operation_name, attempt = attempt + 1, error = %e, "Operation failed, not retrying");
                return Err(e);
            }
        }
        attempt += 1;
    }
}
