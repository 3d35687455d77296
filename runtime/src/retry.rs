//! Bounded retry with exponential backoff.
//!
//! Used where a transaction can lose a race and succeed when replayed, most
//! notably child waybill allocation racing on the dedup key: the replay finds
//! the winner's row and takes the re-point path.
//!
//! # Example
//!
//! ```rust
//! use waybill_flow_runtime::retry::{RetryPolicy, retry_with_predicate};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(3)
//!     .initial_delay(Duration::from_millis(5))
//!     .build();
//!
//! let value = retry_with_predicate(
//!     &policy,
//!     || async { Ok::<_, String>(42) },
//!     |err: &String| err.contains("conflict"),
//! )
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 10ms
/// - `max_delay`: 1 second
/// - `multiplier`: 2.0
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Growth factor between delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `attempt` (zero-based):
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )] // Delays are small millisecond counts
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: usize,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub const fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
        }
    }
}

/// Run `operation`, replaying it while it fails with an error for which
/// `is_retryable` holds and retries remain.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once retries are
/// exhausted.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            },
            Err(err) if !is_retryable(&err) => return Err(err),
            Err(err) if attempt >= policy.max_retries => {
                tracing::warn!(attempt, error = %err, "Operation failed after max retries");
                return Err(err);
            },
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Retryable failure, replaying"
                );
                sleep(delay).await;
                attempt += 1;
            },
        }
    }
}
