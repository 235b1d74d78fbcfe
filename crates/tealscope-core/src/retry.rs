//! Retry with an explicit delay schedule.
//!
//! The collector is a local process that is often restarted while a page is
//! being debugged, so deliveries get a short, fixed schedule of retries
//! rather than open-ended exponential backoff.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tealscope_core::retry::{RetryPolicy, with_retry};
//!
//! let policy = RetryPolicy::collector(); // 250ms, 500ms, 1000ms
//!
//! let result = with_retry(&policy, || async {
//!     post_payload().await
//! }).await;
//! ```
//!
//! Attempts = `delays.len() + 1`. There is no delay after the final attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry behavior as an explicit schedule of delays between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::collector()
    }
}

impl RetryPolicy {
    /// Retry after each of `delays`, in order.
    #[must_use]
    pub fn fixed(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Collector delivery: 250ms, 500ms, 1000ms (4 attempts).
    #[must_use]
    pub fn collector() -> Self {
        Self::fixed(vec![
            Duration::from_millis(250),
            Duration::from_millis(500),
            Duration::from_millis(1000),
        ])
    }

    /// A single attempt, no retries.
    #[must_use]
    pub fn none() -> Self {
        Self::fixed(Vec::new())
    }

    /// Total number of attempts this policy allows.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.delays.len()).unwrap_or(u32::MAX).saturating_add(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed).
    ///
    /// `None` once the schedule is exhausted.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        let idx = usize::try_from(attempt).ok()?.checked_sub(1)?;
        self.delays.get(idx).copied()
    }

    #[must_use]
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// The result (success or final error).
    pub result: Result<T, E>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent (including delays).
    pub elapsed: Duration,
}

/// Execute an async operation with retry.
///
/// # Logging
///
/// Each retry attempt is logged with:
/// - Attempt number
/// - Delay applied
/// - Error that triggered the retry
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retry_outcome(policy, operation).await.result
}

/// Execute an async operation with retry, returning detailed outcome.
pub async fn with_retry_outcome<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        total_attempts = attempt,
                        retries = attempt - 1,
                        "Operation succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => {
                let Some(delay) = policy.delay_for_attempt(attempt) else {
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts(),
                        error = %e,
                        "Operation failed after all retry attempts"
                    );
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                };

                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying operation after failure"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
