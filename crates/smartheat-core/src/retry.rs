//! Repeating requests that a sleeping thermostat missed.
//!
//! Battery powered thermostats wake up only briefly and routinely drop a
//! request. [`retry`] repeats an operation while its error is retryable,
//! waiting a fixed pacing delay after every failure so the device is never
//! hit twice in quick succession.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use smartheat_core::{Error, RetryPolicy, retry};
//!
//! # async fn example() -> Result<(), Error> {
//! // Up to three reads, 3 seconds apart.
//! let policy = RetryPolicy::paced(3, Duration::from_secs(3));
//!
//! let target = retry(&policy, "read_target", || async { Ok::<_, Error>(21.0) }).await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::Result;

/// How often, and how far apart, an operation is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least one.
    pub attempts: u32,
    /// Wait after a failed attempt before the next one.
    pub pacing: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

impl RetryPolicy {
    /// A single attempt.
    pub const fn once() -> Self {
        Self {
            attempts: 1,
            pacing: Duration::ZERO,
        }
    }

    /// Up to `attempts` attempts with `pacing` after each failure.
    pub fn paced(attempts: u32, pacing: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            pacing,
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// runs out of attempts. The last error is returned.
pub async fn retry<F, Fut, T>(policy: &RetryPolicy, operation_name: &str, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() || attempt >= attempts => return Err(e),
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}, next try in {:?}",
                    operation_name, attempt, attempts, e, policy.pacing
                );
                sleep(policy.pacing).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, RequestFailure};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    #[test]
    fn test_paced_keeps_one_attempt() {
        assert_eq!(RetryPolicy::paced(0, Duration::from_secs(3)).attempts, 1);
        assert_eq!(RetryPolicy::default(), RetryPolicy::once());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_until_success() {
        let calls = counter();
        let policy = RetryPolicy::paced(3, Duration::from_secs(3));

        let start = Instant::now();
        let result = retry(&policy, "flaky", || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::from(RequestFailure::timeout(Duration::from_secs(1))))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two failures, two full pacing delays.
        assert!(start.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_without_trailing_wait() {
        let calls = counter();
        let policy = RetryPolicy::paced(3, Duration::from_secs(3));

        let start = Instant::now();
        let result: Result<()> = retry(&policy, "dead", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::from(RequestFailure::transport("unreachable")))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Request(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_bad_payload_is_not_retried() {
        let calls = counter();
        let policy = RetryPolicy::paced(5, Duration::ZERO);

        let result: Result<()> = retry(&policy, "garbage", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::invalid_payload("/set/target", "hot"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::InvalidPayload { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
