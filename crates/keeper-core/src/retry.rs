//! Bounded retry for volatile cluster reads.
//!
//! A [`RetryPolicy`] is three bounds: a fixed backoff interval, a maximum
//! attempt count, and a cumulative timeout. [`RetryPolicy::run`] stops at
//! whichever bound is hit first and surfaces the last error. Only transient
//! errors are retried; a rejection or an insufficient key set is returned
//! immediately.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ClusterError;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry bounds for a single logical call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed delay between attempts.
    pub interval: Duration,
    /// Maximum number of attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Ceiling on the total time spent, including in-flight attempts.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt, bounded by `timeout`.
    #[must_use]
    pub fn once(timeout: Duration) -> Self {
        Self {
            interval: Duration::ZERO,
            max_attempts: 1,
            timeout,
        }
    }

    /// Run `attempt` until it succeeds or a bound is hit.
    ///
    /// `address` and `operation` only label logs and the timeout error.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error, or the last transient error
    /// once attempts or time run out. If the cumulative timeout expires
    /// before any attempt completed, returns [`ClusterError::Transient`].
    pub async fn run<T, F, Fut>(
        &self,
        address: &str,
        operation: &'static str,
        mut attempt: F,
    ) -> Result<T, ClusterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let deadline = Instant::now() + self.timeout;
        let max_attempts = self.max_attempts.max(1);
        let mut tries = 0u32;
        let mut last_err: Option<ClusterError> = None;

        loop {
            tries = tries.saturating_add(1);

            let err = match tokio::time::timeout_at(deadline, attempt()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_elapsed) => {
                    warn!(address, operation, tries, "retry timeout reached mid-attempt");
                    return Err(last_err.unwrap_or_else(|| ClusterError::Transient {
                        address: address.to_owned(),
                        operation,
                        reason: format!("timed out after {:?}", self.timeout),
                    }));
                }
            };

            if !err.is_transient() {
                return Err(err);
            }

            if tries >= max_attempts {
                warn!(address, operation, tries, error = %err, "giving up after max attempts");
                return Err(err);
            }

            if Instant::now() + self.interval >= deadline {
                warn!(address, operation, tries, error = %err, "giving up, retry timeout would be exceeded");
                return Err(err);
            }

            debug!(
                address,
                operation,
                tries,
                backoff_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "transient failure, retrying"
            );
            last_err = Some(err);
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn transient() -> ClusterError {
        ClusterError::Transient {
            address: "http://a".to_owned(),
            operation: "seal-status",
            reason: "connection refused".to_owned(),
        }
    }

    fn policy(interval_ms: u64, attempts: u32, timeout_ms: u64) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(interval_ms),
            max_attempts: attempts,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_immediately() {
        let result = policy(100, 3, 1_000)
            .run("http://a", "op", || async { Ok::<_, ClusterError>(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let result = policy(100, 5, 10_000)
            .run("http://a", "op", move || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let result: Result<(), _> = policy(100, 3, 60_000)
            .run("http://a", "op", move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_cumulative_timeout() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        // 1s interval under a 2.5s ceiling leaves room for three attempts,
        // well below the attempt bound.
        let result: Result<(), _> = policy(1_000, 100, 2_500)
            .run("http://a", "op", move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempt_is_cut_off_by_timeout() {
        let result: Result<(), _> = policy(100, 5, 500)
            .run("http://a", "op", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let result: Result<(), _> = policy(100, 5, 10_000)
            .run("http://a", "op", move || {
                c.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ClusterError::Rejected {
                        address: "http://a".to_owned(),
                        operation: "op",
                        status: 400,
                        message: "bad request".to_owned(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(ClusterError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_tries_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let result: Result<(), _> = policy(10, 0, 10_000)
            .run("http://a", "op", move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn once_makes_a_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let result: Result<(), _> = RetryPolicy::once(Duration::from_secs(1))
            .run("http://a", "op", move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
