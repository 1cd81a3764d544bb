//! Bounded fixed-interval retry for polling loops.
//!
//! Readiness probing, kill confirmation and port verification all poll the
//! operating system with a fixed interval. Each loop is bounded both by an
//! attempt count and by a wall-clock timeout, whichever comes first.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Bounds for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (at least one attempt is always made).
    pub attempts: u32,
    /// Pause between consecutive attempts.
    pub interval: Duration,
    /// Overall wall-clock limit across all attempts.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Creates a policy; the timeout defaults to `attempts * interval`.
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            interval,
            timeout: interval * attempts.max(1),
        }
    }

    /// Overrides the wall-clock limit.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Polls `probe` until it returns `true` or the policy is exhausted.
    ///
    /// Returns whether the probe ever succeeded.
    pub async fn poll_until<F, Fut>(&self, mut probe: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if probe().await {
                return true;
            }
            if attempt >= self.attempts.max(1) || Instant::now() + self.interval > deadline {
                return false;
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Runs `op` until it succeeds or the policy is exhausted.
    ///
    /// Returns the last error when every attempt failed.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> std::result::Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt >= self.attempts.max(1) || Instant::now() + self.interval > deadline
                    {
                        return Err(e);
                    }
                    tracing::debug!(attempt, error = %e, "attempt failed, retrying");
                }
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn policy_timeout_defaults_to_attempts_times_interval() {
        let policy = RetryPolicy::new(10, Duration::from_millis(500));
        assert_eq!(policy.timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn poll_until_stops_on_success() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));

        let ok = policy
            .poll_until(|| {
                calls.set(calls.get() + 1);
                let done = calls.get() == 3;
                async move { done }
            })
            .await;

        assert!(ok);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn poll_until_gives_up_after_attempts() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(4, Duration::from_millis(1));

        let ok = policy
            .poll_until(|| {
                calls.set(calls.get() + 1);
                async { false }
            })
            .await;

        assert!(!ok);
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test]
    async fn zero_attempts_still_probes_once() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(0, Duration::from_millis(1));

        policy
            .poll_until(|| {
                calls.set(calls.get() + 1);
                async { false }
            })
            .await;

        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn retry_returns_last_error() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result: Result<(), String> = policy
            .retry(|attempt| async move { Err(format!("attempt {}", attempt)) })
            .await;

        assert_eq!(result.unwrap_err(), "attempt 3");
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let result: Result<u32, String> = policy
            .retry(|attempt| async move {
                if attempt < 2 {
                    Err("refused".to_string())
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
    }
}
