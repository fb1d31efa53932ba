use crate::metrics_defs::RETRY_ATTEMPTS;
use shared::counter;
use std::fmt;
use std::future::Future;
use tokio::time::{Duration, sleep};

/// How the delay grows between consecutive failed attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay after every failure.
    Fixed,
    /// `delay * n` after the n-th failure.
    Linear,
}

/// Retry policy shared by every background write and by the startup paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub backoff: Backoff,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

#[derive(thiserror::Error, Debug)]
#[error("{operation} failed after {attempts} attempts: {last_error}")]
pub struct RetryExhausted<E>
where
    E: std::error::Error + 'static,
{
    pub operation: &'static str,
    pub attempts: u32,
    #[source]
    pub last_error: E,
}

impl RetryPolicy {
    pub fn forever(delay: Duration) -> Self {
        RetryPolicy {
            delay,
            backoff: Backoff::Fixed,
            max_attempts: None,
        }
    }

    pub fn bounded(max_attempts: u32, delay: Duration, backoff: Backoff) -> Self {
        RetryPolicy {
            delay,
            backoff,
            max_attempts: Some(max_attempts),
        }
    }

    /// Delay to wait after the `failures`-th consecutive failure (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Linear => self.delay.saturating_mul(failures.max(1)),
        }
    }

    /// Runs `operation` until it succeeds or the attempt budget is spent.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &'static str,
        mut attempt: F,
    ) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let mut failures = 0;

        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    failures += 1;
                    counter!(RETRY_ATTEMPTS, "operation" => operation).increment(1);

                    if self.max_attempts.is_some_and(|max| failures >= max) {
                        tracing::error!(operation, attempts = failures, error = %e, "giving up");
                        return Err(RetryExhausted {
                            operation,
                            attempts: failures,
                            last_error: e,
                        });
                    }

                    self.wait(operation, failures, &e.to_string()).await;
                }
            }
        }
    }

    /// Runs `operation` until it succeeds, ignoring any attempt budget.
    ///
    /// Used for background convergence writes: a dependency that never comes
    /// back is left to external health monitoring.
    pub async fn run_forever<T, E, F, Fut>(&self, operation: &'static str, mut attempt: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut failures = 0;

        loop {
            let error = match attempt().await {
                Ok(value) => return value,
                Err(e) => e.to_string(),
            };
            failures += 1;
            counter!(RETRY_ATTEMPTS, "operation" => operation).increment(1);
            self.wait(operation, failures, &error).await;
        }
    }

    async fn wait(&self, operation: &'static str, failures: u32, error: &str) {
        let delay = self.delay_after(failures);
        tracing::warn!(
            operation,
            attempt = failures,
            error,
            delay_ms = delay.as_millis() as u64,
            "operation failed, retrying"
        );
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(thiserror::Error, Debug)]
    #[error("flaky dependency")]
    struct Flaky;

    /// Fails the first `failures` calls, then succeeds with the call number.
    fn flaky(calls: &AtomicU32, failures: u32) -> impl Future<Output = Result<u32, Flaky>> + '_ {
        async move {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= failures { Err(Flaky) } else { Ok(call) }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forever_eventually_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::forever(Duration::from_secs(2));

        let start = Instant::now();
        let result = policy.run_forever("test", || flaky(&calls, 4)).await;

        assert_eq!(result, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // Four fixed two-second waits on the paused clock.
        assert_eq!(start.elapsed(), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_gives_up() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::bounded(5, Duration::from_secs(1), Backoff::Linear);

        let start = Instant::now();
        let err = policy.run("test", || flaky(&calls, u32::MAX)).await.unwrap_err();

        assert_eq!(err.attempts, 5);
        assert_eq!(err.operation, "test");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // 1 + 2 + 3 + 4 seconds; no wait after the final attempt.
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_succeeds_within_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::bounded(5, Duration::from_secs(1), Backoff::Fixed);

        let result = policy.run("test", || flaky(&calls, 2)).await.unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_future_can_be_spawned() {
        let calls = std::sync::Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::forever(Duration::from_secs(2));

        let task_calls = calls.clone();
        let handle = tokio::spawn(async move {
            policy
                .run_forever("test", || flaky(&task_calls, 2))
                .await
        });

        assert_eq!(handle.await.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_schedule() {
        let fixed = RetryPolicy::forever(Duration::from_secs(2));
        assert_eq!(fixed.delay_after(1), Duration::from_secs(2));
        assert_eq!(fixed.delay_after(7), Duration::from_secs(2));

        let linear = RetryPolicy::bounded(5, Duration::from_secs(1), Backoff::Linear);
        assert_eq!(linear.delay_after(1), Duration::from_secs(1));
        assert_eq!(linear.delay_after(3), Duration::from_secs(3));
    }
}
