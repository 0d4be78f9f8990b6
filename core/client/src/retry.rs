//! Backoff for establishing the connection to the drive.
//!
//! File operations are never retried; a failed upload or download goes
//! straight back to the caller.

use std::future::Future;
use std::time::Duration;

use graphdrive_common::{Error, Result};

/// How often and how patiently to retry.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included. Never below 1.
    pub max_attempts: u32,
    /// Pause after the first failure; doubles after each further one.
    pub initial_delay: Duration,
    /// Upper bound for a single pause.
    pub max_delay: Duration,
    /// Randomize each pause to 75-125% of its nominal length.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Pause after the `failures`-th consecutive failure (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(31);
        let nominal = self
            .initial_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay);

        if self.jitter {
            nominal.mul_f64(0.75 + rand::random::<f64>() * 0.5)
        } else {
            nominal
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Runs an operation until it succeeds, fails for good, or runs out of
/// attempts.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Retry `operation` while it fails with a transient error
    /// (see [`Error::is_transient`]).
    pub async fn execute<F, Fut, T>(&self, label: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_if(label, operation, Error::is_transient).await
    }

    /// Retry `operation` while `retryable` accepts its error.
    pub async fn execute_if<F, Fut, T, C>(
        &self,
        label: &str,
        operation: F,
        retryable: C,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
    {
        let mut failures = 0;

        loop {
            let err = match operation().await {
                Ok(value) => {
                    if failures > 0 {
                        tracing::debug!("{} succeeded after {} failed attempts", label, failures);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            failures += 1;
            if !retryable(&err) {
                return Err(err);
            }
            if failures >= self.config.max_attempts {
                tracing::warn!("{} gave up after {} attempts: {}", label, failures, err);
                return Err(err);
            }

            let pause = self.config.delay_after(failures);
            tracing::warn!(
                "{} failed (attempt {}/{}): {}; next try in {:?}",
                label,
                failures,
                self.config.max_attempts,
                err,
                pause
            );
            tokio::time::sleep(pause).await;
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::new(attempts)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_millis(250))
            .with_max_delay(Duration::from_secs(1))
            .with_jitter(false);

        assert_eq!(config.delay_after(1), Duration::from_millis(250));
        assert_eq!(config.delay_after(2), Duration::from_millis(500));
        assert_eq!(config.delay_after(3), Duration::from_secs(1));
        assert_eq!(config.delay_after(40), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::new(5).with_initial_delay(Duration::from_secs(4));
        for _ in 0..50 {
            let d = config.delay_after(1);
            assert!(d >= Duration::from_secs(3) && d <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_at_least_one_attempt() {
        assert_eq!(RetryConfig::new(0).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result = fast(5)
            .execute("connect", move || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(Error::Network("connection reset".to_string())),
                    1 => Err(Error::Request {
                        status: 503,
                        code: None,
                        message: "Service Unavailable".to_string(),
                    }),
                    _ => Ok("drive"),
                }
            })
            .await;

        assert_eq!(result.unwrap(), "drive");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_returns_immediately() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<()> = fast(5)
            .execute("connect", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::NotFound("drive".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<()> = fast(4)
            .execute("connect", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Network("unreachable".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_custom_condition() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<()> = fast(3)
            .execute_if(
                "connect",
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Authentication("expired".to_string()))
                },
                |e| matches!(e, Error::Authentication(_)),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
