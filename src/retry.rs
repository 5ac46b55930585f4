//! Retry logic with exponential backoff
//!
//! This module provides the retry building blocks used across the crate:
//! - [`IsRetryable`], implemented by every classified error type
//! - [`Backoff`], a capped exponential delay sequence with optional jitter,
//!   used by the orchestrator between attempts and while waiting for proxies
//! - [`with_retry`], a generic retry loop for short operations such as
//!   fetching the upstream proxy list
//!
//! # Example
//!
//! ```no_run
//! use bulkfetch::retry::{IsRetryable, with_retry};
//! use bulkfetch::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! with_retry(&config, || async { Ok::<_, MyError>(()) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, FailureClass, FetchError, SinkError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, proxy resets, throttling) return `true`.
/// Permanent failures (missing or restricted items, bad input) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // Proxy scarcity clears up on its own
            Error::NoHealthyProxy => true,
            Error::ExternalTool(msg) => {
                msg.contains("timeout") || msg.contains("busy") || msg.contains("temporary")
            }
            Error::Config { .. }
            | Error::Database(_)
            | Error::Sqlx(_)
            | Error::Serialization(_)
            | Error::Csv(_)
            | Error::CircuitOpen { .. }
            | Error::ShuttingDown
            | Error::InvalidItemId(_)
            | Error::InvalidProxy(_)
            | Error::Other(_) => false,
        }
    }
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        self.class() == FailureClass::TransientTransfer
    }
}

impl IsRetryable for SinkError {
    fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// Capped exponential backoff sequence
///
/// Each call to [`Backoff::next_delay`] returns the current delay (jittered if
/// enabled) and advances the base delay by the multiplier, never beyond `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Backoff {
    /// Create a backoff sequence
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: bool) -> Self {
        Self {
            current: initial.min(max),
            max,
            multiplier: multiplier.max(1.0),
            jitter,
        }
    }

    /// Backoff sequence for task retries
    pub fn from_retry_config(config: &RetryConfig) -> Self {
        Self::new(
            config.initial_delay,
            config.max_delay,
            config.backoff_multiplier,
            config.jitter,
        )
    }

    /// Delay to wait now; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = next.min(self.max);

        if self.jitter {
            add_jitter(delay).min(self.max)
        } else {
            delay
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// Retries while the error is retryable and fewer than `config.max_attempts`
/// retries have been made. Returns the successful result or the last error.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut backoff = Backoff::from_retry_config(config);

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;
                let delay = backoff.next_delay();

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The result lies between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Transient => write!(f, "transient error"),
                TestError::Permanent => write!(f, "permanent error"),
            }
        }
    }

    impl IsRetryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_success_no_retry() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = with_retry(&fast_config(3), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1, "should only call once");
    }

    #[tokio::test]
    async fn test_retry_transient_then_succeed() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = with_retry(&fast_config(3), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted_makes_max_plus_one_calls() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = with_retry(&fast_config(2), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError::Transient)
            }
        })
        .await;

        assert!(matches!(result, Err(TestError::Transient)));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = with_retry(&fast_config(5), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError::Permanent)
            }
        })
        .await;

        assert!(matches!(result, Err(TestError::Permanent)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(500),
            2.0,
            false,
        );
        let delays: Vec<_> = (0..5).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn jittered_backoff_stays_within_bounds() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2.0, true);
        let first = b.next_delay();
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(200));
        for _ in 0..10 {
            assert!(b.next_delay() <= Duration::from_secs(1));
        }
    }

    #[test]
    fn classified_errors_report_retryability() {
        assert!(FetchError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(FetchError::Proxy("reset".into()).is_retryable());
        assert!(!FetchError::NotFound("gone".into()).is_retryable());
        assert!(!FetchError::Restricted("private".into()).is_retryable());
        assert!(SinkError::Transient("slow down".into()).is_retryable());
        assert!(!SinkError::Permanent("bad path".into()).is_retryable());
        assert!(Error::NoHealthyProxy.is_retryable());
        assert!(!Error::ShuttingDown.is_retryable());
        assert!(
            Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "t")).is_retryable()
        );
        assert!(
            !Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "n")).is_retryable()
        );
    }
}
