//! Retry with exponential backoff for single-segment backend calls.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{BackendError, BackendResult};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per segment operation, including the first (default: 3).
    pub max_attempts: u32,
    /// Delay before the second attempt in milliseconds (default: 100).
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay in milliseconds (default: 2000).
    pub max_backoff_ms: u64,
    /// Multiplier applied after each failed attempt (default: 2.0).
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Compute the backoff before attempt `attempt + 1` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff_ms as f64;
        let computed = base_ms * self.backoff_multiplier.powi(attempt as i32);
        let capped = computed.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Run `operation` until it succeeds or attempts are exhausted.
///
/// A consumed upload stream cannot be replayed: retrying stops at the first
/// `StreamConsumed`, and the error of the attempt that consumed the stream is
/// returned in its place. The last error is returned on exhaustion.
pub async fn retry<F, Fut, T>(config: &RetryConfig, label: &str, mut operation: F) -> BackendResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut previous: Option<BackendError> = None;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e @ BackendError::StreamConsumed { .. }) => return Err(previous.unwrap_or(e)),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                let backoff = config.backoff(attempt - 1);
                debug!(op = label, attempt, error = %e, ?backoff, "segment operation failed, retrying");
                previous = Some(e);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig::default()
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(10), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BackendError::Other { reason: "flaky".into() })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts() {
        let calls = AtomicU32::new(0);
        let result: BackendResult<()> = retry(&fast(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::Other { reason: "down".into() }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumed_stream_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: BackendResult<()> = retry(&fast(), "put", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::StreamConsumed { name: "f".into() }) }
        })
        .await;
        assert!(matches!(result, Err(BackendError::StreamConsumed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumed_stream_reports_first_failure() {
        let calls = AtomicU32::new(0);
        let result: BackendResult<()> = retry(&fast(), "put", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(BackendError::Other { reason: "upload refused".into() })
                } else {
                    Err(BackendError::StreamConsumed { name: "f".into() })
                }
            }
        })
        .await;
        match result {
            Err(BackendError::Other { reason }) => assert_eq!(reason, "upload refused"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_follow_schedule() {
        let start = tokio::time::Instant::now();
        let result: BackendResult<()> = retry(&fast(), "test", || async {
            Err(BackendError::Other { reason: "down".into() })
        })
        .await;
        assert!(result.is_err());
        // 100ms before the second attempt, 200ms before the third
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(400), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_none_is_single_attempt() {
        let calls = AtomicU32::new(0);
        let _: BackendResult<()> = retry(&RetryConfig::none(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::Other { reason: "x".into() }) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
