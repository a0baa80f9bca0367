//! Bounded retry for optimistic-concurrency conflicts.

use std::future::Future;
use std::time::Duration;

use crate::types::{Error, Result, RetryConfig};

/// Exponential backoff schedule: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.config
            .base_backoff
            .saturating_mul(factor)
            .min(self.config.max_backoff)
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }
}

/// Run `op` until it returns something other than `Error::Conflict`, sleeping
/// between attempts. Exhaustion surfaces the last conflict.
pub async fn retry_on_conflict<T, F, Fut>(backoff: &Backoff, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(Error::Conflict(msg)) => {
                attempt += 1;
                if attempt >= backoff.max_attempts() {
                    tracing::warn!(
                        "conflict_retries_exhausted: operation={}, attempts={}, last={}",
                        operation,
                        attempt,
                        msg
                    );
                    return Err(Error::conflict(format!(
                        "{operation}: gave up after {attempt} attempts: {msg}"
                    )));
                }
                let delay = backoff.delay(attempt - 1);
                tracing::debug!(
                    "conflict_retry: operation={}, attempt={}, delay_ms={}, reason={}",
                    operation,
                    attempt,
                    delay.as_millis(),
                    msg
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn backoff(max_attempts: u32) -> Backoff {
        Backoff::new(RetryConfig {
            max_attempts,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        })
    }

    #[test]
    fn test_delay_is_capped() {
        let b = backoff(8);
        assert_eq!(b.delay(0), Duration::from_millis(10));
        assert_eq!(b.delay(1), Duration::from_millis(20));
        assert_eq!(b.delay(2), Duration::from_millis(40));
        assert_eq!(b.delay(3), Duration::from_millis(50));
        assert_eq!(b.delay(40), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_on_conflict(&backoff(5), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::conflict("stale"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_conflict() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict(&backoff(3), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::conflict("stale"))
        })
        .await;
        assert!(matches!(result, Err(Error::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict(&backoff(5), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::store_unavailable("down"))
        })
        .await;
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
