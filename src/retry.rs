//! Bounded retry for transient storage contention.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Capped exponential backoff for busy/locked errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Run a blocking operation, retrying while `retryable` says so.
    pub fn run_blocking<T>(
        &self,
        label: &str,
        retryable: fn(&StoreError) -> bool,
        mut op: impl FnMut() -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if retryable(&err) => {
                    if attempt >= self.max_attempts {
                        return Err(exhausted(label, attempt, err));
                    }
                    let delay = self.delay_for(attempt);
                    debug!(op = label, attempt, ?delay, "retrying after contention: {}", err);
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Async twin of [`RetryPolicy::run_blocking`].
    pub async fn run_async<T, F, Fut>(
        &self,
        label: &str,
        retryable: fn(&StoreError) -> bool,
        mut op: F,
    ) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if retryable(&err) => {
                    if attempt >= self.max_attempts {
                        return Err(exhausted(label, attempt, err));
                    }
                    let delay = self.delay_for(attempt);
                    debug!(op = label, attempt, ?delay, "retrying after contention: {}", err);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub fn busy(err: &StoreError) -> bool {
    err.is_busy()
}

pub fn busy_or_conflict(err: &StoreError) -> bool {
    err.is_busy() || err.is_unique_violation()
}

fn exhausted(label: &str, attempts: u32, err: StoreError) -> StoreError {
    // Integrity errors keep their identity; only contention collapses to Busy.
    if err.is_busy() {
        StoreError::Busy(format!("{} gave up after {} attempts: {}", label, attempts, err))
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for(30), Duration::from_millis(250));
    }

    #[test]
    fn test_retries_busy_then_succeeds() {
        let calls = Cell::new(0);
        let result = fast().run_blocking("op", busy, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(StoreError::Busy("locked".to_string()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_gives_up_after_cap() {
        let calls = Cell::new(0);
        let result: StoreResult<()> = fast().run_blocking("op", busy, || {
            calls.set(calls.get() + 1);
            Err(StoreError::Busy("locked".to_string()))
        });
        assert!(matches!(result, Err(StoreError::Busy(_))));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_does_not_retry_not_found() {
        let calls = Cell::new(0);
        let result: StoreResult<()> = fast().run_blocking("op", busy, || {
            calls.set(calls.get() + 1);
            Err(StoreError::not_found("job"))
        });
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_async_retry() {
        let mut calls = 0;
        let result = fast()
            .run_async("op", busy, || {
                calls += 1;
                let current = calls;
                async move {
                    if current == 1 {
                        Err(StoreError::Busy("locked".to_string()))
                    } else {
                        Ok(current)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }
}
