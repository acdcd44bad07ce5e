//! Conflict Retrier
//!
//! Bounded retry for read-modify-write cycles against the machine store.
//! Only the optimistic-concurrency conflict is retried, with exponential
//! backoff and jitter between attempts; any other error ends the loop.

use crate::config::RetryConfig;
use crate::error::{ServiceError, StoreError};
use crate::observability::{events, metrics};
use backoff::future::retry_notify;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Errors that can carry the store's conflict signature.
pub trait ConflictSignature {
    fn is_conflict(&self) -> bool;
}

impl ConflictSignature for StoreError {
    fn is_conflict(&self) -> bool {
        StoreError::is_conflict(self)
    }
}

impl ConflictSignature for ServiceError {
    fn is_conflict(&self) -> bool {
        matches!(self, ServiceError::Store(err) if err.is_conflict())
    }
}

#[derive(Debug, Clone)]
pub struct ConflictRetrier {
    config: RetryConfig,
}

impl ConflictRetrier {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_backoff)
            .with_max_interval(self.config.max_backoff)
            .with_multiplier(self.config.multiplier)
            .with_randomization_factor(self.config.randomization_factor)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Run `attempt` until it succeeds, fails with a non-conflict error, or
    /// the attempt budget is spent. Each call of `attempt` must re-read the
    /// record it modifies. The last conflict is returned when exhausted.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, E>
    where
        E: ConflictSignature,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts();
        let attempts = AtomicU32::new(0);

        retry_notify(
            self.backoff(),
            || {
                let n = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                let fut = attempt();
                async move {
                    match fut.await {
                        Ok(value) => Ok(value),
                        Err(e) if e.is_conflict() && n < max_attempts => {
                            Err(backoff::Error::transient(e))
                        }
                        Err(e) => Err(backoff::Error::permanent(e)),
                    }
                }
            },
            |_err: E, delay: Duration| {
                let n = attempts.load(Ordering::Relaxed);
                events::conflict_retry(operation, n, max_attempts, delay.as_millis() as u64);
                metrics::record_conflict_retry(operation);
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn retrier(max_attempts: u32) -> ConflictRetrier {
        ConflictRetrier::new(RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            randomization_factor: 0.5,
        })
    }

    fn conflict() -> StoreError {
        StoreError::Conflict { id: "m1".into() }
    }

    #[tokio::test]
    async fn test_succeeds_after_conflicts_within_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retrier(5)
            .run("test", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 5 {
                        Err(conflict())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_exhausts_after_exactly_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), StoreError> = retrier(4)
            .run("test", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(conflict())
                }
            })
            .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_other_errors_abort_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), StoreError> = retrier(10)
            .run("test", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StoreError::Unavailable("down".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_service_errors_are_classified() {
        assert!(ConflictSignature::is_conflict(&ServiceError::Store(conflict())));
        assert!(!ConflictSignature::is_conflict(&ServiceError::AlreadyAllocated(
            "m1".into()
        )));

        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), ServiceError> = retrier(3)
            .run("test", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ServiceError::NotAllocated("m1".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(ServiceError::NotAllocated(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
