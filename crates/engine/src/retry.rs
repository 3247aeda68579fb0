//! Rate-limit aware retry for ad-platform collaborators.
//!
//! Only `PlatformError::RateLimited` is retried. Every other failure is
//! returned to the caller on the first attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use adrules_core::config::RetryConfig;
use adrules_core::error::PlatformError;
use adrules_core::types::{AdRef, AdSnapshot, Inventory};

use crate::collaborators::{AdController, InventorySource, MetricsProvider};

/// Exponential backoff with an optional ±25% random jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// Policy that retries immediately, for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Backoff before retry number `attempt` (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_backoff_ms as f64);

        let final_ms = if self.jitter && capped_ms > 0.0 {
            capped_ms * rand::thread_rng().gen_range(0.75..=1.25)
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms.max(0.0) as u64)
    }

    fn delay_for(&self, attempt: u32, err: &PlatformError) -> Duration {
        match err.retry_after_ms() {
            Some(hint) => Duration::from_millis(hint.min(self.max_backoff_ms)),
            None => self.backoff_for_attempt(attempt),
        }
    }

    /// Runs `call` until it succeeds, fails with a non rate-limit error, or
    /// the retry budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, PlatformError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(err) if err.is_rate_limited() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt, &err);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "ad platform rate limited, backing off"
                    );
                    metrics::counter!("platform.rate_limited").increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Wraps a platform collaborator so every call goes through a [`RetryPolicy`].
pub struct RateLimitRetry<T: ?Sized> {
    inner: Arc<T>,
    policy: RetryPolicy,
}

impl<T: ?Sized> RateLimitRetry<T> {
    pub fn new(inner: Arc<T>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<T: InventorySource + ?Sized> InventorySource for RateLimitRetry<T> {
    async fn inventory(&self, user_id: &str) -> Result<Inventory, PlatformError> {
        self.policy
            .run("inventory", || self.inner.inventory(user_id))
            .await
    }
}

#[async_trait]
impl<T: MetricsProvider + ?Sized> MetricsProvider for RateLimitRetry<T> {
    async fn get_metrics(&self, ad: &AdRef) -> Result<Option<AdSnapshot>, PlatformError> {
        self.policy
            .run("get_metrics", || self.inner.get_metrics(ad))
            .await
    }
}

#[async_trait]
impl<T: AdController + ?Sized> AdController for RateLimitRetry<T> {
    async fn stop(&self, ad_id: &str) -> Result<(), PlatformError> {
        self.policy.run("stop", || self.inner.stop(ad_id)).await
    }

    async fn resume(&self, ad_id: &str) -> Result<(), PlatformError> {
        self.policy.run("resume", || self.inner.resume(ad_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyController {
        failures_left: AtomicU32,
        error: PlatformError,
        calls: AtomicU32,
    }

    impl FlakyController {
        fn new(failures: u32, error: PlatformError) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                error,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl AdController for FlakyController {
        async fn stop(&self, _ad_id: &str) -> Result<(), PlatformError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok(())
        }

        async fn resume(&self, _ad_id: &str) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    fn rate_limited() -> PlatformError {
        PlatformError::RateLimited {
            retry_after_ms: None,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::from(&RetryConfig::default())
        };
        for _ in 0..50 {
            let ms = policy.backoff_for_attempt(0).as_millis() as u64;
            assert!((375..=625).contains(&ms), "jittered backoff {ms}ms out of band");
        }
    }

    #[tokio::test]
    async fn test_retries_rate_limit_then_succeeds() {
        let inner = Arc::new(FlakyController::new(2, rate_limited()));
        let wrapped = RateLimitRetry::new(inner.clone(), RetryPolicy::immediate(3));
        wrapped.stop("ad-1").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let inner = Arc::new(FlakyController::new(
            5,
            PlatformError::Transport("connection reset".into()),
        ));
        let wrapped = RateLimitRetry::new(inner.clone(), RetryPolicy::immediate(3));
        let err = wrapped.stop("ad-1").await.unwrap_err();
        assert!(matches!(err, PlatformError::Transport(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let inner = Arc::new(FlakyController::new(10, rate_limited()));
        let wrapped = RateLimitRetry::new(inner.clone(), RetryPolicy::immediate(2));
        let err = wrapped.stop("ad-1").await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }
}
