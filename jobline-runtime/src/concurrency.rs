//! Concurrency control for partition execution

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps how many partitions of one step run at once.
///
/// Cloned into every spawned partition task; all clones share one semaphore.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ConcurrencyLimiter {
    /// Create a new concurrency limiter
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Wait for a slot; the slot is released when the permit drops
    #[tracing::instrument(
        name = "concurrency.acquire",
        skip(self),
        fields(
            max_concurrent = %self.max_concurrent,
            available_before = tracing::field::Empty,
            wait_duration_ms = tracing::field::Empty,
        )
    )]
    pub async fn acquire(&self) -> crate::Result<OwnedSemaphorePermit> {
        let span = tracing::Span::current();
        span.record("available_before", self.semaphore.available_permits());

        let start = Instant::now();
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| crate::Error::Internal("partition limiter closed".to_string()))?;

        span.record("wait_duration_ms", start.elapsed().as_millis() as u64);
        Ok(permit)
    }

    /// Stop handing out slots; pending and future `acquire` calls fail
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Get the maximum concurrent partitions
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Get the current available permits
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrency_limiter() {
        let limiter = ConcurrencyLimiter::new(2);
        assert_eq!(limiter.available(), 2);

        let _permit1 = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available(), 1);

        let permit2 = limiter.clone().acquire().await.unwrap();
        assert_eq!(limiter.available(), 0);

        drop(permit2);
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn test_closed_limiter_rejects() {
        let limiter = ConcurrencyLimiter::new(1);
        limiter.close();
        assert!(limiter.acquire().await.is_err());
    }

    #[test]
    fn test_zero_is_clamped() {
        assert_eq!(ConcurrencyLimiter::new(0).max_concurrent(), 1);
    }
}
