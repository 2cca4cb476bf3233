// Clock abstraction for readiness polling
use async_trait::async_trait;
use std::time::{Duration, Instant};

/// Trait for abstracting time operations to enable testing
#[async_trait]
pub trait Clock: Send + Sync {
    /// Get the current instant
    fn now(&self) -> Instant;

    /// Sleep for the given duration
    async fn sleep(&self, duration: Duration);
}

/// System clock backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
