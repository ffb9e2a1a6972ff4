//! Time source for retry delays.

use async_trait::async_trait;
use std::time::Duration;

/// Sleeps between retry attempts. Injected so tests can observe delays
/// without waiting for them.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// `tokio::time` backed clock
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}
