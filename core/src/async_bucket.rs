//! Token bucket whose refill runs as a tokio task instead of an OS thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::error::BucketError;

struct Shared {
    tokens: Mutex<u32>,
    capacity: u32,
    refill_period: Duration,
    refills: AtomicU64,
}

/// Async flavour of [`crate::TokenBucket`]. Must be created inside a tokio runtime;
/// outside one, `new` returns [`BucketError::NoRuntime`].
pub struct AsyncTokenBucket {
    shared: Arc<Shared>,
    stop_tx: Option<oneshot::Sender<()>>,
    refiller: JoinHandle<()>,
}

impl AsyncTokenBucket {
    pub fn new(capacity: u32, refill_period: Duration) -> Result<Self, BucketError> {
        if capacity == 0 {
            return Err(BucketError::ZeroCapacity);
        }
        if refill_period.is_zero() {
            return Err(BucketError::ZeroRefillPeriod);
        }
        let runtime = Handle::try_current().map_err(|_| BucketError::NoRuntime)?;
        let shared = Arc::new(Shared {
            tokens: Mutex::new(capacity),
            capacity,
            refill_period,
            refills: AtomicU64::new(0),
        });
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let shared_bg = shared.clone();
        // Refill in a background task; a send or a dropped sender both end it.
        let refiller = runtime.spawn(async move {
            let start = Instant::now().checked_add(refill_period).unwrap_or_else(far_future);
            let mut t = interval_at(start, refill_period);
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = t.tick() => {
                        *shared_bg.tokens.lock() = shared_bg.capacity;
                        let refills = shared_bg.refills.fetch_add(1, Ordering::AcqRel) + 1;
                        info!(capacity = shared_bg.capacity, refills, "bucket refilled");
                    }
                }
            }
        });
        debug!(capacity, refill_period = ?refill_period, "async token bucket started");
        Ok(AsyncTokenBucket { shared, stop_tx: Some(stop_tx), refiller })
    }

    pub fn try_acquire(&self) -> bool {
        let mut tokens = self.shared.tokens.lock();
        if *tokens > 0 {
            *tokens -= 1;
            true
        } else {
            false
        }
    }

    pub fn capacity(&self) -> u32 { self.shared.capacity }

    pub fn refill_period(&self) -> Duration { self.shared.refill_period }

    pub fn available(&self) -> u32 { *self.shared.tokens.lock() }

    pub fn refills(&self) -> u64 { self.shared.refills.load(Ordering::Acquire) }

    /// Signal the refill task and wait until it has exited.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.refiller).await {
            error!(error = %e, "refill task failed");
        }
        debug!(refills = self.refills(), "async token bucket stopped");
    }
}

fn far_future() -> Instant {
    // Roughly 30 years out.
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_invalid_parameters() {
        assert!(matches!(AsyncTokenBucket::new(0, Duration::from_secs(1)), Err(BucketError::ZeroCapacity)));
        assert!(matches!(AsyncTokenBucket::new(2, Duration::ZERO), Err(BucketError::ZeroRefillPeriod)));
    }

    #[test]
    fn new_outside_runtime_is_an_error() {
        assert!(matches!(AsyncTokenBucket::new(3, Duration::from_secs(1)), Err(BucketError::NoRuntime)));
    }

    #[tokio::test(start_paused = true)]
    async fn three_then_refill_then_three() {
        let b = AsyncTokenBucket::new(3, Duration::from_secs(1)).unwrap();
        for _ in 0..3 {
            assert!(b.try_acquire());
        }
        assert!(!b.try_acquire());
        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(b.refills(), 1);
        for _ in 0..3 {
            assert!(b.try_acquire());
        }
        assert!(!b.try_acquire());
        b.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_refill_before_period() {
        let b = AsyncTokenBucket::new(1, Duration::from_secs(10)).unwrap();
        assert!(b.try_acquire());
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!b.try_acquire());
        assert_eq!(b.refills(), 0);
        b.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_refills() {
        let b = AsyncTokenBucket::new(1, Duration::from_secs(1)).unwrap();
        let shared = b.shared.clone();
        b.shutdown().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(shared.refills.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn dropping_ends_the_task() {
        let b = AsyncTokenBucket::new(1, Duration::from_secs(3600)).unwrap();
        let shared = b.shared.clone();
        drop(b);
        for _ in 0..100 {
            if Arc::strong_count(&shared) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("refill task still holds the bucket");
    }
}
