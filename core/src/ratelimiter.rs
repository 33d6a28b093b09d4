//! Token bucket refilled to full capacity by a dedicated background thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::error::BucketError;

struct State {
    tokens: u32,
    stop: bool,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    capacity: u32,
    refill_period: Duration,
    refills: AtomicU64,
}

/// Non-blocking token bucket. Each `try_acquire` takes one token if any are
/// left; a background thread resets the count to `capacity` once per period.
///
/// The refill thread lives exactly as long as the bucket: it is joined by
/// [`TokenBucket::shutdown`], or by `Drop` if the bucket simply goes out of scope.
pub struct TokenBucket {
    shared: Arc<Shared>,
    refiller: Option<JoinHandle<()>>,
}

impl TokenBucket {
    /// Start a full bucket. Zero capacity or a zero period is rejected.
    pub fn new(capacity: u32, refill_period: Duration) -> Result<Self, BucketError> {
        if capacity == 0 {
            return Err(BucketError::ZeroCapacity);
        }
        if refill_period.is_zero() {
            return Err(BucketError::ZeroRefillPeriod);
        }
        let shared = Arc::new(Shared {
            state: Mutex::new(State { tokens: capacity, stop: false }),
            wake: Condvar::new(),
            capacity,
            refill_period,
            refills: AtomicU64::new(0),
        });
        let shared_bg = shared.clone();
        let refiller = thread::Builder::new()
            .name("tokenbucket-refill".into())
            .spawn(move || refill_loop(&shared_bg))
            .map_err(BucketError::Spawn)?;
        debug!(capacity, refill_period = ?refill_period, "token bucket started");
        Ok(TokenBucket { shared, refiller: Some(refiller) })
    }

    /// Same as [`TokenBucket::new`] with the period given in whole seconds.
    pub fn with_refill_secs(capacity: u32, refill_secs: u64) -> Result<Self, BucketError> {
        Self::new(capacity, Duration::from_secs(refill_secs))
    }

    /// Take one token if available. Never waits for a refill.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }

    pub fn capacity(&self) -> u32 { self.shared.capacity }

    pub fn refill_period(&self) -> Duration { self.shared.refill_period }

    /// Tokens left right now. Only a snapshot; it may change before the caller acts on it.
    pub fn available(&self) -> u32 { self.shared.state.lock().tokens }

    /// Number of refills performed so far.
    pub fn refills(&self) -> u64 { self.shared.refills.load(Ordering::Acquire) }

    /// Stop the refill thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.refiller.take() else { return };
        self.shared.state.lock().stop = true;
        self.shared.wake.notify_one();
        if handle.join().is_err() {
            error!("refill thread panicked");
        }
        debug!(refills = self.refills(), "token bucket stopped");
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.shared.capacity)
            .field("available", &self.available())
            .field("refill_period", &self.shared.refill_period)
            .finish()
    }
}

fn refill_loop(shared: &Shared) {
    let period = shared.refill_period;
    // None when the period is too large to represent as an Instant; then only stop wakes us.
    let mut deadline = Instant::now().checked_add(period);
    loop {
        let mut state = shared.state.lock();
        while !state.stop {
            match deadline {
                Some(at) => {
                    if shared.wake.wait_until(&mut state, at).timed_out() {
                        break;
                    }
                }
                None => shared.wake.wait(&mut state),
            }
        }
        if state.stop {
            return;
        }
        state.tokens = shared.capacity;
        drop(state);

        let refills = shared.refills.fetch_add(1, Ordering::AcqRel) + 1;
        info!(capacity = shared.capacity, refills, "bucket refilled");

        deadline = next_deadline(deadline, period, Instant::now());
    }
}

/// Stay on the original schedule; if we fell behind or the schedule overflows, restart it from now.
fn next_deadline(prev: Option<Instant>, period: Duration, now: Instant) -> Option<Instant> {
    prev.and_then(|at| at.checked_add(period))
        .filter(|at| *at > now)
        .or_else(|| now.checked_add(period))
}
