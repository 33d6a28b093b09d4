use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use tokenbucket_core::TokenBucket;

fn wait_for_refills(bucket: &TokenBucket, n: u64) {
    let give_up = Instant::now() + Duration::from_secs(5);
    while bucket.refills() < n {
        assert!(Instant::now() < give_up, "no refill observed");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn concurrent_callers_get_exactly_capacity() {
    const CALLERS: usize = 400;
    const CAPACITY: u32 = 137;
    let bucket = Arc::new(TokenBucket::with_refill_secs(CAPACITY, 3600).unwrap());
    let barrier = Arc::new(Barrier::new(CALLERS));
    let granted = Arc::new(AtomicUsize::new(0));
    let denied = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let bucket = bucket.clone();
            let barrier = barrier.clone();
            let granted = granted.clone();
            let denied = denied.clone();
            thread::spawn(move || {
                barrier.wait();
                if bucket.try_acquire() {
                    granted.fetch_add(1, Ordering::Relaxed);
                } else {
                    denied.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(granted.load(Ordering::Relaxed), CAPACITY as usize);
    assert_eq!(denied.load(Ordering::Relaxed), CALLERS - CAPACITY as usize);
    assert_eq!(bucket.available(), 0);
    Arc::try_unwrap(bucket).unwrap().shutdown();
}

#[test]
fn hammering_threads_never_overdraw() {
    let bucket = Arc::new(TokenBucket::with_refill_secs(1000, 3600).unwrap());
    let granted = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let bucket = bucket.clone();
            let granted = granted.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    if bucket.try_acquire() {
                        granted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(granted.load(Ordering::Relaxed), 1000);
}

#[test]
fn three_then_refill_then_three() {
    let bucket = TokenBucket::new(3, Duration::from_millis(300)).unwrap();
    assert!(bucket.try_acquire());
    assert!(bucket.try_acquire());
    assert!(bucket.try_acquire());
    assert!(!bucket.try_acquire());

    wait_for_refills(&bucket, 1);
    assert!(bucket.try_acquire());
    assert!(bucket.try_acquire());
    assert!(bucket.try_acquire());
    assert!(!bucket.try_acquire());
    bucket.shutdown();
}

#[test]
fn waiting_a_full_period_refills() {
    let bucket = TokenBucket::new(2, Duration::from_millis(100)).unwrap();
    assert!(bucket.try_acquire());
    assert!(bucket.try_acquire());
    assert!(!bucket.try_acquire());
    wait_for_refills(&bucket, 1);
    assert!(bucket.try_acquire());
}

#[test]
fn construct_and_shutdown_without_use() {
    let started = Instant::now();
    for _ in 0..50 {
        TokenBucket::with_refill_secs(10, 60).unwrap().shutdown();
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}
