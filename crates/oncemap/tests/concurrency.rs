//! Concurrency behavior of the cache: build coalescing, parallel builds for
//! distinct keys, visibility of in-flight builds, and failure handling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use anyhow::bail;
use oncemap::Cache;

fn sigma(n: u32) -> u32 {
    (1..=n).sum()
}

#[test]
fn concurrent_callers_coalesce_into_one_build() {
    let builds = Arc::new(AtomicUsize::new(0));
    let builds_ = Arc::clone(&builds);
    let cache: Cache<u32, u32> = Cache::new(move |n| {
        builds_.fetch_add(1, Ordering::SeqCst);
        // Slow enough that every caller below arrives while it is in flight.
        thread::sleep(Duration::from_millis(100));
        Ok(sigma(*n))
    });

    let created = Arc::new(AtomicUsize::new(0));
    let created_ = Arc::clone(&created);
    cache.on_created(move |_, _| {
        created_.fetch_add(1, Ordering::SeqCst);
    });

    thread::scope(|scope| {
        for _ in 0..10 {
            scope.spawn(|| {
                assert_eq!(*cache.get_or_create(10).unwrap(), 55);
            });
        }
    });

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 1);
}

#[test]
fn distinct_keys_fail_independently() {
    let cache: Cache<u32, u32> = Cache::new(|_| bail!("nope"));

    let failed = Arc::new(AtomicUsize::new(0));
    let failed_ = Arc::clone(&failed);
    cache.on_failed(move |_, _| {
        failed_.fetch_add(1, Ordering::SeqCst);
    });

    let cache = &cache;
    thread::scope(|scope| {
        for key in 0..10 {
            scope.spawn(move || {
                assert!(cache.get_or_create(key).is_none());
            });
        }
    });

    assert_eq!(failed.load(Ordering::SeqCst), 10);
    assert_eq!(cache.len(), 0);
}

#[test]
fn distinct_keys_build_in_parallel() {
    const CONCURRENCY: usize = 4;

    // Every factory invocation waits for all the others, so this test can
    // only pass if no cache-internal lock serializes unrelated builds.
    let rendezvous = Arc::new(Barrier::new(CONCURRENCY));
    let rendezvous_ = Arc::clone(&rendezvous);
    let cache: Cache<u32, u32> = Cache::new(move |n| {
        rendezvous_.wait();
        Ok(sigma(*n))
    });

    let cache = &cache;
    thread::scope(|scope| {
        for key in 0..CONCURRENCY as u32 {
            scope.spawn(move || {
                assert_eq!(*cache.get_or_create(key).unwrap(), sigma(key));
            });
        }
    });

    assert_eq!(cache.len(), CONCURRENCY);
}

#[test]
fn in_flight_build_is_invisible() {
    let (started_tx, started_rx) = mpsc::channel();
    let release = Arc::new(Barrier::new(2));

    let release_ = Arc::clone(&release);
    let cache: Cache<u32, u32> = Cache::new(move |n| {
        started_tx.send(()).unwrap();
        release_.wait();
        Ok(sigma(*n))
    });

    thread::scope(|scope| {
        scope.spawn(|| {
            assert_eq!(*cache.get_or_create(10).unwrap(), 55);
        });

        // The build is now in flight; the pending slot must not be observable.
        started_rx.recv().unwrap();
        assert_eq!(cache.len(), 0);
        assert!(!cache.contains(&10));
        assert!(cache.get(&10).is_none());

        release.wait();
    });

    assert_eq!(cache.len(), 1);
    assert_eq!(*cache.get(&10).unwrap(), 55);
}

#[test]
fn waiters_observe_a_coalesced_failure() {
    let builds = Arc::new(AtomicUsize::new(0));
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let builds_ = Arc::clone(&builds);
    // `mpsc::Receiver` is not `Sync`; the factory must be, so the receiver
    // lives behind a mutex. Only the one builder thread ever reaches it.
    let release_rx = Mutex::new(release_rx);
    let cache: Cache<u32, u32> = Cache::new(move |_| {
        builds_.fetch_add(1, Ordering::SeqCst);
        started_tx.send(()).unwrap();
        release_rx.lock().unwrap().recv().unwrap();
        bail!("broken")
    });

    let failed = Arc::new(AtomicUsize::new(0));
    let failed_ = Arc::clone(&failed);
    cache.on_failed(move |_, err| {
        assert_eq!(err.to_string(), "broken");
        failed_.fetch_add(1, Ordering::SeqCst);
    });

    thread::scope(|scope| {
        scope.spawn(|| {
            assert!(cache.get_or_create(10).is_none());
        });

        started_rx.recv().unwrap();
        let waiter = scope.spawn(|| {
            assert!(cache.get_or_create(10).is_none());
        });

        // Give the waiter time to block on the in-flight build before the
        // builder is released to fail.
        thread::sleep(Duration::from_millis(200));
        release_tx.send(()).unwrap();
        waiter.join().unwrap();
    });

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(failed.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 0);
}

#[test]
fn panicking_factory_releases_waiters_and_leaves_no_trace() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_ = Arc::clone(&attempts);
    let cache: Arc<Cache<u32, u32>> = Arc::new(Cache::new(move |n| {
        if attempts_.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("factory exploded");
        }
        Ok(sigma(*n))
    }));

    let builder = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || cache.get_or_create(10))
    };
    let waiter = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cache.get_or_create(10)
        })
    };

    assert!(builder.join().is_err());

    // The waiter either observed the aborted build as a failure or became
    // the builder of a fresh, successful attempt itself.
    match waiter.join().unwrap() {
        Some(value) => assert_eq!(*value, 55),
        None => assert!(!cache.contains(&10)),
    }

    // No pending slot survived the panic; the key is buildable again.
    assert_eq!(*cache.get_or_create(10).unwrap(), 55);
}
