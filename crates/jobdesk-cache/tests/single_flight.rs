//! Concurrency behaviour of the single-flight cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Notify;

use jobdesk_cache::{CacheError, EntryState, SingleFlightCache};

#[derive(Debug)]
struct RemoteError(String);

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "remote error: {}", self.0)
    }
}

type Cache = SingleFlightCache<u64, RemoteError>;

/// Producer that sleeps and then returns `value`, counting invocations.
fn slow_producer(
    calls: &Arc<AtomicUsize>,
    value: Result<u64, &'static str>,
) -> impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = Result<u64, RemoteError>> + Send>> {
    let calls = Arc::clone(calls);
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            value.map_err(|e| RemoteError(e.to_string()))
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_callers_share_one_computation() {
    let cache = Arc::new(Cache::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks = (0..64).map(|_| {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            cache
                .get_or_compute("update-check", None, slow_producer(&calls, Ok(42)))
                .await
        })
    });
    let results = join_all(tasks).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.unwrap().unwrap(), 42);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_callers_share_one_failure_then_retry() {
    let cache = Arc::new(Cache::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks = (0..16).map(|_| {
        let cache = Arc::clone(&cache);
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            cache
                .get_or_compute("update-check", None, slow_producer(&calls, Err("timeout")))
                .await
        })
    });
    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap_err())
        .collect();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let first = match &results[0] {
        CacheError::Producer(e) => Arc::clone(e),
        other => panic!("unexpected {other:?}"),
    };
    for err in &results {
        match err {
            CacheError::Producer(e) => assert!(Arc::ptr_eq(e, &first)),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(first.0, "timeout");

    // Failures are not cached: the next call runs the producer again.
    let value = cache
        .get_or_compute("update-check", None, slow_producer(&calls, Ok(1)))
        .await
        .unwrap();
    assert_eq!(value, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn burst_after_expiry_recomputes_once() {
    let cache = Arc::new(Cache::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let ttl = Some(Duration::from_secs(600));

    cache
        .get_or_compute("update-check", ttl, slow_producer(&calls, Ok(1)))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(601)).await;

    let callers = (0..20).map(|_| {
        cache.get_or_compute("update-check", ttl, slow_producer(&calls, Ok(2)))
    });
    let results = join_all(callers).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(results.into_iter().all(|r| r.unwrap() == 2));
}

#[tokio::test]
async fn dropped_waiter_does_not_cancel_producer() {
    let cache = Arc::new(Cache::new());
    let release = Arc::new(Notify::new());
    let finished = Arc::new(AtomicUsize::new(0));

    let producer = {
        let release = Arc::clone(&release);
        let finished = Arc::clone(&finished);
        move || async move {
            release.notified().await;
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(9)
        }
    };

    // The owning caller gives up almost immediately.
    let owner = tokio::time::timeout(
        Duration::from_millis(10),
        cache.get_or_compute("k", None, producer),
    )
    .await;
    assert!(owner.is_err());
    assert_eq!(cache.state("k"), EntryState::InFlight);

    // A second caller joins the same computation.
    let joiner = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            cache
                .get_or_compute("k", None, || async { Ok(0) })
                .await
        })
    };
    tokio::task::yield_now().await;
    release.notify_one();

    assert_eq!(joiner.await.unwrap().unwrap(), 9);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(cache.state("k"), EntryState::Populated);
}

#[tokio::test]
async fn invalidate_during_flight_does_not_repopulate() {
    let cache = Arc::new(Cache::new());
    let release = Arc::new(Notify::new());

    let waiter = {
        let cache = Arc::clone(&cache);
        let release = Arc::clone(&release);
        tokio::spawn(async move {
            cache
                .get_or_compute("k", None, move || async move {
                    release.notified().await;
                    Ok(1)
                })
                .await
        })
    };

    while cache.state("k") != EntryState::InFlight {
        tokio::task::yield_now().await;
    }
    cache.invalidate("k");
    assert_eq!(cache.state("k"), EntryState::Empty);

    release.notify_one();
    // The original waiter still gets its value.
    assert_eq!(waiter.await.unwrap().unwrap(), 1);
    // But the stale computation did not populate the entry.
    assert_eq!(cache.state("k"), EntryState::Empty);

    let calls = Arc::new(AtomicUsize::new(0));
    let value = cache
        .get_or_compute("k", None, slow_producer(&calls, Ok(2)))
        .await
        .unwrap();
    assert_eq!(value, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panicking_producer_abandons_waiters() {
    let cache = Cache::new();

    let err = cache
        .get_or_compute("k", None, || async {
            if true {
                panic!("producer bug");
            }
            Ok(0)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Abandoned));
    assert_eq!(cache.state("k"), EntryState::Empty);

    let value = cache.get_or_compute("k", None, || async { Ok(5) }).await;
    assert_eq!(value.unwrap(), 5);
}
