//! Single-flight memoizing cache.
//!
//! Each key is in one of these states:
//! - absent (empty, never computed or invalidated)
//! - in flight (a producer is running; waiters hold a watch receiver)
//! - populated (value, timestamp, optional TTL)
//! - failed (only under [`FailurePolicy::CacheFor`])
//!
//! The transition out of the empty or expired state happens under the map's
//! entry lock, so exactly one caller starts the producer for a key. The
//! producer runs in its own task and is never cancelled by a waiter going away.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::CacheError;

type Outcome<V, E> = Result<V, CacheError<E>>;

/// What to do with an entry when its producer fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Revert to empty so the next caller retries.
    #[default]
    DoNotCache,
    /// Serve the failure to callers for the given duration.
    CacheFor(Duration),
}

/// Observable state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Empty,
    InFlight,
    Populated,
    /// Populated but past its TTL; the next access recomputes.
    Expired,
    Failed,
}

enum Slot<V, E> {
    InFlight {
        generation: u64,
        rx: watch::Receiver<Option<Outcome<V, E>>>,
    },
    Populated {
        value: V,
        stored_at: Instant,
        ttl: Option<Duration>,
    },
    Failed {
        error: Arc<E>,
        stored_at: Instant,
        ttl: Duration,
    },
}

fn is_expired(stored_at: Instant, ttl: Option<Duration>, now: Instant) -> bool {
    ttl.is_some_and(|ttl| now.saturating_duration_since(stored_at) >= ttl)
}

/// Result of inspecting a key under the entry lock.
enum Lookup<V, E> {
    Hit(Outcome<V, E>),
    Wait(watch::Receiver<Option<Outcome<V, E>>>),
    Claimed {
        generation: u64,
        tx: watch::Sender<Option<Outcome<V, E>>>,
        rx: watch::Receiver<Option<Outcome<V, E>>>,
    },
}

/// Memoizing cache where concurrent requests for a key share one computation.
pub struct SingleFlightCache<V, E> {
    entries: Arc<DashMap<String, Slot<V, E>>>,
    generation: AtomicU64,
    failure_policy: FailurePolicy,
}

impl<V, E> Default for SingleFlightCache<V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E> SingleFlightCache<V, E> {
    /// Create a cache that does not cache failures.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Force `key` back to empty.
    ///
    /// A computation already in flight keeps running and its waiters still get
    /// its result, but it will not populate the entry when it finishes.
    pub fn invalidate(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            debug!(key, "invalidated cache entry");
        }
    }

    /// Force every key back to empty.
    pub fn invalidate_all(&self) {
        self.entries.clear();
        debug!("invalidated all cache entries");
    }

    pub fn state(&self, key: &str) -> EntryState {
        let now = Instant::now();
        match self.entries.get(key).as_deref() {
            None => EntryState::Empty,
            Some(Slot::InFlight { .. }) => EntryState::InFlight,
            Some(Slot::Populated { stored_at, ttl, .. }) => {
                if is_expired(*stored_at, *ttl, now) {
                    EntryState::Expired
                } else {
                    EntryState::Populated
                }
            }
            Some(Slot::Failed { stored_at, ttl, .. }) => {
                if is_expired(*stored_at, Some(*ttl), now) {
                    EntryState::Expired
                } else {
                    EntryState::Failed
                }
            }
        }
    }

    /// Number of keys that are not empty.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V, E> SingleFlightCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Return the cached value for `key`, or compute it with `producer`.
    ///
    /// `ttl` of `None` caches the value until it is invalidated. The producer is
    /// only called by the one caller that finds the key empty or expired; every
    /// other concurrent caller waits for that computation.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<V, CacheError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let rx = match self.join_or_claim(key) {
            Lookup::Hit(outcome) => {
                trace!(key, "cache hit");
                return outcome;
            }
            Lookup::Wait(rx) => {
                trace!(key, "joining in-flight computation");
                rx
            }
            Lookup::Claimed { generation, tx, rx } => {
                debug!(key, generation, "cache miss, starting computation");
                self.spawn_producer(key.to_string(), generation, ttl, tx, producer());
                rx
            }
        };

        wait_for_outcome(rx).await
    }

    fn join_or_claim(&self, key: &str) -> Lookup<V, E> {
        let now = Instant::now();

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                match entry.get() {
                    Slot::Populated {
                        value,
                        stored_at,
                        ttl,
                    } if !is_expired(*stored_at, *ttl, now) => {
                        return Lookup::Hit(Ok(value.clone()));
                    }
                    Slot::Failed {
                        error,
                        stored_at,
                        ttl,
                    } if !is_expired(*stored_at, Some(*ttl), now) => {
                        return Lookup::Hit(Err(CacheError::Producer(Arc::clone(error))));
                    }
                    // A closed channel with no value means the owning task was
                    // torn down; start over instead of waiting forever.
                    Slot::InFlight { rx, .. } if rx.has_changed().is_ok() => {
                        return Lookup::Wait(rx.clone());
                    }
                    _ => {}
                }

                let (generation, tx, rx) = self.new_flight();
                entry.insert(Slot::InFlight {
                    generation,
                    rx: rx.clone(),
                });
                Lookup::Claimed { generation, tx, rx }
            }
            Entry::Vacant(entry) => {
                let (generation, tx, rx) = self.new_flight();
                entry.insert(Slot::InFlight {
                    generation,
                    rx: rx.clone(),
                });
                Lookup::Claimed { generation, tx, rx }
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn new_flight(
        &self,
    ) -> (
        u64,
        watch::Sender<Option<Outcome<V, E>>>,
        watch::Receiver<Option<Outcome<V, E>>>,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        (generation, tx, rx)
    }

    fn spawn_producer<Fut>(
        &self,
        key: String,
        generation: u64,
        ttl: Option<Duration>,
        tx: watch::Sender<Option<Outcome<V, E>>>,
        producer: Fut,
    ) where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let entries = Arc::clone(&self.entries);
        let policy = self.failure_policy;

        tokio::spawn(async move {
            let outcome = match tokio::spawn(producer).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => {
                    debug!(key = %key, "producer failed");
                    Err(CacheError::Producer(Arc::new(error)))
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "producer task did not complete");
                    Err(CacheError::Abandoned)
                }
            };

            settle(&entries, key, generation, ttl, policy, &outcome);
            tx.send_replace(Some(outcome));
        });
    }
}

/// Move a finished computation's entry to its next state.
///
/// Does nothing if the entry was invalidated or reclaimed in the meantime.
fn settle<V: Clone, E>(
    entries: &DashMap<String, Slot<V, E>>,
    key: String,
    generation: u64,
    ttl: Option<Duration>,
    policy: FailurePolicy,
    outcome: &Outcome<V, E>,
) {
    let Entry::Occupied(mut entry) = entries.entry(key) else {
        return;
    };
    if !matches!(entry.get(), Slot::InFlight { generation: g, .. } if *g == generation) {
        trace!(key = %entry.key(), generation, "entry changed during computation, not storing");
        return;
    }

    let stored_at = Instant::now();
    match (outcome, policy) {
        (Ok(value), _) => {
            entry.insert(Slot::Populated {
                value: value.clone(),
                stored_at,
                ttl,
            });
        }
        (Err(CacheError::Producer(error)), FailurePolicy::CacheFor(ttl)) => {
            entry.insert(Slot::Failed {
                error: Arc::clone(error),
                stored_at,
                ttl,
            });
        }
        (Err(_), _) => {
            entry.remove();
        }
    }
}

async fn wait_for_outcome<V: Clone, E>(
    mut rx: watch::Receiver<Option<Outcome<V, E>>>,
) -> Outcome<V, E> {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(Err(CacheError::Abandoned)),
        Err(_) => Err(CacheError::Abandoned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, PartialEq, Eq)]
    struct Boom;

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("boom")
        }
    }

    fn counted<T: Send + 'static>(
        counter: &Arc<AtomicUsize>,
        result: T,
    ) -> impl FnOnce() -> std::future::Ready<T> {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(result)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_calls_hit_cache() {
        let cache: SingleFlightCache<bool, Boom> = SingleFlightCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Some(Duration::from_secs(600));

        let first = cache
            .get_or_compute("update-check", ttl, counted(&calls, Ok(true)))
            .await;
        let second = cache
            .get_or_compute("update-check", ttl, counted(&calls, Ok(false)))
            .await;

        assert_eq!(first.unwrap(), true);
        assert_eq!(second.unwrap(), true);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.state("update-check"), EntryState::Populated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_recomputes() {
        let cache: SingleFlightCache<u32, Boom> = SingleFlightCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Some(Duration::from_secs(10));

        cache.get_or_compute("k", ttl, counted(&calls, Ok(1))).await.unwrap();
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.state("k"), EntryState::Populated);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.state("k"), EntryState::Expired);

        let value = cache.get_or_compute("k", ttl, counted(&calls, Ok(2))).await;
        assert_eq!(value.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ttl_caches_until_invalidated() {
        let cache: SingleFlightCache<u32, Boom> = SingleFlightCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get_or_compute("k", None, counted(&calls, Ok(1))).await.unwrap();
        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        let value = cache.get_or_compute("k", None, counted(&calls, Ok(2))).await;

        assert_eq!(value.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let cache: SingleFlightCache<u32, Boom> = SingleFlightCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Some(Duration::from_secs(600));

        cache.get_or_compute("k", ttl, counted(&calls, Ok(1))).await.unwrap();
        cache.invalidate("k");
        assert_eq!(cache.state("k"), EntryState::Empty);

        let value = cache.get_or_compute("k", ttl, counted(&calls, Ok(2))).await;
        assert_eq!(value.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_not_cached_by_default() {
        let cache: SingleFlightCache<u32, Boom> = SingleFlightCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let err = cache
            .get_or_compute("k", None, counted(&calls, Err(Boom)))
            .await
            .unwrap_err();
        assert_eq!(err.producer_error(), Some(&Boom));
        assert_eq!(cache.state("k"), EntryState::Empty);

        let value = cache.get_or_compute("k", None, counted(&calls, Ok(7))).await;
        assert_eq!(value.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_cached_when_configured() {
        let cache: SingleFlightCache<u32, Boom> = SingleFlightCache::new()
            .with_failure_policy(FailurePolicy::CacheFor(Duration::from_secs(30)));
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_compute("k", None, counted(&calls, Err(Boom)))
            .await
            .unwrap_err();
        let second = cache
            .get_or_compute("k", None, counted(&calls, Ok(1)))
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.state("k"), EntryState::Failed);

        // Same error instance is shared
        match (first, second) {
            (CacheError::Producer(a), CacheError::Producer(b)) => assert!(Arc::ptr_eq(&a, &b)),
            other => panic!("unexpected {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        let value = cache.get_or_compute("k", None, counted(&calls, Ok(1))).await;
        assert_eq!(value.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let cache: SingleFlightCache<u32, Boom> = SingleFlightCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get_or_compute("a", None, counted(&calls, Ok(1))).await.unwrap();
        let _ = cache.get_or_compute("b", None, counted(&calls, Err(Boom))).await;

        assert_eq!(cache.state("a"), EntryState::Populated);
        assert_eq!(cache.state("b"), EntryState::Empty);
        assert_eq!(cache.len(), 1);

        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_error_display_is_verbatim() {
        let err: CacheError<Boom> = CacheError::Producer(Arc::new(Boom));
        assert_eq!(err.to_string(), "boom");
        assert!(CacheError::<Boom>::Abandoned.producer_error().is_none());
    }
}
