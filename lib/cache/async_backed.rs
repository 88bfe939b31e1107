//! Concurrent deduplication cache for fallible async computations.
//!
//! Given a key and an async factory, ensures at most one factory runs per key at a time.
//! Callers that arrive while a computation is in flight await it via a [`Shared`] future and
//! receive a clone of its outcome, error included. Successes are kept; failures are dropped so
//! the next caller retries.
//!
//! Note that this cache does not support automatic eviction.

use std::panic::AssertUnwindSafe;
use std::{fmt::Debug, future::Future, hash::Hash, pin::Pin};

use futures::FutureExt as _;
use futures::future::Shared;

type SharedFut<V, E> = Shared<Pin<Box<dyn Future<Output = Option<Result<V, E>>> + Send>>>;

/// Two-state slot: `InFlight` while a factory future is running, then promoted to `Ready` once
/// the future completes successfully.
///
/// The `InFlight` variant yields `None` when the factory panicked (caught by `catch_unwind`).
enum Slot<V: Clone + Send + 'static, E: Clone + Send + 'static> {
    InFlight(SharedFut<V, E>),
    Ready(V),
}

/// Deduplicating async cache.
///
/// If [`get_or_try_init`](Self::get_or_try_init) is called concurrently for the same key, only
/// one invocation of the factory runs. All callers receive a clone of the result.
pub struct FutureBackedCache<K, V: Clone + Send + 'static, E: Clone + Send + 'static> {
    map: scc::HashMap<K, Slot<V, E>>,
}

impl<K, V, E> Default for FutureBackedCache<K, V, E>
where
    K: Eq + Hash,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self {
            map: scc::HashMap::default(),
        }
    }
}

impl<K, V, E> FutureBackedCache<K, V, E>
where
    K: Eq + Hash + Debug + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Get the cached value for `key`, or compute it by running `factory`.
    ///
    /// If another caller is already computing the value for this key, this awaits the in-flight
    /// computation instead of starting a duplicate, and shares its error if it fails. A failed
    /// computation is not cached.
    ///
    /// # Panics
    ///
    /// Panics if the factory this caller joined panicked.
    pub async fn get_or_try_init<F, Fut>(&self, key: K, factory: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let existing = self
            .map
            .read_async(&key, |_, slot| match slot {
                Slot::Ready(v) => Ok(v.clone()),
                Slot::InFlight(shared) => Err(shared.clone()),
            })
            .await;

        match existing {
            Some(Ok(v)) => return Ok(v),
            Some(Err(shared)) => {
                if let Some(outcome) = self.await_shared(&key, shared).await {
                    return outcome;
                }
                // Factory panicked; entry removed. Fall through to re-insert below.
            }
            None => {}
        }

        let shared = match self.map.entry_async(key.clone()).await {
            scc::hash_map::Entry::Occupied(occ) => match occ.get() {
                Slot::Ready(v) => return Ok(v.clone()),
                Slot::InFlight(shared) => shared.clone(),
            },
            scc::hash_map::Entry::Vacant(vac) => {
                let shared = Self::make_shared(factory);
                let ret = shared.clone();
                vac.insert_entry(Slot::InFlight(shared));
                ret
            }
        };

        match self.await_shared(&key, shared).await {
            Some(outcome) => outcome,
            None => panic!("FutureBackedCache: factory panicked for key {key:?}"),
        }
    }

    /// Get the value for `key` if it is ready. Does not wait on in-flight computations.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<V> {
        self.map
            .read_sync(key, |_, slot| match slot {
                Slot::Ready(v) => Some(v.clone()),
                Slot::InFlight(_) => None,
            })
            .flatten()
    }

    /// Whether `key` has a ready value.
    #[must_use]
    pub fn contains_ready(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    /// Remove a ready value for `key` if `pred` accepts it. In-flight entries are left alone.
    pub fn remove_ready_if(&self, key: &K, pred: impl FnOnce(&V) -> bool) -> bool {
        self.map
            .remove_if_sync(key, |slot| match slot {
                Slot::Ready(v) => pred(v),
                Slot::InFlight(_) => false,
            })
            .is_some()
    }

    /// Drop every entry. Callers already awaiting an in-flight computation still get its result.
    pub fn clear(&self) {
        self.map.clear_sync();
    }

    /// Await a `Shared` future and settle its slot.
    ///
    /// Success promotes the slot to `Ready`; failure or panic removes it. Only the slot holding
    /// this very future is touched, so a newer computation for the same key is never clobbered.
    /// Returns `None` if the factory panicked.
    async fn await_shared(&self, key: &K, shared: SharedFut<V, E>) -> Option<Result<V, E>> {
        let mut guard = PromoteGuard {
            map: &self.map,
            key,
            shared: shared.clone(),
            value: None,
        };

        let result = shared.clone().await;

        match result {
            Some(Ok(v)) => {
                guard.value = Some(v.clone());
                self.map
                    .update_async(key, |_, slot| {
                        if matches!(slot, Slot::InFlight(s) if s.ptr_eq(&shared)) {
                            *slot = Slot::Ready(v.clone());
                        }
                    })
                    .await;
                guard.value = None;
                Some(Ok(v))
            }
            other => {
                drop(self.map.remove_if_sync(
                    key,
                    |slot| matches!(slot, Slot::InFlight(s) if s.ptr_eq(&shared)),
                ));
                other
            }
        }
    }

    /// Wrap a factory future in `catch_unwind`, producing a `Shared` that yields `None` on panic.
    fn make_shared<F, Fut>(factory: F) -> SharedFut<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let fut = AssertUnwindSafe(factory()).catch_unwind();
        let boxed: Pin<Box<dyn Future<Output = Option<Result<V, E>>> + Send>> =
            Box::pin(async move { fut.await.ok() });
        boxed.shared()
    }

    /// Returns the number of entries in the cache (both `Ready` and `InFlight`).
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the cache contains no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Drop guard that synchronously promotes an `InFlight` entry to `Ready` if the caller
/// is cancelled between `shared.await` completing and the async promotion running.
///
/// Set `value = None` to defuse after successful promotion.
struct PromoteGuard<'a, K, V, E>
where
    K: Eq + Hash,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    map: &'a scc::HashMap<K, Slot<V, E>>,
    key: &'a K,
    shared: SharedFut<V, E>,
    value: Option<V>,
}

impl<K, V, E> Drop for PromoteGuard<'_, K, V, E>
where
    K: Eq + Hash,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(v) = self.value.take() {
            let shared = &self.shared;
            self.map.update_sync(self.key, |_, slot| {
                if matches!(slot, Slot::InFlight(s) if s.ptr_eq(shared)) {
                    *slot = Slot::Ready(v);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_share_one_failure() {
        let cache: Arc<FutureBackedCache<u64, u64, String>> = Arc::new(FutureBackedCache::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            set.spawn(async move {
                cache
                    .get_or_try_init(1, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err::<u64, _>("boom".to_owned())
                    })
                    .await
            });
        }
        while let Some(res) = set.join_next().await {
            assert_eq!(res.unwrap(), Err("boom".to_owned()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn failure_is_retried() {
        let cache: FutureBackedCache<u64, u64, String> = FutureBackedCache::default();
        let first = cache
            .get_or_try_init(1, || async { Err("nope".to_owned()) })
            .await;
        assert!(first.is_err());
        let second = cache.get_or_try_init(1, || async { Ok(7) }).await;
        assert_eq!(second, Ok(7));
        assert_eq!(cache.peek(&1), Some(7));
    }

    #[tokio::test]
    async fn remove_ready_if_respects_predicate() {
        let cache: FutureBackedCache<u64, u64, String> = FutureBackedCache::default();
        cache.get_or_try_init(1, || async { Ok(5) }).await.unwrap();
        assert!(!cache.remove_ready_if(&1, |v| *v == 6));
        assert!(cache.remove_ready_if(&1, |v| *v == 5));
        assert!(!cache.contains_ready(&1));
    }
}
