// Copyright (c) 2024 The framekit developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use foldhash::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{borrow::Borrow, thread, time::Duration};

/// The state of one key in an [`InFlightCache`].
#[derive(Clone, Debug)]
pub(crate) enum CacheEntry<V, E> {
    /// A thread is constructing the value.
    Pending,
    Ready(V),
    /// The last construction failed. Threads that were waiting on it receive the error, later
    /// lookups try again.
    Failed(E),
}

/// How an [`InFlightCache`] lookup was satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Resolution {
    Hit,
    /// Another thread was constructing the value and this one waited for it.
    Waited,
    Constructed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum InFlightError<E> {
    /// The construction failed, either in this thread or in the one it waited on.
    Failed(E),
    /// The value was still pending after the whole retry budget.
    WaitBudgetExhausted { retries: u32 },
}

/// A map where every value is constructed at most once, even when many threads ask for the same
/// key at the same time.
///
/// Keys are looked up by a precomputed hash, then compared in full, so colliding keys live side by
/// side in the same bucket. The lock is only held for lookups and inserts, never while a value is
/// constructed. A thread that finds an entry pending polls it, sleeping `wait_interval` between
/// polls, for at most `wait_retries` polls. Entries are never evicted.
#[derive(Debug)]
pub(crate) struct InFlightCache<K, V, E> {
    inner: Mutex<HashMap<u64, SmallVec<[(K, CacheEntry<V, E>); 1]>>>,
    wait_interval: Duration,
    wait_retries: u32,
}

impl<K, V, E> InFlightCache<K, V, E> {
    pub(crate) fn new(wait_interval: Duration, wait_retries: u32) -> Self {
        InFlightCache {
            inner: Mutex::new(HashMap::default()),
            wait_interval,
            wait_retries,
        }
    }

    /// Returns the number of entries that hold a value.
    pub(crate) fn ready_count(&self) -> usize {
        self.inner
            .lock()
            .values()
            .flatten()
            .filter(|(_, entry)| matches!(entry, CacheEntry::Ready(_)))
            .count()
    }
}

impl<K, V, E> InFlightCache<K, V, E>
where
    K: Clone + Eq,
    V: Clone,
    E: Clone,
{
    /// Returns the value for `key`, if it has been constructed.
    pub(crate) fn get<Q>(&self, hash: u64, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let inner = self.inner.lock();

        match inner
            .get(&hash)?
            .iter()
            .find(|(k, _)| k.borrow() == key)?
        {
            (_, CacheEntry::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Returns the value for `key`. If there is no entry, a pending one is inserted with the key
    /// returned by `make_key`, and `construct` is called without the lock held.
    pub(crate) fn get_or_try_insert<Q>(
        &self,
        hash: u64,
        key: &Q,
        make_key: impl FnOnce() -> K,
        construct: impl FnOnce(&K) -> Result<V, E>,
    ) -> Result<(V, Resolution), InFlightError<E>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut retries = 0;

        let owned_key = loop {
            {
                let mut inner = self.inner.lock();
                let bucket = inner.entry(hash).or_default();

                match bucket.iter_mut().find(|(k, _)| k.borrow() == key) {
                    None => {
                        let owned_key = make_key();
                        bucket.push((owned_key.clone(), CacheEntry::Pending));

                        break owned_key;
                    }
                    Some((_, CacheEntry::Ready(value))) => {
                        let resolution = if retries == 0 {
                            Resolution::Hit
                        } else {
                            Resolution::Waited
                        };

                        return Ok((value.clone(), resolution));
                    }
                    Some((_, CacheEntry::Failed(err))) if retries != 0 => {
                        return Err(InFlightError::Failed(err.clone()));
                    }
                    Some((owned_key, entry @ CacheEntry::Failed(_))) => {
                        *entry = CacheEntry::Pending;

                        break owned_key.clone();
                    }
                    Some((_, CacheEntry::Pending)) => {}
                }
            }

            if retries == self.wait_retries {
                log::error!(
                    "gave up waiting for a cache entry after {} retries",
                    retries,
                );

                return Err(InFlightError::WaitBudgetExhausted { retries });
            }

            retries += 1;

            if retries == self.wait_retries / 2 {
                log::warn!("still waiting for a cache entry after {} retries", retries);
            }

            thread::sleep(self.wait_interval);
        };

        let mut guard = PendingGuard {
            cache: self,
            hash,
            key: owned_key,
            armed: true,
        };
        let result = construct(&guard.key);

        guard.complete(match &result {
            Ok(value) => CacheEntry::Ready(value.clone()),
            Err(err) => CacheEntry::Failed(err.clone()),
        });

        match result {
            Ok(value) => Ok((value, Resolution::Constructed)),
            Err(err) => Err(InFlightError::Failed(err)),
        }
    }

    fn replace(&self, hash: u64, key: &K, entry: Option<CacheEntry<V, E>>) {
        let mut inner = self.inner.lock();
        let bucket = inner.entry(hash).or_default();
        let index = bucket.iter().position(|(k, _)| k == key);

        match (index, entry) {
            (Some(index), Some(entry)) => bucket[index].1 = entry,
            (None, Some(entry)) => bucket.push((key.clone(), entry)),
            (Some(index), None) => {
                bucket.remove(index);
            }
            (None, None) => {}
        }
    }
}

/// Takes the pending entry back out of the cache if construction unwinds, so waiting threads
/// don't spin on it until their budget runs out.
struct PendingGuard<'a, K: Clone + Eq, V: Clone, E: Clone> {
    cache: &'a InFlightCache<K, V, E>,
    hash: u64,
    key: K,
    armed: bool,
}

impl<K: Clone + Eq, V: Clone, E: Clone> PendingGuard<'_, K, V, E> {
    fn complete(&mut self, entry: CacheEntry<V, E>) {
        self.armed = false;
        self.cache.replace(self.hash, &self.key, Some(entry));
    }
}

impl<K: Clone + Eq, V: Clone, E: Clone> Drop for PendingGuard<'_, K, V, E> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.replace(self.hash, &self.key, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Barrier,
    };

    fn cache() -> InFlightCache<String, usize, &'static str> {
        InFlightCache::new(Duration::from_millis(1), 10_000)
    }

    #[test]
    fn constructs_once() {
        let cache = cache();
        let calls = AtomicUsize::new(0);
        let construct = |_: &String| Ok(calls.fetch_add(1, Ordering::SeqCst) + 10);

        let (first, resolution) = cache
            .get_or_try_insert(1, "a", || "a".to_owned(), construct)
            .unwrap();
        assert_eq!((first, resolution), (10, Resolution::Constructed));

        let (second, resolution) = cache
            .get_or_try_insert(1, "a", || "a".to_owned(), construct)
            .unwrap();
        assert_eq!((second, resolution), (10, Resolution::Hit));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(1, "a"), Some(10));
    }

    #[test]
    fn colliding_keys_are_kept_apart() {
        let cache = cache();

        let (a, _) = cache
            .get_or_try_insert(7, "a", || "a".to_owned(), |_| Ok(1))
            .unwrap();
        let (b, _) = cache
            .get_or_try_insert(7, "b", || "b".to_owned(), |_| Ok(2))
            .unwrap();

        assert_eq!((a, b), (1, 2));
        assert_eq!(cache.get(7, "a"), Some(1));
        assert_eq!(cache.get(7, "b"), Some(2));
        assert_eq!(cache.ready_count(), 2);
    }

    #[test]
    fn failure_is_retried_by_later_lookups() {
        let cache = cache();

        let err = cache
            .get_or_try_insert(1, "a", || "a".to_owned(), |_| Err("boom"))
            .unwrap_err();
        assert_eq!(err, InFlightError::Failed("boom"));
        assert_eq!(cache.get(1, "a"), None);

        let (value, resolution) = cache
            .get_or_try_insert(1, "a", || unreachable!(), |_| Ok(3))
            .unwrap();
        assert_eq!((value, resolution), (3, Resolution::Constructed));
    }

    #[test]
    fn waiters_share_one_construction() {
        const THREADS: usize = 8;

        let cache = cache();
        let calls = AtomicUsize::new(0);
        let barrier = Barrier::new(THREADS);

        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cache.get_or_try_insert(
                            3,
                            "shared",
                            || "shared".to_owned(),
                            |_| {
                                thread::sleep(Duration::from_millis(20));
                                Ok(calls.fetch_add(1, Ordering::SeqCst))
                            },
                        )
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| matches!(r, Ok((0, _)))));
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Ok((_, Resolution::Constructed))))
                .count(),
            1,
        );
    }

    #[test]
    fn waiters_observe_failure() {
        let cache = cache();
        let barrier = Barrier::new(2);

        thread::scope(|scope| {
            let constructor = scope.spawn(|| {
                cache.get_or_try_insert(
                    1,
                    "a",
                    || "a".to_owned(),
                    |_| {
                        barrier.wait();
                        thread::sleep(Duration::from_millis(20));
                        Err("boom")
                    },
                )
            });

            barrier.wait();
            let waited = cache.get_or_try_insert(1, "a", || unreachable!(), |_| Ok(1));

            assert_eq!(waited, Err(InFlightError::Failed("boom")));
            assert_eq!(
                constructor.join().unwrap(),
                Err(InFlightError::Failed("boom")),
            );
        });
    }

    #[test]
    fn wait_budget() {
        let cache: InFlightCache<String, usize, ()> =
            InFlightCache::new(Duration::from_millis(1), 3);
        let barrier = Barrier::new(2);
        let release = Barrier::new(2);

        thread::scope(|scope| {
            scope.spawn(|| {
                cache.get_or_try_insert(
                    1,
                    "a",
                    || "a".to_owned(),
                    |_| {
                        barrier.wait();
                        release.wait();
                        Ok(1)
                    },
                )
            });

            barrier.wait();
            let waited = cache.get_or_try_insert(1, "a", || unreachable!(), |_| Ok(2));
            release.wait();

            assert_eq!(waited, Err(InFlightError::WaitBudgetExhausted { retries: 3 }));
        });

        assert_eq!(cache.get(1, "a"), Some(1));
    }

    #[test]
    fn unwinding_construction_clears_pending() {
        let cache = cache();

        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.get_or_try_insert(1, "a", || "a".to_owned(), |_| -> Result<usize, _> {
                panic!("construction unwound")
            })
        }));
        assert!(res.is_err());

        let (value, resolution) = cache
            .get_or_try_insert(1, "a", || "a".to_owned(), |_| Ok(5))
            .unwrap();
        assert_eq!((value, resolution), (5, Resolution::Constructed));
    }
}
