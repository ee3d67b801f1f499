//! Single-flight memoization.
//!
//! A [`MemoCache`] binds one computation and runs it at most
//! once per key. The first caller for a key becomes its
//! creator and runs the computation on its own task; every
//! other caller, concurrent or later, waits on the entry's
//! [`Signal`] and gets a clone of the same result.
//!
//! Errors are cached like values and replayed to every later
//! caller; nothing is retried and nothing is ever evicted.
//!
//! A computation that panics poisons its entry, much like
//! `std::sync::Once`: the panic reaches the creator, and every
//! waiter and later caller for that key panics as well.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures::Future;
use parking_lot::Mutex;

use crate::signal::Signal;

struct Entry<V, E> {
    result: OnceLock<Result<V, E>>,
    poisoned: AtomicBool,
    done: Signal,
}

impl<V, E> Entry<V, E> {
    fn new() -> Self {
        Entry {
            result: OnceLock::new(),
            poisoned: AtomicBool::new(false),
            done: Signal::new(),
        }
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
        self.done.fire();
    }

    fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn complete(&self, result: Result<V, E>) {
        // Only the creator writes, exactly once.
        if self.result.set(result).is_err() {
            unreachable!("cache entry completed twice");
        }
        self.done.fire();
    }
}

/// Concurrency-safe memoizing map from `K` to the result of
/// `compute(K)`.
///
/// The internal lock covers lookup and insertion only, so
/// computations for distinct keys proceed in parallel.
pub struct MemoCache<K, V, E, F> {
    entries: Mutex<HashMap<K, Arc<Entry<V, E>>>>,
    compute: F,
}

impl<K, V, E, F, Fut> MemoCache<K, V, E, F>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
    F: Fn(K) -> Fut,
    Fut: Future<Output = Result<V, E>>,
{
    pub fn new(compute: F) -> Self {
        MemoCache {
            entries: Mutex::new(HashMap::new()),
            compute,
        }
    }

    /// Return the result for `key`, computing it if no other
    /// caller has claimed it yet.
    ///
    /// If the creator's future is dropped before its
    /// computation completes, the pending entry is withdrawn
    /// and one of the waiters takes over as creator.
    ///
    /// # Panics
    ///
    /// Panics if the computation for `key` panicked, on this
    /// call or an earlier one.
    pub async fn get(&self, key: K) -> Result<V, E> {
        loop {
            let (entry, created) = self.claim(&key);
            if created {
                let mut pending = Pending {
                    entries: &self.entries,
                    key: &key,
                    entry: &entry,
                    completed: false,
                };
                let result = (self.compute)(key.clone()).await;
                entry.complete(result);
                pending.completed = true;
            } else {
                entry.done.wait().await;
            }

            match entry.result.get() {
                Some(result) => return result.clone(),
                None if entry.is_poisoned() => {
                    panic!("memoized computation for this key panicked")
                }
                None => log::debug!("pending entry was abandoned; claiming again"),
            }
        }
    }

    fn claim(&self, key: &K) -> (Arc<Entry<V, E>>, bool) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            return (entry.clone(), false);
        }
        let entry = Arc::new(Entry::new());
        entries.insert(key.clone(), entry.clone());
        log::debug!("cache miss; computing (entries: {})", entries.len());
        (entry, true)
    }
}

impl<K: Eq + Hash, V: Clone, E: Clone, F> MemoCache<K, V, E, F> {
    /// The completed result for `key`, without waiting.
    /// `None` if the key is absent or still being computed.
    pub fn peek(&self, key: &K) -> Option<Result<V, E>> {
        let entry = self.entries.lock().get(key)?.clone();
        let result = entry.result.get().cloned();
        result
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Number of entries, pending ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<K, V, E, F> std::fmt::Debug for MemoCache<K, V, E, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoCache")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

/// Withdraws a creator's entry if its future is dropped
/// mid-computation, releasing the waiters. When the drop is
/// an unwind out of the computation, the entry stays and is
/// poisoned instead, so the computation never runs twice.
struct Pending<'a, K: Eq + Hash, V, E> {
    entries: &'a Mutex<HashMap<K, Arc<Entry<V, E>>>>,
    key: &'a K,
    entry: &'a Arc<Entry<V, E>>,
    completed: bool,
}

impl<'a, K: Eq + Hash, V, E> Drop for Pending<'a, K, V, E> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if std::thread::panicking() {
            log::debug!("computation panicked; poisoning its entry");
            self.entry.poison();
            return;
        }
        let mut entries = self.entries.lock();
        if entries
            .get(self.key)
            .map_or(false, |current| Arc::ptr_eq(current, self.entry))
        {
            entries.remove(self.key);
        }
        drop(entries);
        log::debug!("creator dropped before completing; releasing waiters");
        self.entry.done.fire();
    }
}
