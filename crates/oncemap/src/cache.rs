//! The memoizing [`Cache`] and its build coordination.

use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::event::{HookList, Subscription};

type Factory<K, V> = dyn Fn(&K) -> anyhow::Result<V> + Send + Sync;
type Disposer<K, V> = dyn Fn(&K, &V) + Send + Sync;
type CreatedHook<K, V> = dyn Fn(&K, &V) + Send + Sync;
type FailedHook<K> = dyn Fn(&K, &anyhow::Error) + Send + Sync;

/// The resolution state of an in-flight build.
enum BuildState<V> {
    InFlight,
    Succeeded(Arc<V>),
    Failed,
}

/// A one-shot completion handle shared between the builder of a key and all
/// callers waiting on that build.
struct BuildHandle<V> {
    state: Mutex<BuildState<V>>,
    resolved: Condvar,
}

impl<V> BuildHandle<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(BuildState::InFlight),
            resolved: Condvar::new(),
        }
    }

    /// Blocks until the build resolves, returning its outcome.
    fn wait(&self) -> Option<Arc<V>> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                BuildState::InFlight => self.resolved.wait(&mut state),
                BuildState::Succeeded(value) => return Some(Arc::clone(value)),
                BuildState::Failed => return None,
            }
        }
    }

    fn resolve(&self, outcome: BuildState<V>) {
        *self.state.lock() = outcome;
        self.resolved.notify_all();
    }
}

/// A per-key registry entry.
///
/// Only `Ready` slots count as cache contents; a `Pending` slot exists just
/// for the duration of its build and is only ever resolved or discarded by
/// the thread that inserted it.
enum Slot<V> {
    Pending(Arc<BuildHandle<V>>),
    Ready(Arc<V>),
}

impl<V> Clone for Slot<V> {
    fn clone(&self) -> Self {
        match self {
            Slot::Pending(build) => Slot::Pending(Arc::clone(build)),
            Slot::Ready(value) => Slot::Ready(Arc::clone(value)),
        }
    }
}

/// A thread-safe memoization cache with exactly-once builds per key.
///
/// The cache owns a factory that constructs values on demand and an optional
/// disposer that runs once per evicted entry. See the crate docs for the
/// concurrency contract.
///
/// The factory runs on the calling thread, outside of any cache-internal
/// lock, so builds for distinct keys proceed in parallel. The factory must
/// not call back into the same cache with the same key; doing so deadlocks
/// that build, just like any other self-wait.
///
/// # Example
///
/// ```
/// use oncemap::Cache;
///
/// let cache: Cache<u32, u32> = Cache::new(|n| Ok((1..=*n).sum()));
/// assert_eq!(*cache.get_or_create(10).unwrap(), 55);
/// assert_eq!(cache.len(), 1);
/// ```
pub struct Cache<K, V, S = RandomState> {
    slots: RwLock<HashMap<K, Slot<V>, S>>,
    factory: Box<Factory<K, V>>,
    disposer: Box<Disposer<K, V>>,
    created: HookList<CreatedHook<K, V>>,
    failed: HookList<FailedHook<K>>,
}

/// Builds a [`Cache`], optionally configuring a disposer and a hasher.
///
/// Created via [`Cache::builder`].
pub struct CacheBuilder<K, V, S = RandomState> {
    factory: Box<Factory<K, V>>,
    disposer: Box<Disposer<K, V>>,
    hasher: S,
}

impl<K, V> CacheBuilder<K, V> {
    fn new(factory: impl Fn(&K) -> anyhow::Result<V> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            disposer: Box::new(|_, _| {}),
            hasher: RandomState::new(),
        }
    }
}

impl<K, V, S> CacheBuilder<K, V, S> {
    /// Sets the disposer, invoked exactly once per evicted entry with the
    /// entry's key and value.
    pub fn disposer(mut self, disposer: impl Fn(&K, &V) + Send + Sync + 'static) -> Self {
        self.disposer = Box::new(disposer);
        self
    }

    /// Replaces the hash contract used for keys.
    pub fn hasher<S2: BuildHasher>(self, hasher: S2) -> CacheBuilder<K, V, S2> {
        CacheBuilder {
            factory: self.factory,
            disposer: self.disposer,
            hasher,
        }
    }

    /// Finishes building the [`Cache`].
    pub fn build(self) -> Cache<K, V, S>
    where
        K: Eq + Hash,
        S: BuildHasher,
    {
        Cache {
            slots: RwLock::new(HashMap::with_hasher(self.hasher)),
            factory: self.factory,
            disposer: self.disposer,
            created: HookList::new(),
            failed: HookList::new(),
        }
    }
}

impl<K: Eq + Hash, V> Cache<K, V> {
    /// Creates a cache with the given factory, a no-op disposer, and the
    /// default hasher.
    pub fn new(factory: impl Fn(&K) -> anyhow::Result<V> + Send + Sync + 'static) -> Self {
        Self::builder(factory).build()
    }

    /// Starts building a cache with the given factory.
    pub fn builder(
        factory: impl Fn(&K) -> anyhow::Result<V> + Send + Sync + 'static,
    ) -> CacheBuilder<K, V> {
        CacheBuilder::new(factory)
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher,
{
    /// Returns the cached value for `key`, building it if necessary.
    ///
    /// If the key is absent, the calling thread runs the factory; concurrent
    /// callers for the same key block until that one build resolves, and all
    /// of them observe the same outcome. Exactly one factory execution serves
    /// all callers of a key.
    ///
    /// A failed build leaves no trace in the cache and is reported as `None`;
    /// the factory error is surfaced only through the
    /// [`Failed`](Self::on_failed) event. A later call for the same key
    /// retries from scratch.
    pub fn get_or_create(&self, key: K) -> Option<Arc<V>> {
        // Fast path under the shared lock. The guard must not be held while
        // waiting on an in-flight build, or the builder could never publish.
        let existing = self.slots.read().get(&key).cloned();
        match existing {
            Some(Slot::Ready(value)) => return Some(value),
            Some(Slot::Pending(build)) => return build.wait(),
            None => {}
        }

        let build = {
            let mut slots = self.slots.write();
            // Somebody else may have won the race since the shared lookup.
            match slots.get(&key).cloned() {
                Some(Slot::Ready(value)) => return Some(value),
                Some(Slot::Pending(build)) => {
                    drop(slots);
                    return build.wait();
                }
                None => {
                    let build = Arc::new(BuildHandle::new());
                    slots.insert(key.clone(), Slot::Pending(Arc::clone(&build)));
                    build
                }
            }
        };

        // This thread is now the builder. The factory runs outside all locks;
        // if it panics, the guard discards the pending slot and releases the
        // waiters before the panic propagates.
        let built = {
            let abort = AbortOnPanic {
                cache: self,
                key: &key,
                build: &build,
            };
            let built = (self.factory)(&key);
            std::mem::forget(abort);
            built
        };

        match built {
            Ok(value) => {
                let value = Arc::new(value);
                self.slots
                    .write()
                    .insert(key.clone(), Slot::Ready(Arc::clone(&value)));
                build.resolve(BuildState::Succeeded(Arc::clone(&value)));
                self.created.broadcast(|hook| hook(&key, &value));
                Some(value)
            }
            Err(err) => {
                self.slots.write().remove(&key);
                build.resolve(BuildState::Failed);
                tracing::debug!(error = %err, "cache build failed");
                self.failed.broadcast(|hook| hook(&key, &err));
                None
            }
        }
    }

    /// Returns the cached value for `key`, if one is ready.
    ///
    /// Never triggers a build and never waits: a key whose build is still in
    /// flight is reported as absent.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        match self.slots.read().get(key) {
            Some(Slot::Ready(value)) => Some(Arc::clone(value)),
            _ => None,
        }
    }

    /// Returns whether a ready value exists for `key`.
    pub fn contains(&self, key: &K) -> bool {
        matches!(self.slots.read().get(key), Some(Slot::Ready(_)))
    }

    /// Removes the entry for `key`, if one is ready.
    ///
    /// On success the disposer runs exactly once with the removed key and
    /// value before this returns `true`. Returns `false`, without invoking
    /// the disposer, if the key is absent or its build is still in flight.
    ///
    /// A disposer panic propagates to the caller, but only after the entry
    /// was detached, so the key is gone from the cache regardless.
    pub fn remove(&self, key: &K) -> bool {
        let value = {
            let mut slots = self.slots.write();
            let Some(Slot::Ready(_)) = slots.get(key) else {
                return false;
            };
            let Some(Slot::Ready(value)) = slots.remove(key) else {
                return false;
            };
            value
        };
        (self.disposer)(key, &value);
        true
    }

    /// Removes all ready entries, invoking the disposer once per entry.
    ///
    /// The entries are detached from the registry atomically first, then
    /// disposed outside the lock, in unspecified order. Builds still in
    /// flight are unaffected and publish normally once they resolve.
    pub fn clear(&self) {
        let mut evicted = Vec::new();
        self.slots.write().retain(|key, slot| match slot {
            Slot::Ready(value) => {
                evicted.push((key.clone(), Arc::clone(value)));
                false
            }
            Slot::Pending(_) => true,
        });

        tracing::debug!(entries = evicted.len(), "clearing cache");
        for (key, value) in evicted {
            (self.disposer)(&key, &value);
        }
    }

    /// Returns the number of ready entries.
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Returns whether the cache has no ready entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over a point-in-time snapshot of the ready entries.
    ///
    /// The snapshot is taken when this is called; concurrent mutation does
    /// not affect an iteration already in progress. Call again for a fresh
    /// snapshot.
    pub fn iter(&self) -> Iter<K, V> {
        let entries: Vec<_> = self
            .slots
            .read()
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready(value) => Some((key.clone(), Arc::clone(value))),
                Slot::Pending(_) => None,
            })
            .collect();
        Iter(entries.into_iter())
    }

    /// Registers a hook invoked synchronously, on the building thread, once
    /// per successful build with the new entry's key and value.
    pub fn on_created(&self, hook: impl Fn(&K, &V) + Send + Sync + 'static) -> Subscription {
        self.created.subscribe(Arc::new(hook))
    }

    /// Registers a hook invoked synchronously, on the building thread, once
    /// per failed build with the key and the factory error.
    ///
    /// Callers that were blocked on the failing build do not fire the event
    /// again: one build, one event, mirroring the success path.
    pub fn on_failed(
        &self,
        hook: impl Fn(&K, &anyhow::Error) + Send + Sync + 'static,
    ) -> Subscription {
        self.failed.subscribe(Arc::new(hook))
    }

    /// Removes a previously registered hook, returning whether it was still
    /// registered.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.created.unsubscribe(subscription) || self.failed.unsubscribe(subscription)
    }
}

impl<K, V, S> fmt::Debug for Cache<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.try_read().map(|s| s.len()).unwrap_or_default();
        f.debug_struct("Cache")
            .field("slots", &slots)
            .finish_non_exhaustive()
    }
}

impl<'a, K, V, S> IntoIterator for &'a Cache<K, V, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher,
{
    type Item = (K, Arc<V>);
    type IntoIter = Iter<K, V>;

    fn into_iter(self) -> Iter<K, V> {
        self.iter()
    }
}

/// An iterator over a snapshot of a cache's ready entries.
///
/// Returned by [`Cache::iter`].
pub struct Iter<K, V>(std::vec::IntoIter<(K, Arc<V>)>);

impl<K, V> Iterator for Iter<K, V> {
    type Item = (K, Arc<V>);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl<K, V> ExactSizeIterator for Iter<K, V> {}

/// Discards a pending slot and releases its waiters when the factory panics.
struct AbortOnPanic<'a, K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    cache: &'a Cache<K, V, S>,
    key: &'a K,
    build: &'a BuildHandle<V>,
}

impl<K, V, S> Drop for AbortOnPanic<'_, K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn drop(&mut self) {
        self.cache.slots.write().remove(self.key);
        self.build.resolve(BuildState::Failed);
    }
}
