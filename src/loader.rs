use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    rc::{Rc, Weak},
};

use futures::future::{try_join_all, TryJoinAll};
use tracing::{debug, trace};

use crate::{
    batch::{box_batch_fn, BatchCoordinator, BatchResult, QueueEntry, SharedCache},
    future::LoadFuture,
    options::{CacheKeyFn, LoaderOptions},
    scheduler::{Dispatch, LoaderId, Scheduler},
};

struct LoaderInner<K, V, E, C> {
    id: LoaderId,
    scheduler: Scheduler,
    coordinator: BatchCoordinator<K, C, V, E>,
    cache_enabled: bool,
    cache_key_fn: CacheKeyFn<K, C>,
    cache: Rc<SharedCache<C, V, E>>,
}

/// A loader batches and caches requests for values identified by keys.
///
/// Each call to [`load`][Loader::load] returns a [`LoadFuture`] for a single
/// key. Keys requested before the owning [`Scheduler`] next dispatches are
/// collected into one call to the batch function, which receives them as a
/// `Vec<K>` (in the order they were requested) and must produce one result
/// per key, in the same order:
///
/// - `Ok(values)`, where `values[i]` is either `Ok(value)` or `Err(error)` for
///   `keys[i]`. A per-key error is a legitimate result: it's cached just like
///   a value, so later requests for that key see the same error without
///   calling the batch function again.
/// - `Err(error)` if the call failed as a whole. Every key in the call is
///   rejected with a clone of the error and evicted from the cache, so it can
///   be requested again.
///
/// If `values` has the wrong length, every key in the call is rejected with
/// [`LoadError::LengthMismatch`](crate::LoadError::LengthMismatch) and evicted.
///
/// Futures are memoized by cache key: requesting an equivalent key again
/// returns a handle to the same future, whether it's still pending or already
/// settled, until the key is [cleared][Loader::clear].
///
/// `Loader` is a cheap handle; clones refer to the same loader. When the last
/// handle is dropped, any requests still waiting to be dispatched are rejected
/// with [`LoadError::Disposed`](crate::LoadError::Disposed) and the loader leaves its scheduler.
pub struct Loader<K, V, E, C = K> {
    inner: Rc<LoaderInner<K, V, E, C>>,
}

impl<K, V, E, C> Clone for Loader<K, V, E, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V, E> Loader<K, V, E, K>
where
    K: Clone + Eq + Hash + 'static,
    V: Clone + 'static,
    E: Clone + 'static,
{
    /// Create a loader with the default options: batching and caching
    /// enabled, no batch size limit, and keys compared by their own equality.
    pub fn new<F, Fut>(scheduler: &Scheduler, batcher: F) -> Self
    where
        F: Fn(Vec<K>) -> Fut + 'static,
        Fut: Future<Output = BatchResult<V, E>> + 'static,
    {
        Self::with_options(scheduler, LoaderOptions::default(), batcher)
    }
}

impl<K, V, E, C> Loader<K, V, E, C>
where
    K: 'static,
    V: Clone + 'static,
    E: Clone + 'static,
    C: Clone + 'static,
{
    /// Create a loader configured by `options`. The loader registers itself
    /// with `scheduler`, which dispatches its batches from then on.
    pub fn with_options<F, Fut>(
        scheduler: &Scheduler,
        options: LoaderOptions<K, V, E, C>,
        batcher: F,
    ) -> Self
    where
        F: Fn(Vec<K>) -> Fut + 'static,
        Fut: Future<Output = BatchResult<V, E>> + 'static,
    {
        let LoaderOptions {
            batch,
            max_batch_size,
            cache,
            cache_key_fn,
            cache_map,
        } = options;

        let id = scheduler.next_loader_id();

        let inner = Rc::new(LoaderInner {
            id,
            scheduler: scheduler.clone(),
            coordinator: BatchCoordinator::new(
                id,
                box_batch_fn(batcher),
                batch,
                max_batch_size,
                scheduler.spawner(),
                scheduler.task_counter(),
            ),
            cache_enabled: cache,
            cache_key_fn,
            cache: Rc::new(SharedCache::new(cache_map)),
        });

        let dispatch: Weak<dyn Dispatch> = Rc::downgrade(&inner) as Weak<dyn Dispatch>;
        scheduler.register(id, dispatch);

        Self { inner }
    }

    /// Request the value for `key`.
    ///
    /// If caching is enabled and an equivalent key is cached, this returns a
    /// handle to the cached future. Otherwise the key is queued for the next
    /// batch call (or dispatched immediately, if batching is disabled), and
    /// the new future is cached before it's returned, so that a second request
    /// for the same key is deduplicated even before the first is dispatched.
    pub fn load(&self, key: K) -> LoadFuture<V, E> {
        let inner = &*self.inner;
        let cache_key = (inner.cache_key_fn)(&key);

        if inner.cache_enabled {
            if let Some(cached) = inner.cache.borrow().get(&cache_key) {
                trace!(loader = %inner.id, "cache hit");
                return cached.clone();
            }
        }

        let (future, resolver) = LoadFuture::pending();

        if inner.cache_enabled {
            inner
                .cache
                .borrow_mut()
                .set(cache_key.clone(), future.clone());
        }

        inner.coordinator.enqueue(
            QueueEntry {
                key,
                cache_key,
                resolver,
            },
            &Rc::downgrade(&inner.cache),
        );

        future
    }

    /// Request the values for several keys at once. The returned future
    /// resolves to the values in the same order as `keys`, or rejects with the
    /// first error among them. Each key is requested exactly as with
    /// [`load`][Loader::load].
    pub fn load_many(&self, keys: impl IntoIterator<Item = K>) -> TryJoinAll<LoadFuture<V, E>> {
        try_join_all(keys.into_iter().map(|key| self.load(key)))
    }

    /// Evict the cached future for `key`, if there is one. The next request
    /// for the key will go to the batch function.
    pub fn clear(&self, key: &K) -> &Self {
        let cache_key = (self.inner.cache_key_fn)(key);
        self.inner.cache.borrow_mut().clear(&cache_key);
        self
    }

    /// Evict every cached future from this loader. To be used when some event
    /// results in unknown invalidations across this loader.
    pub fn clear_all(&self) -> &Self {
        self.inner.cache.borrow_mut().clear_all();
        self
    }

    /// Seed the cache for `key` with an already-settled future: fulfilled for
    /// `Ok(value)`, rejected for `Err(error)`. Does nothing if `key` is already
    /// cached; to replace a cached value, [`clear`][Loader::clear] it first.
    pub fn prime(&self, key: &K, value: Result<V, E>) -> &Self {
        let cache_key = (self.inner.cache_key_fn)(key);
        let mut cache = self.inner.cache.borrow_mut();

        // Cache a rejected future for an error, to match what load would have
        // produced for it.
        if !cache.has(&cache_key) {
            let future = match value {
                Ok(value) => LoadFuture::fulfilled(value),
                Err(error) => LoadFuture::rejected(error),
            };

            cache.set(cache_key, future);
        }

        self
    }
}

impl<K, V, E, C> Loader<K, V, E, C> {
    /// This loader's id within its scheduler.
    #[inline]
    pub fn id(&self) -> LoaderId {
        self.inner.id
    }

    /// The scheduler that drives this loader.
    #[inline]
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// The number of requests waiting for the next dispatch.
    #[inline]
    pub fn pending_len(&self) -> usize {
        self.inner.coordinator.pending_len()
    }
}

impl<K, V, E, C> Dispatch for LoaderInner<K, V, E, C>
where
    K: 'static,
    V: 'static,
    E: Clone + 'static,
    C: 'static,
{
    fn has_pending(&self) -> bool {
        self.coordinator.pending_len() > 0
    }

    fn dispatch(&self) {
        self.coordinator.dispatch(&Rc::downgrade(&self.cache))
    }
}

impl<K, V, E, C> Drop for LoaderInner<K, V, E, C> {
    fn drop(&mut self) {
        let cancelled = self.coordinator.cancel();
        if cancelled > 0 {
            debug!(loader = %self.id, cancelled, "loader dropped with queued requests");
        }

        self.scheduler.deregister(self.id);
    }
}

impl<K, V, E, C> Debug for Loader<K, V, E, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("id", &self.inner.id)
            .field("cache_enabled", &self.inner.cache_enabled)
            .field("coordinator", &self.inner.coordinator)
            .finish()
    }
}

