use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    hash::Hash,
    num::NonZeroUsize,
};

use crate::{cache::CacheMap, future::LoadFuture};

pub(crate) type CacheKeyFn<K, C> = Box<dyn Fn(&K) -> C>;
pub(crate) type BoxedCacheMap<C, V, E> = Box<dyn CacheMap<C, LoadFuture<V, E>>>;

/// Configuration for a [`Loader`](crate::Loader). Options are consumed when
/// the loader is created and can't be changed afterwards.
///
/// - `batch` (default `true`): collect every key requested before the
///   scheduler's next dispatch pass into one batch call. When disabled, each
///   request is dispatched on its own as soon as it's made.
/// - `max_batch_size` (default unbounded): split batches larger than this
///   into consecutive chunks, each dispatched as its own batch call.
/// - `cache` (default `true`): memoize futures by cache key, so that repeated
///   requests for an equivalent key share one request.
/// - the cache key function, which normalizes a key into the `C` used for
///   deduplication and cache lookups. [`LoaderOptions::default`] uses the key
///   itself; use [`LoaderOptions::keyed_by`] for keys that should be compared
///   by something other than their own equality.
/// - the cache map (default an empty [`HashMap`]); see
///   [`with_cache_map`][LoaderOptions::with_cache_map].
pub struct LoaderOptions<K, V, E, C = K> {
    pub(crate) batch: bool,
    pub(crate) max_batch_size: Option<NonZeroUsize>,
    pub(crate) cache: bool,
    pub(crate) cache_key_fn: CacheKeyFn<K, C>,
    pub(crate) cache_map: BoxedCacheMap<C, V, E>,
}

impl<K, V, E> Default for LoaderOptions<K, V, E, K>
where
    K: Clone + Eq + Hash + 'static,
    V: 'static,
    E: 'static,
{
    fn default() -> Self {
        Self::keyed_by(K::clone)
    }
}

impl<K, V, E, C> LoaderOptions<K, V, E, C>
where
    C: Eq + Hash + 'static,
    V: 'static,
    E: 'static,
{
    /// Create default options that normalize keys with `cache_key_fn`. Two
    /// keys are treated as the same request exactly when this function maps
    /// them to equal cache keys.
    pub fn keyed_by(cache_key_fn: impl Fn(&K) -> C + 'static) -> Self {
        Self {
            batch: true,
            max_batch_size: None,
            cache: true,
            cache_key_fn: Box::new(cache_key_fn),
            cache_map: Box::new(HashMap::new()),
        }
    }
}

impl<K, V, E, C> LoaderOptions<K, V, E, C> {
    /// Enable or disable batching. Disabled, each request is its own batch call.
    pub fn with_batch(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }

    /// Set the maximum number of keys per batch call. 0 means unbounded.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = NonZeroUsize::new(max_batch_size);
        self
    }

    /// Enable or disable memoization of futures by cache key.
    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    /// Use a custom cache map instead of the default [`HashMap`]. The loader
    /// takes ownership of the map; it's responsible for every insertion and
    /// eviction from then on.
    pub fn with_cache_map(mut self, cache_map: impl CacheMap<C, LoadFuture<V, E>> + 'static) -> Self {
        self.cache_map = Box::new(cache_map);
        self
    }

    #[inline]
    pub fn batch(&self) -> bool {
        self.batch
    }

    #[inline]
    pub fn max_batch_size(&self) -> Option<NonZeroUsize> {
        self.max_batch_size
    }

    #[inline]
    pub fn cache(&self) -> bool {
        self.cache
    }
}

impl<K, V, E, C> Debug for LoaderOptions<K, V, E, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderOptions")
            .field("batch", &self.batch)
            .field("max_batch_size", &self.max_batch_size)
            .field("cache", &self.cache)
            .field("cache_key_fn", &"<closure>")
            .field("cache_map", &"<cache>")
            .finish()
    }
}
