//! The key cache used by loaders to memoize their futures.

use std::{
    collections::{BTreeMap, HashMap},
    hash::{BuildHasher, Hash},
};

/// A mapping from normalized cache keys to cached futures.
///
/// Loaders normalize every key before touching the cache, so implementations
/// don't need any key logic of their own. All operations are synchronous and
/// only affect the mapping. A loader calls `set` at most once per key between
/// `clear`s; it never relies on `set` overwriting a present entry.
///
/// The default implementation is a plain [`HashMap`], which never evicts
/// anything: entries live until they're cleared through the loader.
pub trait CacheMap<K, V> {
    /// Get the cached value for `key`, if there is one.
    fn get(&self, key: &K) -> Option<&V>;

    /// Check if `key` has a cached value.
    fn has(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Cache `value` for `key`.
    fn set(&mut self, key: K, value: V);

    /// Remove the cached value for `key`. No-op if it isn't present.
    fn clear(&mut self, key: &K);

    /// Remove every cached value.
    fn clear_all(&mut self);
}

impl<K: Eq + Hash, V, S: BuildHasher> CacheMap<K, V> for HashMap<K, V, S> {
    #[inline]
    fn get(&self, key: &K) -> Option<&V> {
        HashMap::get(self, key)
    }

    #[inline]
    fn has(&self, key: &K) -> bool {
        self.contains_key(key)
    }

    #[inline]
    fn set(&mut self, key: K, value: V) {
        self.insert(key, value);
    }

    #[inline]
    fn clear(&mut self, key: &K) {
        self.remove(key);
    }

    #[inline]
    fn clear_all(&mut self) {
        HashMap::clear(self)
    }
}

impl<K: Ord, V> CacheMap<K, V> for BTreeMap<K, V> {
    #[inline]
    fn get(&self, key: &K) -> Option<&V> {
        BTreeMap::get(self, key)
    }

    #[inline]
    fn has(&self, key: &K) -> bool {
        self.contains_key(key)
    }

    #[inline]
    fn set(&mut self, key: K, value: V) {
        self.insert(key, value);
    }

    #[inline]
    fn clear(&mut self, key: &K) {
        self.remove(key);
    }

    #[inline]
    fn clear_all(&mut self) {
        BTreeMap::clear(self)
    }
}
