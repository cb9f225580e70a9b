use std::{
    cell::RefCell,
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    num::NonZeroUsize,
    rc::Weak,
};

use futures::{
    executor::LocalSpawner,
    future::{FutureExt, LocalBoxFuture},
    task::LocalSpawnExt,
};
use tracing::{debug, trace, warn};

use crate::{
    error::LoadError,
    future::Resolver,
    options::BoxedCacheMap,
    scheduler::{LoaderId, TaskCounter},
};

/// What a batch function produces for one batch call: either a list of
/// per-key results, positionally aligned with the keys it was given, or an
/// error for the call as a whole.
pub type BatchResult<V, E> = Result<Vec<Result<V, E>>, E>;

pub(crate) type BatchFn<K, V, E> = Box<dyn Fn(Vec<K>) -> LocalBoxFuture<'static, BatchResult<V, E>>>;

/// The loader's cache, as seen by in-flight batch tasks. Tasks only hold a
/// weak reference, so a loader dropped mid-batch takes its cache with it.
pub(crate) type SharedCache<C, V, E> = RefCell<BoxedCacheMap<C, V, E>>;

pub(crate) fn box_batch_fn<K, V, E, F, Fut>(batcher: F) -> BatchFn<K, V, E>
where
    F: Fn(Vec<K>) -> Fut + 'static,
    Fut: Future<Output = BatchResult<V, E>> + 'static,
{
    Box::new(move |keys| batcher(keys).boxed_local())
}

/// A single queued request: the key to send to the batch function, the cache
/// key it was stored under, and the resolver for the future handed to the
/// caller.
pub(crate) struct QueueEntry<K, C, V, E> {
    pub(crate) key: K,
    pub(crate) cache_key: C,
    pub(crate) resolver: Resolver<V, E>,
}

/// The part of a queue entry that outlives the dispatch: once the key has been
/// handed to the batch function, all that's left is to settle the request
/// (and possibly evict it).
struct InFlight<C, V, E> {
    cache_key: C,
    resolver: Resolver<V, E>,
}

/// Owns a loader's request queue and turns it into batch calls.
///
/// The queue is Idle when empty and Accumulating once it has entries. A
/// dispatch swaps the whole queue out for a fresh one, so requests made while
/// a batch is in flight always land in the next batch, never the current one.
/// With batching disabled, the first entry of an empty queue is dispatched
/// immediately, before `enqueue` returns; otherwise the queue waits for the
/// scheduler's next dispatch pass, which only happens once everything
/// currently runnable has had a chance to add more keys.
pub(crate) struct BatchCoordinator<K, C, V, E> {
    loader: LoaderId,
    batcher: BatchFn<K, V, E>,
    batch: bool,
    max_batch_size: Option<NonZeroUsize>,
    spawner: LocalSpawner,
    tasks: TaskCounter,
    queue: RefCell<Vec<QueueEntry<K, C, V, E>>>,
}

impl<K, C, V, E> BatchCoordinator<K, C, V, E> {
    pub(crate) fn new(
        loader: LoaderId,
        batcher: BatchFn<K, V, E>,
        batch: bool,
        max_batch_size: Option<NonZeroUsize>,
        spawner: LocalSpawner,
        tasks: TaskCounter,
    ) -> Self {
        Self {
            loader,
            batcher,
            batch,
            max_batch_size,
            spawner,
            tasks,
            queue: RefCell::new(Vec::new()),
        }
    }

    #[inline]
    pub(crate) fn pending_len(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Drop every queued entry without dispatching it. Each one's future is
    /// rejected with `LoadError::Disposed` by its resolver. Returns the number
    /// of cancelled entries.
    pub(crate) fn cancel(&self) -> usize {
        let queue = match self.queue.try_borrow_mut() {
            Ok(mut queue) => mem::take(&mut *queue),
            Err(..) => return 0,
        };

        let cancelled = queue.len();
        drop(queue);
        cancelled
    }
}

impl<K, C, V, E> BatchCoordinator<K, C, V, E>
where
    K: 'static,
    C: 'static,
    V: 'static,
    E: Clone + 'static,
{
    /// Add an entry to the queue. If batching is disabled and this is the
    /// first entry since the queue was last emptied, the queue is dispatched
    /// right away.
    pub(crate) fn enqueue(&self, entry: QueueEntry<K, C, V, E>, cache: &Weak<SharedCache<C, V, E>>) {
        let len = {
            let mut queue = self.queue.borrow_mut();
            queue.push(entry);
            queue.len()
        };

        trace!(loader = %self.loader, queued = len, "enqueued key");

        if len == 1 && !self.batch {
            self.dispatch(cache);
        }
    }

    /// Take the current queue and issue batch calls for it, splitting it into
    /// chunks of at most `max_batch_size` keys. Chunks are dispatched in
    /// order and settle independently of one another.
    pub(crate) fn dispatch(&self, cache: &Weak<SharedCache<C, V, E>>) {
        let mut queue = mem::take(&mut *self.queue.borrow_mut());
        if queue.is_empty() {
            return;
        }

        let chunk_size = match self.max_batch_size {
            Some(max) => max.get(),
            None => queue.len(),
        };

        debug!(
            loader = %self.loader,
            keys = queue.len(),
            chunks = (queue.len() + chunk_size - 1) / chunk_size,
            "dispatching batch"
        );

        while !queue.is_empty() {
            let rest = if queue.len() > chunk_size {
                queue.split_off(chunk_size)
            } else {
                Vec::new()
            };

            self.dispatch_chunk(queue, cache.clone());
            queue = rest;
        }
    }

    fn dispatch_chunk(&self, chunk: Vec<QueueEntry<K, C, V, E>>, cache: Weak<SharedCache<C, V, E>>) {
        let mut keys = Vec::with_capacity(chunk.len());
        let mut in_flight = Vec::with_capacity(chunk.len());

        for QueueEntry {
            key,
            cache_key,
            resolver,
        } in chunk
        {
            keys.push(key);
            in_flight.push(InFlight {
                cache_key,
                resolver,
            });
        }

        // No borrows are held at this point; the batch function is free to
        // make new requests to this or any other loader.
        let batch_fut = (self.batcher)(keys);
        let loader = self.loader;
        let running = self.tasks.start();

        let task = async move {
            let result = batch_fut.await;
            settle_chunk(loader, in_flight, result, &cache);
            drop(running);
        };

        // Spawning only fails if the pool is gone, in which case the task
        // (and with it every resolver) is dropped, rejecting the requests.
        if let Err(err) = self.spawner.spawn_local(task) {
            warn!(loader = %loader, error = %err, "failed to spawn batch task");
        }
    }
}

/// Distribute the result of one batch call to the futures in its chunk.
fn settle_chunk<C, V, E: Clone>(
    loader: LoaderId,
    in_flight: Vec<InFlight<C, V, E>>,
    result: BatchResult<V, E>,
    cache: &Weak<SharedCache<C, V, E>>,
) {
    match result {
        Ok(values) if values.len() == in_flight.len() => {
            in_flight
                .into_iter()
                .zip(values)
                .for_each(|(entry, value)| match value {
                    Ok(value) => entry.resolver.resolve(value),
                    Err(err) => entry.resolver.reject(LoadError::Failed(err)),
                });
        }
        Ok(values) => {
            warn!(
                loader = %loader,
                keys = in_flight.len(),
                values = values.len(),
                "batch function returned the wrong number of values"
            );

            let error = LoadError::LengthMismatch {
                keys: in_flight.len(),
                values: values.len(),
            };
            fail_chunk(in_flight, error, cache);
        }
        Err(err) => {
            debug!(loader = %loader, keys = in_flight.len(), "batch call failed");
            fail_chunk(in_flight, LoadError::Failed(err), cache);
        }
    }
}

/// Reject every future in a chunk with the same error. Each entry is evicted
/// from the cache first, so that a failed batch call never leaves a poisoned
/// entry behind and the key can simply be requested again. An entry is only
/// evicted while the cache still holds that entry's own future.
fn fail_chunk<C, V, E: Clone>(
    in_flight: Vec<InFlight<C, V, E>>,
    error: LoadError<E>,
    cache: &Weak<SharedCache<C, V, E>>,
) {
    let cache = cache.upgrade();

    for entry in in_flight {
        if let Some(cache) = cache.as_ref() {
            if let Ok(mut cache) = cache.try_borrow_mut() {
                let cached_here = cache
                    .get(&entry.cache_key)
                    .map_or(false, |cached| entry.resolver.settles(cached));

                if cached_here {
                    cache.clear(&entry.cache_key);
                }
            }
        }

        entry.resolver.reject(error.clone());
    }
}

impl<K, C, V, E> Debug for BatchCoordinator<K, C, V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("loader", &self.loader)
            .field("batcher", &"<closure>")
            .field("batch", &self.batch)
            .field("max_batch_size", &self.max_batch_size)
            .field("queued", &self.queue.try_borrow().map(|queue| queue.len()).ok())
            .finish()
    }
}

