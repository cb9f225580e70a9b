use std::{
    cell::{Cell, RefCell},
    fmt::{self, Debug, Display, Formatter},
    future::Future,
    rc::{Rc, Weak},
    thread,
};

use futures::{
    executor::{LocalPool, LocalSpawner},
    future::FutureExt,
    task::LocalSpawnExt,
};
use tracing::{debug, trace};

use crate::error::{AwaitError, SchedulerError};

/// Identifies a loader within its scheduler. Ids are assigned in creation
/// order and never reused by the same scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(usize);

impl Display for LoaderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "loader-{}", self.0)
    }
}

/// The scheduler's view of a loader: something with a queue that can be
/// checked and flushed.
pub(crate) trait Dispatch {
    fn has_pending(&self) -> bool;
    fn dispatch(&self);
}

/// Counts a scheduler's batch tasks that have been spawned but haven't
/// finished. Only these can be woken from outside the scheduler.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskCounter {
    count: Rc<Cell<usize>>,
}

impl TaskCounter {
    /// Count a new task. It stays counted until the returned guard is dropped.
    pub(crate) fn start(&self) -> RunningTask {
        self.count.set(self.count.get() + 1);

        RunningTask {
            count: self.count.clone(),
        }
    }

    pub(crate) fn running(&self) -> usize {
        self.count.get()
    }
}

pub(crate) struct RunningTask {
    count: Rc<Cell<usize>>,
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        self.count.set(self.count.get() - 1);
    }
}

struct Registration {
    id: LoaderId,
    loader: Weak<dyn Dispatch>,
}

struct SchedulerInner {
    pool: RefCell<LocalPool>,
    spawner: LocalSpawner,
    tasks: TaskCounter,
    registry: RefCell<Vec<Registration>>,
    next_id: Cell<usize>,
}

/// Drives a group of [`Loader`]s to completion.
///
/// Every loader belongs to exactly one scheduler, passed to it at
/// construction. The scheduler keeps a registry of its live loaders, in the
/// order they were created, and runs their batch calls as tasks on a local
/// (single-threaded) pool. Loaders are removed from the registry when they're
/// dropped.
///
/// Because a batch function may itself make requests to its own or another
/// loader, flushing each queue once isn't enough to settle everything. The
/// blocking operations here ([`await_all`], [`block_on`], [`wait`]) therefore
/// loop: run every runnable task until none can make progress, then dispatch
/// every loader that has queued requests, and repeat until a full pass
/// dispatches nothing. Keys requested anywhere during the run phase (including
/// by continuations of already-settled futures) are collected into the same
/// batch.
///
/// `Scheduler` is a cheap handle; clones refer to the same scheduler.
///
/// [`Loader`]: crate::Loader
/// [`await_all`]: Scheduler::await_all
/// [`block_on`]: Scheduler::block_on
/// [`wait`]: Scheduler::wait
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();

        Self {
            inner: Rc::new(SchedulerInner {
                pool: RefCell::new(pool),
                spawner,
                tasks: TaskCounter::default(),
                registry: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
            }),
        }
    }

    /// The number of live loaders registered with this scheduler.
    pub fn loader_count(&self) -> usize {
        self.inner.registry.borrow().len()
    }

    /// Check if any registered loader has requests waiting to be dispatched.
    pub fn has_pending(&self) -> bool {
        self.snapshot()
            .into_iter()
            .filter_map(|loader| loader.upgrade())
            .any(|loader| loader.has_pending())
    }

    /// Run every task and dispatch every loader until nothing is left to do.
    /// Batch calls waiting on something external (a timer, a socket) are left
    /// in place; they'll be picked up by a later call.
    pub fn await_all(&self) -> Result<(), SchedulerError> {
        loop {
            self.drain()?;

            if !self.dispatch_pass()? {
                return Ok(());
            }
        }
    }

    /// Drive `future` to completion, dispatching loaders as needed, and return
    /// its output. A rejected request comes back as a value here; use
    /// [`wait`][Scheduler::wait] to have it come back as an error instead.
    /// Once `future` has completed, every loader is dispatched as with
    /// [`await_all`][Scheduler::await_all] before this returns.
    ///
    /// While batch calls are in flight, the thread is parked until one of them
    /// is woken (by a timer, for instance). If `future` can't complete and
    /// nothing is queued or in flight, this returns
    /// [`SchedulerError::NoActiveLoader`] when no loaders are registered, or
    /// [`SchedulerError::Stalled`] otherwise.
    ///
    /// This must not be called from inside one of this scheduler's own tasks
    /// (such as a batch function); that returns [`SchedulerError::Reentrant`].
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, SchedulerError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        if self.inner.pool.try_borrow_mut().is_err() {
            return Err(SchedulerError::Reentrant);
        }

        // The awaited future runs as one of the pool's tasks, so that its
        // continuations are drained alongside the batch tasks and can add keys
        // to a batch before it's dispatched. Dropping the handle on an early
        // return cancels it.
        let (task, mut handle) = future.remote_handle();

        // Spawning only fails once the pool is gone, and then there's nothing
        // left that could drive the future.
        self.inner
            .spawner
            .spawn_local(task)
            .map_err(|_| SchedulerError::NoActiveLoader)?;

        loop {
            self.drain()?;

            if let Some(output) = (&mut handle).now_or_never() {
                self.await_all()?;
                return Ok(output);
            }

            if self.dispatch_pass()? {
                continue;
            }

            let running = self.inner.tasks.running();
            if running == 0 {
                return Err(match self.loader_count() {
                    0 => SchedulerError::NoActiveLoader,
                    _ => SchedulerError::Stalled,
                });
            }

            // Every batch in flight is waiting on something outside of this
            // scheduler. Wakers from the pool unpark this thread, so the next
            // wake (or a spurious unpark) sends us around the loop again.
            trace!(running, "waiting on batch tasks; parking");
            thread::park();
        }
    }

    /// Drive `future` to completion like [`block_on`][Scheduler::block_on],
    /// then unwrap its result: a rejection is returned as
    /// [`AwaitError::Rejected`].
    pub fn wait<F, T, E>(&self, future: F) -> Result<T, AwaitError<E>>
    where
        F: Future<Output = Result<T, E>> + 'static,
        T: 'static,
        E: 'static,
    {
        self.block_on(future)?.map_err(AwaitError::Rejected)
    }

    pub(crate) fn spawner(&self) -> LocalSpawner {
        self.inner.spawner.clone()
    }

    pub(crate) fn task_counter(&self) -> TaskCounter {
        self.inner.tasks.clone()
    }

    pub(crate) fn next_loader_id(&self) -> LoaderId {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        LoaderId(id)
    }

    pub(crate) fn register(&self, id: LoaderId, loader: Weak<dyn Dispatch>) {
        self.inner
            .registry
            .borrow_mut()
            .push(Registration { id, loader });
        debug!(loader = %id, "registered loader");
    }

    pub(crate) fn deregister(&self, id: LoaderId) {
        if let Ok(mut registry) = self.inner.registry.try_borrow_mut() {
            registry.retain(|registration| registration.id != id);
        }
    }

    fn snapshot(&self) -> Vec<Weak<dyn Dispatch>> {
        self.inner
            .registry
            .borrow()
            .iter()
            .map(|registration| registration.loader.clone())
            .collect()
    }

    /// Run the pool until every task is blocked.
    fn drain(&self) -> Result<(), SchedulerError> {
        let mut pool = self
            .inner
            .pool
            .try_borrow_mut()
            .map_err(|_| SchedulerError::Reentrant)?;

        pool.run_until_stalled();
        Ok(())
    }

    /// Visit every registered loader in registration order, draining the pool
    /// and then dispatching each one that has queued requests. Returns true if
    /// anything was dispatched.
    fn dispatch_pass(&self) -> Result<bool, SchedulerError> {
        let mut progressed = false;

        // Loaders created during the pass are picked up by the next one.
        for loader in self.snapshot() {
            let loader = match loader.upgrade() {
                Some(loader) => loader,
                None => continue,
            };

            if !loader.has_pending() {
                continue;
            }

            progressed = true;
            self.drain()?;
            loader.dispatch();
        }

        Ok(progressed)
    }
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let loaders: Vec<LoaderId> = self
            .inner
            .registry
            .try_borrow()
            .map(|registry| registry.iter().map(|registration| registration.id).collect())
            .unwrap_or_default();

        f.debug_struct("Scheduler")
            .field("loaders", &loaders)
            .finish()
    }
}

