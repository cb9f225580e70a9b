//! Error types produced by loaders and by the scheduler that drives them.

use thiserror::Error;

/// The reason a [`LoadFuture`](crate::LoadFuture) was rejected.
///
/// `E` is the error type of the batch function. It appears both for errors
/// returned at a single key's position and for failures of a whole batch call;
/// in the latter case every key in that call receives a clone of the same
/// error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError<E> {
    /// The batch function reported an error for this key, or the batch call
    /// that included this key failed as a whole.
    #[error("{0}")]
    Failed(E),

    /// The batch function returned a list of values whose length doesn't match
    /// the list of keys it was given.
    #[error(
        "batch function must return a list of values of the same length as \
         its list of keys, but it returned {values} values for {keys} keys"
    )]
    LengthMismatch { keys: usize, values: usize },

    /// The loader was dropped while this request was still queued, or the
    /// batch task that would have settled it was torn down.
    #[error("loader was dropped before the request completed")]
    Disposed,
}

impl<E> LoadError<E> {
    /// Get the batch function's error, if this is a `Failed` rejection.
    pub fn failure(&self) -> Option<&E> {
        match self {
            LoadError::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Errors from the blocking [`Scheduler`](crate::Scheduler) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The awaited future hasn't settled, nothing is queued anywhere, and no
    /// loaders are registered that could make it progress.
    #[error("found no active loader that could make progress on the awaited future")]
    NoActiveLoader,

    /// The awaited future hasn't settled, nothing is queued, and no batch call
    /// is in flight, so nothing this scheduler drives can wake it. Loaders are
    /// still registered, but none of them has work to do.
    #[error("the awaited future is waiting on something no loader of this scheduler can settle")]
    Stalled,

    /// A blocking scheduler operation was called from inside one of that
    /// scheduler's own tasks (for instance, from a batch function).
    #[error("the scheduler is already running; batch functions must await instead of blocking")]
    Reentrant,
}

/// The error from [`Scheduler::wait`](crate::Scheduler::wait): either the
/// awaited future was rejected, or the scheduler could not drive it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AwaitError<E> {
    #[error("{0}")]
    Rejected(E),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl<E> AwaitError<E> {
    /// Get the rejection reason, if the awaited future was rejected.
    pub fn rejection(&self) -> Option<&E> {
        match self {
            AwaitError::Rejected(err) => Some(err),
            AwaitError::Scheduler(..) => None,
        }
    }
}
