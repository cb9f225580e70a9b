//! The per-key future handed out by loaders, and the resolver that settles it.

use std::{
    cell::RefCell,
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use crate::{
    error::LoadError,
    wakerset::{Token as WakerToken, WakerSet},
};

enum Slot<V, E> {
    Pending(WakerSet),
    Settled(Result<V, LoadError<E>>),
}

impl<V, E> Slot<V, E> {
    /// Settle this slot, returning the wakers that were waiting on it. Returns
    /// None if the slot was already settled, in which case it's left as-is.
    fn settle(&mut self, result: Result<V, LoadError<E>>) -> Option<WakerSet> {
        if let Slot::Settled(..) = self {
            return None;
        }

        match mem::replace(self, Slot::Settled(result)) {
            Slot::Pending(wakers) => Some(wakers),
            Slot::Settled(..) => None,
        }
    }
}

/// A request for the value associated with a single key.
///
/// `LoadFuture` is a handle to a shared result slot: cloning it produces
/// another handle to the same slot, and a loader returns clones of one
/// `LoadFuture` for every request of an equivalent key while that key is
/// cached. Use [`ptr_eq`][LoadFuture::ptr_eq] to check whether two handles
/// are the same request.
///
/// A `LoadFuture` does no work when polled; it only observes its slot. The
/// batch that settles it is driven by the loader's
/// [`Scheduler`](crate::Scheduler), so await it from inside
/// [`Scheduler::block_on`](crate::Scheduler::block_on) (or a future driven by
/// it).
pub struct LoadFuture<V, E> {
    slot: Rc<RefCell<Slot<V, E>>>,
    waker_token: Option<WakerToken>,
}

impl<V, E> LoadFuture<V, E> {
    /// Create an unsettled future, along with the resolver that settles it.
    pub(crate) fn pending() -> (Self, Resolver<V, E>) {
        let slot = Rc::new(RefCell::new(Slot::Pending(WakerSet::default())));

        let resolver = Resolver {
            slot: Some(slot.clone()),
        };

        let future = LoadFuture {
            slot,
            waker_token: None,
        };

        (future, resolver)
    }

    /// Create a future that has already settled with `result`.
    pub fn settled(result: Result<V, LoadError<E>>) -> Self {
        LoadFuture {
            slot: Rc::new(RefCell::new(Slot::Settled(result))),
            waker_token: None,
        }
    }

    /// Create a future that has already been fulfilled with `value`.
    pub fn fulfilled(value: V) -> Self {
        Self::settled(Ok(value))
    }

    /// Create a future that has already been rejected with `error`.
    pub fn rejected(error: E) -> Self {
        Self::settled(Err(LoadError::Failed(error)))
    }

    /// Check if two futures are handles to the same request.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.slot, &other.slot)
    }

    /// Check if this future has a result available, without polling it.
    pub fn is_settled(&self) -> bool {
        match self.slot.try_borrow() {
            Ok(slot) => matches!(*slot, Slot::Settled(..)),
            Err(..) => false,
        }
    }
}

impl<V: Clone, E: Clone> LoadFuture<V, E> {
    /// Get a copy of the result of this future, if it has settled.
    pub fn peek(&self) -> Option<Result<V, LoadError<E>>> {
        match *self.slot.try_borrow().ok()? {
            Slot::Settled(ref result) => Some(result.clone()),
            Slot::Pending(..) => None,
        }
    }
}

impl<V, E> Clone for LoadFuture<V, E> {
    fn clone(&self) -> Self {
        // The waker token belongs to this particular handle; the clone
        // registers its own the first time it's polled.
        LoadFuture {
            slot: self.slot.clone(),
            waker_token: None,
        }
    }
}

impl<V, E> Debug for LoadFuture<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadFuture")
            .field("slot", &Rc::as_ptr(&self.slot))
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<V: Clone, E: Clone> Future for LoadFuture<V, E> {
    type Output = Result<V, LoadError<E>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);
        let mut slot = unpinned.slot.borrow_mut();

        match *slot {
            Slot::Settled(ref result) => {
                // Settlement consumed the WakerSet, so our token is already gone
                unpinned.waker_token = None;
                Poll::Ready(result.clone())
            }
            Slot::Pending(ref mut wakers) => {
                match unpinned.waker_token.as_ref() {
                    Some(token) => wakers.replace_waker(token, ctx.waker()),
                    None => {
                        let token = wakers.add_waker(ctx.waker().clone());
                        unpinned.waker_token = Some(token);
                    }
                }

                Poll::Pending
            }
        }
    }
}

impl<V, E> Drop for LoadFuture<V, E> {
    fn drop(&mut self) {
        if let Some(token) = self.waker_token.take() {
            if let Ok(mut slot) = self.slot.try_borrow_mut() {
                if let Slot::Pending(ref mut wakers) = *slot {
                    wakers.discard_waker(token);
                }
            }
        }
    }
}

/// The write side of a [`LoadFuture`]. Each resolver settles its future at
/// most once; a resolver dropped without settling rejects its future with
/// [`LoadError::Disposed`], so no request is ever left hanging.
pub(crate) struct Resolver<V, E> {
    slot: Option<Rc<RefCell<Slot<V, E>>>>,
}

impl<V, E> Resolver<V, E> {
    /// Check if this resolver settles the given future.
    pub(crate) fn settles(&self, future: &LoadFuture<V, E>) -> bool {
        match self.slot {
            Some(ref slot) => Rc::ptr_eq(slot, &future.slot),
            None => false,
        }
    }

    pub(crate) fn resolve(self, value: V) {
        self.settle(Ok(value))
    }

    pub(crate) fn reject(self, error: LoadError<E>) {
        self.settle(Err(error))
    }

    pub(crate) fn settle(mut self, result: Result<V, LoadError<E>>) {
        settle_slot(self.slot.take(), result)
    }
}

fn settle_slot<V, E>(slot: Option<Rc<RefCell<Slot<V, E>>>>, result: Result<V, LoadError<E>>) {
    let slot = match slot {
        Some(slot) => slot,
        None => return,
    };

    // The borrow is released before waking, so that nothing is held if a
    // woken task happens to be polled immediately.
    let wakers = match slot.try_borrow_mut() {
        Ok(mut slot) => slot.settle(result),
        Err(..) => None,
    };

    if let Some(wakers) = wakers {
        wakers.wake_all();
    }
}

impl<V, E> Drop for Resolver<V, E> {
    fn drop(&mut self) {
        settle_slot(self.slot.take(), Err(LoadError::Disposed));
    }
}

impl<V, E> Debug for Resolver<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("slot", &self.slot.as_ref().map(Rc::as_ptr))
            .finish()
    }
}

#[cfg(test)]
impl<V, E> LoadFuture<V, E> {
    pub(crate) fn waiting_wakers(&self) -> usize {
        match *self.slot.borrow() {
            Slot::Pending(ref wakers) => wakers.len(),
            Slot::Settled(..) => 0,
        }
    }
}
