use std::{collections::HashMap, task::Waker};

#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct Token(usize);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// Data structure for managing a collection of wakers that are all interested
/// in a single shared result. Every clone of a [`LoadFuture`] that has been
/// polled while its slot was unsettled owns exactly one entry here; all of
/// them are woken together once the slot settles.
///
/// Wakers can be added to a wakerset; when added, a token associated with the
/// Waker is returned. This token should be associated with a running future
/// and can be used to:
/// - replace the waker on subsequent polls
/// - discard the waker from the wakerset.
/// These tokens cannot be cloned or otherwise duplicated; this helps to ensure
/// that their lifespan are correctly associated with a particular future.
///
/// [`LoadFuture`]: crate::LoadFuture
#[derive(Debug, Default)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,

    // Tokens are an ever-increasing integer. A slot only collects wakers
    // until it settles, so there's no real chance of running out of these.
    next_token: usize,
}

impl WakerSet {
    /// Add a new waker to this set. Return the token associated with this
    /// waker's entry in the set. This token should be associated with the
    /// future, and when the future is re-polled, replace_waker should be
    /// used.
    #[must_use]
    pub(crate) fn add_waker(&mut self, waker: Waker) -> Token {
        let token = Token(self.next_token);
        self.next_token = self.next_token.wrapping_add(1);

        self.wakers.insert(token.duplicate(), waker);
        token
    }

    /// Update the waker stored for an existing token. The waker is passed by
    /// reference and is only cloned if it wouldn't wake the same task as the
    /// one already stored. If the token is unknown, the waker is added under
    /// it instead.
    pub(crate) fn replace_waker(&mut self, token: &Token, waker: &Waker) {
        match self.wakers.get_mut(token) {
            Some(stored) if stored.will_wake(waker) => {}
            Some(stored) => stored.clone_from(waker),
            None => {
                self.wakers.insert(token.duplicate(), waker.clone());
            }
        }
    }

    /// Discard a waker from this set. Used when a future is dropped before
    /// its slot settles.
    pub(crate) fn discard_waker(&mut self, token: Token) {
        self.wakers.remove(&token);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.wakers.len()
    }

    pub(crate) fn wake_all(self) {
        self.wakers
            .into_iter()
            .for_each(|(_token, waker)| waker.wake());
    }
}
