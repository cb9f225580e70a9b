//! Helpers shared by the integration tests.

use std::{cell::RefCell, rc::Rc};

/// Every list of keys a batch function has been called with, in call order.
pub type Calls<K> = Rc<RefCell<Vec<Vec<K>>>>;

/// Wrap a batch function so that every list of keys it's called with is
/// recorded in `calls`.
pub fn recording<K, R>(
    calls: &Calls<K>,
    function: impl Fn(Vec<K>) -> R + 'static,
) -> impl Fn(Vec<K>) -> R + 'static
where
    K: Clone + 'static,
    R: 'static,
{
    let calls = calls.clone();

    move |keys: Vec<K>| {
        calls.borrow_mut().push(keys.clone());
        function(keys)
    }
}
