//! Thread-safe wrapper for sequential data sources

use std::sync::{Arc, Mutex, PoisonError};

/// A cloneable handle to a single sequential iterator, safe to drain from
/// multiple threads.
///
/// Every clone advances the same underlying iterator. The mutex is held for
/// exactly one advance and released before the item is handed back, so
/// callers serialize only the advance itself, never their processing. The
/// wrapper does no buffering: one `next` call is one advance of the inner
/// iterator, and exhaustion is forwarded unchanged.
pub struct SharedSource<I> {
    inner: Arc<Mutex<I>>,
}

impl<I> SharedSource<I> {
    /// Wrap an iterator for shared draining
    pub fn new(iter: I) -> Self {
        Self {
            inner: Arc::new(Mutex::new(iter)),
        }
    }
}

impl<I> Clone for SharedSource<I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I: Iterator> Iterator for SharedSource<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        // A panic elsewhere cannot leave the iterator mid-advance, so a
        // poisoned guard is still a valid iterator.
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard.next()
    }
}
