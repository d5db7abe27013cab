//! Small helpers shared across the crate.

/// Runs a closure when dropped.
///
/// Cleanup tied to one of these guards (freeing a pool slot, removing an
/// in-flight entry) also happens when the surrounding future is dropped
/// without ever being polled.
pub struct DeferGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for DeferGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// Defers the execution of the passed function to whenever the returned
/// [`DeferGuard`] is dropped.
pub fn defer<F: FnOnce()>(f: F) -> DeferGuard<F> {
    DeferGuard(Some(f))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn runs_once_on_drop() {
        let calls = AtomicUsize::new(0);
        {
            let _guard = defer(|| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
