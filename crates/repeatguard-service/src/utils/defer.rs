/// Guard that runs a closure when dropped, unless it was disarmed.
#[must_use = "the closure runs as soon as the guard is dropped"]
pub struct DeferGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> DeferGuard<F> {
    /// Disarms the guard and hands back the closure without running it.
    pub fn disarm(mut self) -> Option<F> {
        self.0.take()
    }
}

impl<F: FnOnce()> Drop for DeferGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// Defers a closure, returning a `DeferGuard` that will
/// run it when dropped.
///
/// The closure also runs while unwinding, which makes this suitable for cleanup that has to
/// happen on every exit path of a function.
pub fn defer<F: FnOnce()>(f: F) -> DeferGuard<F> {
    DeferGuard(Some(f))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_runs_on_drop() {
        let ran = Cell::new(false);
        {
            let _guard = defer(|| ran.set(true));
            assert!(!ran.get());
        }
        assert!(ran.get());
    }

    #[test]
    fn test_disarmed_guard_does_not_run() {
        let ran = Cell::new(false);
        let guard = defer(|| ran.set(true));
        assert!(guard.disarm().is_some());
        assert!(!ran.get());
    }

    #[test]
    fn test_runs_while_unwinding() {
        let ran = std::sync::atomic::AtomicBool::new(false);
        let result = std::panic::catch_unwind(|| {
            let _guard = defer(|| ran.store(true, std::sync::atomic::Ordering::SeqCst));
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
