//! A mutex that sheds excess waiters instead of queueing them.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A mutex admitting at most `max_waiters` threads to wait for it at once.
///
/// Threads beyond the limit give up immediately, assuming the holder is already doing the work
/// they came to do.
pub struct Limiter {
    lock: Mutex<()>,
    waiters: AtomicUsize,
    max_waiters: usize,
}

/// Holds a [Limiter] until dropped.
pub struct Guard<'a> {
    _guard: MutexGuard<'a, ()>,
    waiters: &'a AtomicUsize,
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Limiter {
    pub fn new(max_waiters: usize) -> Self {
        Self {
            lock: Mutex::new(()),
            waiters: AtomicUsize::new(0),
            max_waiters: max_waiters.max(1),
        }
    }

    /// Wait for the lock unless too many threads already are.
    pub fn enter(&self) -> Option<Guard<'_>> {
        if self.waiters.fetch_add(1, Ordering::AcqRel) >= self.max_waiters {
            self.waiters.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Guard {
            _guard: self.lock.lock(),
            waiters: &self.waiters,
        })
    }

    /// Take the lock only if it is free.
    pub fn try_enter(&self) -> Option<Guard<'_>> {
        let guard = self.lock.try_lock()?;
        self.waiters.fetch_add(1, Ordering::AcqRel);
        Some(Guard {
            _guard: guard,
            waiters: &self.waiters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;

    #[test_traced]
    fn test_sheds_waiters() {
        let limiter = Limiter::new(1);
        let held = limiter.enter().unwrap();
        // The holder counts as the only admitted waiter
        assert!(limiter.enter().is_none());
        assert!(limiter.try_enter().is_none());
        drop(held);
        assert!(limiter.try_enter().is_some());
        assert!(limiter.enter().is_some());
    }
}
