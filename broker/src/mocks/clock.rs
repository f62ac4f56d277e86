use std::sync::atomic::{AtomicU32, Ordering};

/// A [crate::clock::Clock] that only moves when told to.
#[derive(Default)]
pub struct Clock {
    now: AtomicU32,
}

impl Clock {
    pub fn set(&self, now: u32) {
        self.now.store(now, Ordering::Release);
    }

    pub fn advance(&self, seconds: u32) {
        self.now.fetch_add(seconds, Ordering::AcqRel);
    }
}

impl crate::clock::Clock for Clock {
    fn now(&self) -> u32 {
        self.now.load(Ordering::Acquire)
    }
}
