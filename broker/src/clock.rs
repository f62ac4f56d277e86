//! Source of the current time used for message expiry.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time in seconds since the epoch.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> u32;
}

/// A [Clock] backed by the system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs().min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }
}
