//! Configuration for [super::Queue].

use crate::{clock::Clock, lock::LockManager, store::Store};
use std::{sync::Arc, time::Duration};

/// Role of a queue in the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// A point-to-point destination.
    Point,
    /// A topic subscription.
    Subscription,
    /// A forwarding link to another server. Space reclamation skips retained messages.
    RemoteServer,
    /// A queue whose messages are never persisted.
    Temporary,
}

/// Strategy used to serialize slot assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PutLockKind {
    /// Block on a mutex.
    Mutex,
    /// Spin (with backoff) until the lock is free.
    Spin,
}

/// What to do with a put when the queue is at its limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Overflow {
    /// Reject the put with [super::Error::DestinationFull].
    Reject,
    /// Discard the oldest available messages to make room.
    DiscardOld,
}

/// Limits applied to a queue. Replaceable at runtime with [super::Queue::set_policy].
#[derive(Clone, Debug)]
pub struct Policy {
    /// Maximum number of buffered messages (0 for unlimited).
    pub max_messages: u64,

    /// Maximum number of buffered bytes (0 for unlimited).
    pub max_bytes: u64,

    /// Behavior when a limit is reached.
    pub overflow: Overflow,

    /// Maximum number of messages in flight to consumers (0 for unlimited).
    pub max_inflight: u64,

    /// Multiple of `max_messages` above which producers are briefly delayed (0 disables).
    pub severe_overfill: u64,

    /// Delay applied to producers while the queue is severely overfilled.
    pub severe_overfill_backoff: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_messages: 0,
            max_bytes: 0,
            overflow: Overflow::Reject,
            max_inflight: 0,
            severe_overfill: 3,
            severe_overfill_backoff: Duration::from_millis(1),
        }
    }
}

impl Policy {
    /// Returns whether `buffered` messages totalling `bytes` reach a limit.
    pub fn full(&self, buffered: u64, bytes: u64) -> bool {
        (self.max_messages > 0 && buffered >= self.max_messages)
            || (self.max_bytes > 0 && bytes >= self.max_bytes)
    }

    /// Returns whether `buffered` messages exceed the severe overfill threshold.
    pub fn severely_overfilled(&self, buffered: u64) -> bool {
        self.severe_overfill > 0
            && self.max_messages > 0
            && buffered >= self.max_messages.saturating_mul(self.severe_overfill)
    }
}

/// Tunables of the space reclaimer.
#[derive(Clone, Debug)]
pub struct Reclaim {
    /// Number of messages claimed before each destroy.
    pub batch: usize,

    /// Number of threads that may queue for the reclaim lock before others give up.
    pub max_waiters: usize,

    /// Percentage of each limit that reclamation reduces the queue to.
    pub survive_percent: u64,

    /// A single call discards at most this multiple of the current overfill.
    pub overfill_multiplier: u64,
}

impl Default for Reclaim {
    fn default() -> Self {
        Self {
            batch: 50,
            max_waiters: 2,
            survive_percent: 95,
            overfill_multiplier: 3,
        }
    }
}

/// Tunables of the page garbage collector.
#[derive(Clone, Debug)]
pub struct Cleanup {
    /// Percentage of wasted slots in the chain above which the middle of the queue is scanned
    /// for consumed pages.
    pub waste_ratio: u64,

    /// Percentage of wasted slots above which the consumer holding the oldest message is
    /// evicted (0 disables eviction).
    pub bad_acker_ratio: u64,

    /// Minimum number of messages a consumer must hold to be evicted.
    pub bad_acker_min_inflight: u64,

    /// Number of references freed between updates of the store's minimum active order id.
    pub watermark_refs: u64,
}

impl Default for Cleanup {
    fn default() -> Self {
        Self {
            waste_ratio: 70,
            bad_acker_ratio: 0,
            bad_acker_min_inflight: 1,
            watermark_refs: 1024,
        }
    }
}

/// Configuration for [super::Queue].
#[derive(Clone, Debug)]
pub struct Config {
    /// Name of the queue (used in logs and metric labels).
    pub name: String,

    /// Role of the queue.
    pub kind: Kind,

    /// Number of nodes on the first pages.
    pub initial_page_capacity: usize,

    /// Largest number of nodes on any page. Pages grow towards this as the queue deepens.
    pub max_page_capacity: usize,

    /// Lock used to serialize slot assignment.
    pub put_lock: PutLockKind,

    /// Maximum number of messages prepared for a consumer before handing them out.
    pub delivery_batch: usize,

    /// Number of earliest-expiring messages remembered by the expiry reaper.
    pub expiry_cache_size: usize,

    /// Space reclaimer tunables.
    pub reclaim: Reclaim,

    /// Page garbage collector tunables.
    pub cleanup: Cleanup,

    /// Initial limits.
    pub policy: Policy,
}

impl Config {
    /// Create a configuration with default tunables.
    pub fn new(name: impl Into<String>, kind: Kind) -> Self {
        Self {
            name: name.into(),
            kind,
            initial_page_capacity: 64,
            max_page_capacity: 1024,
            put_lock: PutLockKind::Mutex,
            delivery_batch: 32,
            expiry_cache_size: 20,
            reclaim: Reclaim::default(),
            cleanup: Cleanup::default(),
            policy: Policy::default(),
        }
    }

    pub(super) fn validate(&self) {
        assert!(
            self.initial_page_capacity > 0,
            "page capacity must be greater than zero"
        );
        assert!(
            self.max_page_capacity >= self.initial_page_capacity,
            "max page capacity must be at least the initial page capacity"
        );
        assert!(
            self.delivery_batch > 0,
            "delivery batch must be greater than zero"
        );
        assert!(self.reclaim.batch > 0, "reclaim batch must be greater than zero");
        assert!(
            self.reclaim.survive_percent <= 100,
            "survive percent must be at most 100"
        );
        assert!(
            self.cleanup.waste_ratio <= 100 && self.cleanup.bad_acker_ratio <= 100,
            "ratios are percentages"
        );
    }
}

/// Collaborators supplied by the embedding broker.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn Store>,
    pub locks: Arc<dyn LockManager>,
    pub clock: Arc<dyn Clock>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;

    #[test_traced]
    fn test_policy_limits() {
        let policy = Policy {
            max_messages: 10,
            max_bytes: 100,
            ..Default::default()
        };
        assert!(!policy.full(9, 99));
        assert!(policy.full(10, 0));
        assert!(policy.full(0, 100));
        assert!(!policy.severely_overfilled(29));
        assert!(policy.severely_overfilled(30));

        let unlimited = Policy::default();
        assert!(!unlimited.full(u64::MAX, u64::MAX));
        assert!(!unlimited.severely_overfilled(u64::MAX));
    }

    #[test_traced]
    #[should_panic(expected = "max page capacity must be at least the initial page capacity")]
    fn test_invalid_page_capacity() {
        let mut config = Config::new("q", Kind::Point);
        config.max_page_capacity = 1;
        config.validate();
    }
}
