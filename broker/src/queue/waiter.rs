//! Consumers (waiters) attached to a queue.
//!
//! The status of a consumer is one atomic word: a state in the low byte and pending requests in
//! the bits above it. A thread delivering to a consumer "locks" it by moving it from `Enabled` to
//! `Getting`; requests that arrive while it is locked are recorded as pending bits and applied by
//! the locking thread when it unlocks:
//!
//! - `RECHECK`: new messages may be available, so look again before unlocking.
//! - `DISABLE`: disable once the current delivery finishes (completes asynchronously).
//! - `CANCEL_DISABLE`: the consumer was enabled again while a disable was pending.
//! - `DISCONNECT`: detach once the current delivery finishes.

use super::{cursor::Cursor, page::NodeRef};
use crate::client::{Client, Handler, Selector};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

/// State of a consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Disconnected = 0,
    Disabled = 1,
    Enabled = 2,
    Getting = 3,
    Delivering = 4,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Disconnected,
            1 => Self::Disabled,
            2 => Self::Enabled,
            3 => Self::Getting,
            4 => Self::Delivering,
            _ => unreachable!("invalid consumer status: {value}"),
        }
    }

    /// Returns whether a thread is delivering to the consumer.
    pub fn locked(&self) -> bool {
        matches!(self, Self::Getting | Self::Delivering)
    }
}

const STATE_MASK: u32 = 0xff;
pub(super) const RECHECK: u32 = 1 << 8;
pub(super) const DISABLE: u32 = 1 << 9;
pub(super) const CANCEL_DISABLE: u32 = 1 << 10;
pub(super) const DISCONNECT: u32 = 1 << 11;

fn pack(status: Status, pending: u32) -> u32 {
    status as u32 | pending
}

fn unpack(value: u32) -> (Status, u32) {
    (Status::from_u8((value & STATE_MASK) as u8), value & !STATE_MASK)
}

/// Options chosen when attaching a consumer.
#[derive(Clone)]
pub struct Options {
    /// Look at messages without consuming them.
    pub browse: bool,

    /// Only deliver messages matching this predicate.
    pub selector: Option<Selector>,

    /// Whether the consumer acknowledges deliveries. Without acknowledgement every delivery is
    /// consumed as soon as it is handed out.
    pub acknowledge: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            browse: false,
            selector: None,
            acknowledge: true,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("browse", &self.browse)
            .field("selector", &self.selector.is_some())
            .field("acknowledge", &self.acknowledge)
            .finish()
    }
}

/// Outcome of trying to lock a consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Lock {
    /// The caller now delivers to the consumer.
    Acquired,
    /// Another thread is delivering and will look again before unlocking.
    Busy,
    /// The consumer does not want messages.
    Unavailable,
}

/// Outcome of unlocking a consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Unlock {
    /// The consumer is enabled again.
    Enabled,
    /// A recheck was requested: the caller still holds the consumer and must look again.
    Recheck,
    /// The consumer asked to stop and is now disabled.
    Stopped,
    /// A pending disable completed.
    Disabled,
    /// A pending disconnect completed.
    Disconnected,
}

/// A consumer attached to a queue.
pub struct Consumer {
    id: u64,
    status: AtomicU32,
    pub(super) options: Options,
    pub(super) client: Arc<dyn Client>,
    pub(super) handler: Arc<dyn Handler>,

    /// Scan position for selecting, browsing and redelivering consumers.
    pub(super) cursor: Cursor,

    /// Value of the queue's check-waiters counter when this consumer last found nothing.
    pub(super) last_checked: AtomicU64,

    /// Messages delivered to this consumer and not yet acknowledged, by order id.
    pub(super) acks: Mutex<BTreeMap<u64, NodeRef>>,
    pub(super) inflight: AtomicU64,

    /// Delivery ids ran out: stop delivering until an acknowledgement frees one.
    pub(super) paused: AtomicBool,

    /// Messages left in flight from a previous session are delivered first.
    pub(super) redelivering: AtomicBool,
}

impl Consumer {
    pub(super) fn new(
        id: u64,
        options: Options,
        client: Arc<dyn Client>,
        handler: Arc<dyn Handler>,
        cursor: u64,
    ) -> Self {
        let redelivering = client.durable() && !options.browse;
        Self {
            id,
            status: AtomicU32::new(pack(Status::Disabled, 0)),
            options,
            client,
            handler,
            cursor: Cursor::new(cursor),
            last_checked: AtomicU64::new(u64::MAX),
            acks: Mutex::new(BTreeMap::new()),
            inflight: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            redelivering: AtomicBool::new(redelivering),
        }
    }

    /// Returns the identifier of the consumer on its queue.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the current status.
    pub fn status(&self) -> Status {
        unpack(self.status.load(Ordering::Acquire)).0
    }

    /// Returns the client this consumer belongs to.
    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    /// Returns the number of messages delivered and not yet acknowledged.
    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Acquire)
    }

    /// Returns whether the consumer is throttled on delivery ids.
    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Returns whether the consumer scans with its own cursor.
    pub(super) fn scans_own_cursor(&self) -> bool {
        self.options.browse || self.options.selector.is_some()
    }

    fn update(&self, mut f: impl FnMut(Status, u32) -> Option<u32>) -> Result<u32, u32> {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            let (status, pending) = unpack(current);
            let Some(next) = f(status, pending) else {
                return Err(current);
            };
            match self.status.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return Ok(previous),
                Err(actual) => current = actual,
            }
        }
    }

    /// Lock the consumer for delivery, or ask the thread holding it to look again.
    pub(super) fn lock(&self) -> Lock {
        let mut outcome = Lock::Unavailable;
        let _ = self.update(|status, pending| match status {
            Status::Enabled => {
                outcome = Lock::Acquired;
                Some(pack(Status::Getting, pending))
            }
            Status::Getting | Status::Delivering
                if pending & (DISABLE | DISCONNECT) == 0 =>
            {
                outcome = Lock::Busy;
                Some(pack(status, pending | RECHECK))
            }
            _ => {
                outcome = Lock::Unavailable;
                None
            }
        });
        outcome
    }

    /// Mark a locked consumer as handing out messages.
    pub(super) fn delivering(&self) {
        let _ = self.update(|status, pending| {
            status
                .locked()
                .then(|| pack(Status::Delivering, pending))
        });
    }

    /// Unlock the consumer, applying pending requests.
    ///
    /// If `disable` is set the consumer asked to stop (unless it was enabled again meanwhile).
    pub(super) fn unlock(&self, disable: bool) -> Unlock {
        let mut outcome = Unlock::Enabled;
        let result = self.update(|status, pending| {
            assert!(status.locked(), "unlocking a consumer that is not locked");
            if pending & DISCONNECT != 0 {
                outcome = Unlock::Disconnected;
                return Some(pack(Status::Disconnected, 0));
            }
            let cancelled = pending & CANCEL_DISABLE != 0;
            if pending & DISABLE != 0 && !cancelled {
                outcome = Unlock::Disabled;
                return Some(pack(Status::Disabled, 0));
            }
            if disable && !cancelled {
                outcome = Unlock::Stopped;
                return Some(pack(Status::Disabled, 0));
            }
            if pending & (RECHECK | CANCEL_DISABLE) != 0 {
                outcome = Unlock::Recheck;
                return Some(pack(Status::Getting, 0));
            }
            outcome = Unlock::Enabled;
            Some(pack(Status::Enabled, 0))
        });
        debug_assert!(result.is_ok());
        outcome
    }

    /// Enable a disabled consumer.
    pub(super) fn enable(&self) -> Result<bool, Status> {
        let mut locked = false;
        self.update(|status, pending| match status {
            Status::Disabled => {
                locked = false;
                Some(pack(Status::Enabled, pending))
            }
            Status::Getting | Status::Delivering if pending & DISCONNECT == 0 => {
                if pending & DISABLE == 0 && pending & CANCEL_DISABLE == 0 {
                    // Already enabled and busy
                    return None;
                }
                locked = true;
                Some(pack(status, (pending & !DISABLE) | CANCEL_DISABLE))
            }
            _ => None,
        })
        .map(|_| locked)
        .map_err(|current| unpack(current).0)
    }

    /// Disable an enabled consumer.
    ///
    /// Returns `Ok(true)` if the consumer is locked and the disable completes asynchronously.
    pub(super) fn disable(&self) -> Result<bool, Status> {
        let mut pending_disable = false;
        self.update(|status, pending| match status {
            Status::Enabled => {
                pending_disable = false;
                Some(pack(Status::Disabled, pending))
            }
            Status::Getting | Status::Delivering
                if pending & (DISABLE | DISCONNECT) == 0 || pending & CANCEL_DISABLE != 0 =>
            {
                pending_disable = true;
                Some(pack(status, (pending & !CANCEL_DISABLE) | DISABLE))
            }
            _ => None,
        })
        .map(|_| pending_disable)
        .map_err(|current| unpack(current).0)
    }

    /// Disconnect the consumer.
    ///
    /// Returns `Ok(true)` if the consumer is locked and the disconnect completes asynchronously.
    pub(super) fn disconnect(&self) -> Result<bool, Status> {
        let mut deferred = false;
        self.update(|status, pending| match status {
            Status::Disabled | Status::Enabled => {
                deferred = false;
                Some(pack(Status::Disconnected, 0))
            }
            Status::Getting | Status::Delivering if pending & DISCONNECT == 0 => {
                deferred = true;
                Some(pack(status, pending | DISCONNECT))
            }
            _ => None,
        })
        .map(|_| deferred)
        .map_err(|current| unpack(current).0)
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("options", &self.options)
            .field("inflight", &self.inflight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks;
    use commonware_macros::test_traced;

    fn consumer() -> Consumer {
        Consumer::new(
            1,
            Options::default(),
            Arc::new(mocks::Client::new(1, false, 16)),
            Arc::new(mocks::Handler::default()),
            1,
        )
    }

    #[test_traced]
    fn test_lock_cycle() {
        let consumer = consumer();
        assert_eq!(consumer.lock(), Lock::Unavailable);
        assert_eq!(consumer.enable(), Ok(false));
        assert_eq!(consumer.status(), Status::Enabled);

        assert_eq!(consumer.lock(), Lock::Acquired);
        assert_eq!(consumer.status(), Status::Getting);

        // A second thread asks for a recheck
        assert_eq!(consumer.lock(), Lock::Busy);
        consumer.delivering();
        assert_eq!(consumer.status(), Status::Delivering);
        assert_eq!(consumer.unlock(false), Unlock::Recheck);
        assert_eq!(consumer.status(), Status::Getting);
        assert_eq!(consumer.unlock(false), Unlock::Enabled);
        assert_eq!(consumer.status(), Status::Enabled);
    }

    #[test_traced]
    fn test_disable_while_locked() {
        let consumer = consumer();
        consumer.enable().unwrap();
        assert_eq!(consumer.lock(), Lock::Acquired);

        // Completes asynchronously
        assert_eq!(consumer.disable(), Ok(true));
        assert_eq!(consumer.lock(), Lock::Unavailable);
        assert_eq!(consumer.unlock(false), Unlock::Disabled);
        assert_eq!(consumer.status(), Status::Disabled);
        assert_eq!(consumer.disable(), Err(Status::Disabled));
    }

    #[test_traced]
    fn test_enable_cancels_pending_disable() {
        let consumer = consumer();
        consumer.enable().unwrap();
        assert_eq!(consumer.lock(), Lock::Acquired);
        assert_eq!(consumer.disable(), Ok(true));
        assert_eq!(consumer.enable(), Ok(true));
        assert_eq!(consumer.unlock(false), Unlock::Recheck);
        assert_eq!(consumer.unlock(false), Unlock::Enabled);

        // Enabling a busy, enabled consumer is an error
        assert_eq!(consumer.lock(), Lock::Acquired);
        assert_eq!(consumer.enable(), Err(Status::Getting));
        assert_eq!(consumer.unlock(false), Unlock::Enabled);
    }

    #[test_traced]
    fn test_consumer_declines() {
        let consumer = consumer();
        consumer.enable().unwrap();
        assert_eq!(consumer.lock(), Lock::Acquired);
        assert_eq!(consumer.unlock(true), Unlock::Stopped);
        assert_eq!(consumer.status(), Status::Disabled);
    }

    #[test_traced]
    fn test_disconnect_while_locked() {
        let consumer = consumer();
        consumer.enable().unwrap();
        assert_eq!(consumer.lock(), Lock::Acquired);
        assert_eq!(consumer.disconnect(), Ok(true));
        assert_eq!(consumer.disable(), Err(Status::Getting));
        assert_eq!(consumer.unlock(false), Unlock::Disconnected);
        assert_eq!(consumer.status(), Status::Disconnected);
        assert_eq!(consumer.disconnect(), Err(Status::Disconnected));
    }
}
