use crate::{
    client::{self, AssignError, Delivery, DeliveryId},
    lock::Key,
    queue::Error,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

#[derive(Default)]
struct Ids {
    last: u32,
    assigned: HashMap<Key, DeliveryId>,
}

/// A [client::Client] that hands out sequential delivery ids.
pub struct Client {
    id: u64,
    durable: bool,
    max_ids: usize,
    fail: AtomicBool,
    ids: Mutex<Ids>,
}

impl Client {
    /// Create a client that holds at most `max_ids` delivery ids at once.
    pub fn new(id: u64, durable: bool, max_ids: usize) -> Self {
        Self {
            id,
            durable,
            max_ids,
            fail: AtomicBool::new(false),
            ids: Mutex::new(Ids::default()),
        }
    }

    /// Fail every assignment with [AssignError::AllocationFailed].
    pub fn fail_allocation(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    /// Returns the number of delivery ids held.
    pub fn outstanding(&self) -> usize {
        self.ids.lock().assigned.len()
    }

    /// Restore a delivery id recorded before a restart.
    pub fn restore(&self, key: Key, id: DeliveryId) {
        let mut ids = self.ids.lock();
        ids.last = ids.last.max(id.0);
        ids.assigned.insert(key, id);
    }
}

impl client::Client for Client {
    fn id(&self) -> u64 {
        self.id
    }

    fn durable(&self) -> bool {
        self.durable
    }

    fn assign(&self, key: Key) -> Result<DeliveryId, AssignError> {
        if self.fail.load(Ordering::Acquire) {
            return Err(AssignError::AllocationFailed);
        }
        let mut ids = self.ids.lock();
        if ids.assigned.len() >= self.max_ids {
            return Err(AssignError::Exhausted);
        }
        ids.last += 1;
        let id = DeliveryId(ids.last);
        ids.assigned.insert(key, id);
        Ok(id)
    }

    fn release(&self, key: Key) {
        self.ids.lock().assigned.remove(&key);
    }

    fn inflight(&self, key: Key) -> Option<DeliveryId> {
        self.ids.lock().assigned.get(&key).copied()
    }

    fn max_inflight(&self) -> usize {
        self.max_ids
    }
}

/// A [client::Handler] that records what it is handed.
#[derive(Default)]
pub struct Handler {
    deliveries: Mutex<Vec<Delivery>>,
    /// Deliveries left before the handler asks to be disabled.
    limit: Mutex<Option<usize>>,
    disabled: AtomicUsize,
    evicted: AtomicUsize,
    handle_failures: AtomicBool,
    failures: AtomicUsize,
}

impl Handler {
    /// Decline further deliveries after the next `limit`.
    pub fn set_limit(&self, limit: usize) {
        *self.limit.lock() = Some(limit);
    }

    /// Take the deliveries received so far.
    pub fn take(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.deliveries.lock())
    }

    pub fn disabled_count(&self) -> usize {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn evicted_count(&self) -> usize {
        self.evicted.load(Ordering::Acquire)
    }

    /// Whether delivery failures are reported as handled.
    pub fn handle_failures(&self, handle: bool) {
        self.handle_failures.store(handle, Ordering::Release);
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Acquire)
    }
}

impl client::Handler for Handler {
    fn deliver(&self, delivery: Delivery) -> bool {
        self.deliveries.lock().push(delivery);
        let mut limit = self.limit.lock();
        match *limit {
            Some(remaining) if remaining <= 1 => {
                *limit = None;
                false
            }
            Some(remaining) => {
                *limit = Some(remaining - 1);
                true
            }
            None => true,
        }
    }

    fn delivery_failed(&self, _error: &Error) -> bool {
        self.failures.fetch_add(1, Ordering::AcqRel);
        self.handle_failures.load(Ordering::Acquire)
    }

    fn disabled(&self) {
        self.disabled.fetch_add(1, Ordering::AcqRel);
    }

    fn evicted(&self) {
        self.evicted.fetch_add(1, Ordering::AcqRel);
    }
}
