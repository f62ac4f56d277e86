//! Removal of expired messages.
//!
//! Puts record the expiry of every message carrying one in a bounded [ExpiryCache] ordered by
//! expiry time. A reap first claims the due entries of the cache. Only when the cache cannot be
//! trusted (it overflowed and ran dry, or a due node was busy) does it walk the whole chain,
//! rebuilding the cache as it goes.

use super::{
    locate::Claim,
    node::{State, EXPIRES},
    page::NodeRef,
    storage::{Queue, Removal, SCAN_IDLE},
};
use std::{
    collections::BTreeSet,
    sync::{atomic::Ordering, Arc},
};
use tracing::debug;

/// Outcome of [Queue::reap].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reap {
    /// The queue was reaped (possibly without finding anything to remove).
    Ok,
    /// No live message carries an expiry: the caller can stop reaping the queue.
    RemoveQueue,
    /// Another thread holds the reaping lock.
    NoExpiryLock,
}

/// The earliest expiries of a queue, keyed by `(expiry, order_id)`.
pub(super) struct ExpiryCache {
    entries: BTreeSet<(u32, u64)>,
    capacity: usize,
    /// Whether every live expiring message has an entry.
    complete: bool,
}

impl ExpiryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeSet::new(),
            capacity: capacity.max(1),
            complete: true,
        }
    }

    /// Track `order_id`, evicting the latest expiry if the cache is full.
    pub fn insert(&mut self, expiry: u32, order_id: u64) {
        self.entries.insert((expiry, order_id));
        if self.entries.len() > self.capacity {
            self.entries.pop_last();
            self.complete = false;
        }
    }

    /// Remove and return the order ids expiring at or before `now`.
    pub fn due(&mut self, now: u32) -> Vec<u64> {
        let later = self.entries.split_off(&(now.saturating_add(1), 0));
        let due = std::mem::replace(&mut self.entries, later);
        due.into_iter().map(|(_, order_id)| order_id).collect()
    }

    /// Returns whether the cache holds an entry for every expiring message.
    pub fn complete(&self) -> bool {
        self.complete
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fold in the entries of `other`.
    pub fn merge(&mut self, other: ExpiryCache) {
        self.complete &= other.complete;
        for (expiry, order_id) in other.entries {
            self.insert(expiry, order_id);
        }
    }
}

impl Queue {
    /// Remove every expired message that no consumer holds.
    ///
    /// Expired messages in flight are left alone: they are removed by a later reap once they
    /// become available again. Deletions of handed out messages that failed to commit are
    /// retried first.
    pub fn reap(self: &Arc<Self>) -> Reap {
        let _ = self.retry_removals();
        if self.counters.with_expiry.load(Ordering::Acquire) == 0 {
            return Reap::RemoveQueue;
        }
        let Some(guard) = self.get_lock.try_enter() else {
            return Reap::NoExpiryLock;
        };
        let now = self.context.clock.now();
        let (due, mut scan) = {
            let mut cache = self.expiry.lock();
            let due = cache.due(now);
            let exhausted = !cache.complete() && cache.is_empty();
            (due, exhausted)
        };

        // Claim what the cache knows about
        let mut claimed = Vec::new();
        let mut kept = Vec::new();
        for (index, order_id) in due.iter().enumerate() {
            let Some(node) = self.find(*order_id) else {
                continue;
            };
            let n = node.node();
            match n.state() {
                State::Consumed | State::Discarding => {}
                state if state.inflight() => kept.push(node),
                _ => match self.claim(&node, State::Discarding) {
                    Claim::Claimed => claimed.push(node),
                    Claim::Skip | Claim::Stop => {
                        // Entries left unexamined are rebuilt by the scan
                        debug!(name = self.config.name, order_id, remaining = due.len() - index, "expiry claim failed");
                        scan = true;
                        break;
                    }
                },
            }
        }
        for node in &kept {
            self.track_expiry(node);
        }

        if scan {
            claimed.extend(self.scan_expired(now));
        }
        drop(guard);

        if !claimed.is_empty() {
            debug!(name = self.config.name, expired = claimed.len(), scan, "reaped expired messages");
            let _ = self.destroy(claimed, Removal::Expired);
        }
        Reap::Ok
    }

    /// Walk the chain, claiming expired messages and rebuilding the expiry cache.
    fn scan_expired(self: &Arc<Self>, now: u32) -> Vec<NodeRef> {
        let capacity = self.config.expiry_cache_size;
        if self
            .expiry_scan
            .compare_exchange(SCAN_IDLE, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Vec::new();
        }

        // Entries tracked while scanning are merged afterwards
        drop(std::mem::replace(
            &mut *self.expiry.lock(),
            ExpiryCache::new(capacity),
        ));
        let mut rebuilt = ExpiryCache::new(capacity);
        let mut claimed = Vec::new();
        let assigned = self.next_order_id.load(Ordering::Acquire);
        let head = self.head.read();
        let mut next = Some(NodeRef::new(head.clone(), 0));
        while let Some(node) = next {
            if node.order_id() >= assigned {
                break;
            }
            self.expiry_scan.store(node.order_id(), Ordering::Release);
            let n = node.node();
            let state = n.state();
            next = node.subsequent();

            // Puts still committing are tracked once published
            if !n.has(EXPIRES) || matches!(state, State::Empty | State::Consumed | State::Discarding) {
                continue;
            }
            let Some(expiry) = n.with_message(|message| message.and_then(|m| m.header().expiry))
            else {
                continue;
            };
            if expiry <= now
                && state == State::Available
                && self.claim(&node, State::Discarding) == Claim::Claimed
            {
                claimed.push(node);
                continue;
            }
            rebuilt.insert(expiry, node.order_id());
        }
        {
            let mut cache = self.expiry.lock();
            let tracked = std::mem::replace(&mut *cache, rebuilt);
            cache.merge(tracked);
        }
        self.expiry_scan.store(SCAN_IDLE, Ordering::Release);
        drop(head);
        debug!(name = self.config.name, claimed = claimed.len(), "scanned for expired messages");
        claimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lock::{LockManager, Scope},
        message::{Header, Message},
        mocks,
        queue::{
            storage::tests::{config, consumer, message, persistent, put, Harness},
            AckKind, Completion, PutOptions,
        },
        transaction::TransactionId,
    };
    use commonware_macros::test_traced;

    fn expiring(expiry: u32) -> Message {
        Message::new(
            Header {
                expiry: Some(expiry),
                ..Default::default()
            },
            &b"expiring"[..],
        )
    }

    #[test_traced]
    fn test_cache_keeps_earliest() {
        let mut cache = ExpiryCache::new(2);
        cache.insert(30, 3);
        cache.insert(10, 1);
        assert!(cache.complete());
        cache.insert(20, 2);
        assert!(!cache.complete());
        assert_eq!(cache.due(25), vec![1, 2]);
        assert!(cache.is_empty());
        assert!(cache.due(100).is_empty());
    }

    #[test_traced]
    fn test_reap_expired() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(4));
        put(&queue, expiring(10));
        put(&queue, expiring(20));
        put(&queue, message(b"forever"));

        harness.clock.set(15);
        assert_eq!(queue.reap(), Reap::Ok);
        let stats = queue.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.buffered, 2);

        harness.clock.set(25);
        assert_eq!(queue.reap(), Reap::Ok);
        assert_eq!(queue.stats().expired, 2);
        assert_eq!(queue.reap(), Reap::RemoveQueue);

        let (_, handler) = consumer(&queue, Arc::new(mocks::Client::new(1, false, 8)), None);
        let order_ids: Vec<_> = handler.take().iter().map(|d| d.order_id).collect();
        assert_eq!(order_ids, vec![3]);
    }

    #[test_traced]
    fn test_inflight_not_expired() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(4));
        put(&queue, expiring(10));
        let (_, handler) = consumer(&queue, Arc::new(mocks::Client::new(1, false, 8)), Some(1));
        let delivery = handler.take().pop().unwrap();

        harness.clock.set(50);
        assert_eq!(queue.reap(), Reap::Ok);
        assert_eq!(queue.stats().expired, 0);

        // Once returned, the message expires
        queue
            .acknowledge(delivery.handle.as_ref().unwrap(), AckKind::NotReceived, None, None)
            .unwrap();
        assert_eq!(queue.reap(), Reap::Ok);
        let stats = queue.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.buffered, 0);
        assert_eq!(queue.reap(), Reap::RemoveQueue);
    }

    #[test_traced]
    fn test_overflowed_cache_scans() {
        let mut harness = Harness::new();
        let mut config = config(4);
        config.expiry_cache_size = 2;
        let queue = harness.queue(config);
        for expiry in (10..15).rev() {
            put(&queue, expiring(expiry));
        }
        assert!(!queue.expiry.lock().complete());

        harness.clock.set(100);
        assert_eq!(queue.reap(), Reap::Ok);
        assert_eq!(queue.stats().expired, 5);
        assert_eq!(queue.expiry_scan.load(Ordering::Acquire), SCAN_IDLE);
        assert_eq!(queue.reap(), Reap::RemoveQueue);
    }

    #[test_traced]
    fn test_locked_message_survives_reap() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(4));
        put(&queue, expiring(10));
        put(&queue, expiring(10));
        let key = queue.key(1);
        harness
            .locks
            .lock(key, Scope::Commit(TransactionId(1)), false)
            .unwrap();

        harness.clock.set(20);
        assert_eq!(queue.reap(), Reap::Ok);
        assert_eq!(queue.stats().expired, 1);

        // The scan kept the locked message tracked
        harness.locks.release_transaction(TransactionId(1));
        assert_eq!(queue.reap(), Reap::Ok);
        assert_eq!(queue.stats().expired, 2);
    }

    #[test_traced]
    fn test_busy_reaper() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(4));
        put(&queue, expiring(10));
        let _guard = queue.get_lock.try_enter().unwrap();
        harness.clock.set(20);
        assert_eq!(queue.reap(), Reap::NoExpiryLock);
    }

    #[test_traced]
    fn test_scan_passes_uncommitted_put() {
        let mut harness = Harness::new();
        let mut config = config(8);
        config.expiry_cache_size = 1;
        let queue = harness.queue(config);
        harness.store.defer(true);
        let completion = queue
            .put(persistent(b"slow"), None, PutOptions::default())
            .unwrap();
        assert_eq!(completion, Completion::Pending);
        harness.store.defer(false);

        // The cache only remembers the first expiring message
        put(&queue, expiring(10));
        put(&queue, expiring(10));
        harness.clock.set(20);
        assert_eq!(queue.reap(), Reap::Ok);
        assert_eq!(queue.stats().expired, 2);

        harness.store.complete_all();
        let stats = queue.stats();
        assert_eq!(stats.buffered, 1);
        assert_eq!(stats.enqueued, 3);
    }
}
