//! Adding messages to the tail of the chain.

use super::{
    config::{Kind, Overflow},
    node::{State, IN_STORE, RETAINED, UNCOMMITTED},
    page::{LinkStatus, NodeRef, Page},
    replay::{Action, SoftLog},
    storage::Queue,
    Completion, Error,
};
use crate::{
    lock::Scope,
    message::Message,
    store::{Batch, MessageHandle, Op, PersistedState, ReferenceState},
    transaction::Transaction,
};
use crossbeam_utils::Backoff;
use std::{
    sync::{atomic::Ordering, Arc},
    thread,
};
use tracing::{debug, warn};

/// Options of a single put.
#[derive(Clone, Copy, Debug, Default)]
pub struct PutOptions {
    /// Mark the message retained (never reclaimed by forwarding queues).
    pub propagate_retained: bool,
}

impl Queue {
    /// Add a message to the queue.
    ///
    /// Without a transaction the message becomes available once its reference is committed
    /// (returning [Completion::Pending] if that commit completes asynchronously). Under a
    /// transaction the message stays invisible until the transaction commits.
    pub fn put(
        self: &Arc<Self>,
        message: Message,
        transaction: Option<&dyn Transaction>,
        options: PutOptions,
    ) -> Result<Completion, Error> {
        if self.is_deleted() {
            return Err(Error::QueueDeleted);
        }
        self.admit()?;

        // Persist the message record (or share the one another queue created)
        let record = if self.persists(&message) {
            let record = self.add_record(&message)?;
            if let Err(err) = self.context.store.reserve(1) {
                self.release_record(Some(record));
                return Err(err.into());
            }
            Some(record)
        } else {
            None
        };
        let result = self.enqueue(message, record, transaction, options);
        if result.is_err() {
            self.release_record(record);
        }
        result
    }

    fn persists(&self, message: &Message) -> bool {
        message.header().persistent && self.config.kind != Kind::Temporary
    }

    /// Apply the queue's limits to a new put.
    fn admit(self: &Arc<Self>) -> Result<(), Error> {
        let policy = self.policy();
        let buffered = self.counters.buffered.load(Ordering::Acquire);
        let bytes = self.counters.bytes.load(Ordering::Acquire);
        if policy.full(buffered, bytes) {
            match policy.overflow {
                Overflow::Reject => {
                    self.counters.rejected.fetch_add(1, Ordering::AcqRel);
                    self.metrics.rejected.inc();
                    debug!(name = self.config.name, buffered, bytes, "rejected put");
                    return Err(Error::DestinationFull);
                }
                Overflow::DiscardOld => {
                    let _ = self.reclaim(&policy);
                }
            }
        }
        if policy.severely_overfilled(self.counters.buffered.load(Ordering::Acquire)) {
            warn!(name = self.config.name, buffered, "queue severely overfilled");
            thread::sleep(policy.severe_overfill_backoff);
        }
        Ok(())
    }

    fn add_record(&self, message: &Message) -> Result<MessageHandle, Error> {
        message.with_record(|record| match *record {
            Some(handle) => {
                self.context.store.add_message_usage(handle)?;
                Ok(handle)
            }
            None => {
                let handle = self.context.store.store_message(message)?;
                *record = Some(handle);
                Ok(handle)
            }
        })
    }

    fn enqueue(
        self: &Arc<Self>,
        message: Message,
        record: Option<MessageHandle>,
        transaction: Option<&dyn Transaction>,
        options: PutOptions,
    ) -> Result<Completion, Error> {
        let softlog = match transaction {
            Some(_) => Some(SoftLog::reserve()?),
            None => None,
        };
        let node = self.assign()?;
        let order_id = node.order_id();
        let bytes = message.len();
        self.buffer(bytes);

        let mut flags = 0;
        if record.is_some() {
            flags |= IN_STORE;
        }
        if options.propagate_retained || message.header().retained {
            flags |= RETAINED;
        }
        let create = record.map(|message| Op::CreateReference {
            owner: self.owner,
            order_id,
            message,
            state: ReferenceState::new(PersistedState::Available, 0),
        });

        // Transactional puts stay locked (and invisible) until the transaction resolves
        if let (Some(transaction), Some(mut softlog)) = (transaction, softlog) {
            let key = self.key(order_id);
            if let Err(err) = self
                .context
                .locks
                .lock(key, Scope::Commit(transaction.id()), false)
            {
                self.abandon(&node, bytes);
                return Err(err.into());
            }
            node.node().fill(message, flags | UNCOMMITTED);
            node.node().set_state(State::Available);
            if let Some(op) = create {
                transaction.stage(op);
            }
            self.hold();
            softlog.fill(self.clone(), Action::Put { node });
            transaction.log(softlog);
            debug!(name = self.config.name, order_id, "put under transaction");
            return Ok(Completion::Done);
        }

        node.node().fill(message, flags);
        let mut batch = Batch::new();
        if let Some(op) = create {
            batch.push(op);
        }
        let committed = node.clone();
        match self.commit(batch, move |queue| queue.publish(committed)) {
            Ok(completion) => Ok(completion),
            Err(err) => {
                warn!(name = self.config.name, order_id, ?err, "failed to commit put");
                self.abandon(&node, bytes);
                Err(err)
            }
        }
    }

    /// Make a committed put visible.
    fn publish(self: &Arc<Self>, node: NodeRef) {
        node.node().set_state(State::Available);
        self.track_expiry(&node);
        self.counters.enqueued.fetch_add(1, Ordering::AcqRel);
        self.metrics.enqueued.inc();
        self.bump();
        let _ = self.check_waiters();
        self.reclaim_if_full();
    }

    /// Give up an assigned slot, leaving a consumed hole.
    pub(super) fn abandon(self: &Arc<Self>, node: &NodeRef, bytes: u64) {
        let _ = self.retire(node);
        self.unbuffer(bytes);
        // A getter may have stopped at the empty slot
        self.bump();
        let _ = self.check_waiters();
        self.cleanup_head_pages();
    }

    /// Assign the next slot at the tail.
    fn assign(&self) -> Result<NodeRef, Error> {
        let backoff = Backoff::new();
        loop {
            let mut tail = self.put_lock.lock();
            if tail.index < tail.page.len() {
                let node = NodeRef::new(tail.page.clone(), tail.index);
                tail.index += 1;
                self.next_order_id
                    .store(node.order_id() + 1, Ordering::Release);
                let last = tail.index == tail.page.len();
                drop(tail);

                // The producer taking the last node links the next page
                if last && node.page().link().status() == LinkStatus::Unfinished {
                    let _ = self.extend(node.page());
                }
                return Ok(node);
            }

            let page = tail.page.clone();
            match page.link().status() {
                LinkStatus::Completed => {
                    if let Some(next) = page.next() {
                        tail.page = next;
                        tail.index = 0;
                    }
                }
                LinkStatus::Unfinished | LinkStatus::Repairing => {
                    drop(tail);
                    backoff.snooze();
                }
                LinkStatus::Failed => {
                    drop(tail);
                    if page.link().begin_repair() {
                        self.extend(&page)?;
                    } else {
                        backoff.snooze();
                    }
                }
            }
        }
    }

    /// Capacity of the next page, growing with the depth of the queue.
    fn next_page_capacity(&self) -> usize {
        let half = self.counters.buffered.load(Ordering::Acquire) / 2;
        (half.next_power_of_two() as usize).clamp(
            self.config.initial_page_capacity,
            self.config.max_page_capacity,
        )
    }

    /// Allocate and link the page following `page`.
    fn extend(&self, page: &Arc<Page>) -> Result<(), Error> {
        let capacity = self.next_page_capacity();
        match Page::try_new(page.end(), capacity) {
            Ok(next) => {
                let end = next.end();
                page.link().complete(next);
                self.slots.fetch_add(capacity as u64, Ordering::AcqRel);
                self.pages.fetch_add(1, Ordering::AcqRel);
                self.metrics.pages.inc();
                self.frontier.fetch_max(end, Ordering::AcqRel);
                debug!(name = self.config.name, base = page.end(), capacity, "linked page");
                Ok(())
            }
            Err(err) => {
                page.link().fail();
                warn!(name = self.config.name, base = page.end(), capacity, "failed to allocate page");
                Err(err)
            }
        }
    }
}
