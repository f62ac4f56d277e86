//! Rebuilding a queue from the references held by the store after a restart.
//!
//! Recovery runs in three steps:
//!
//! 1. Every reference of the queue is handed to a [Recovery] with [Recovery::add] (in any order)
//!    and [Recovery::finish] builds the chain. Consumed references are deleted. Delivered and
//!    received references stay in flight without an owner.
//! 2. Clients restore the delivery ids they recorded with [Queue::rehydrate_delivery_id].
//! 3. [Queue::complete_rehydrate] makes in-flight messages no client claimed available again.
//!
//! A durable client that reconnects after step 3 has its in-flight messages redelivered.

use super::{
    config::{Config, Context},
    node::{State, HAS_MDR, IN_STORE, RETAINED},
    page::{NodeRef, Page},
    storage::{Queue, Tail},
    Completion, Error,
};
use crate::{
    client::DeliveryId,
    message::Message,
    store::{Batch, MessageHandle, Op, OwnerHandle, PersistedState, ReferenceState},
};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::{debug, error, info};

struct Entry {
    order_id: u64,
    record: MessageHandle,
    message: Message,
    state: ReferenceState,
}

/// Accumulates the references of a queue being recovered.
pub struct Recovery {
    config: Config,
    context: Context,
    owner: OwnerHandle,
    entries: Vec<Entry>,
}

impl Queue {
    /// Start recovering the queue whose references are owned by `owner`.
    pub fn recover(config: Config, context: Context, owner: OwnerHandle) -> Recovery {
        Recovery {
            config,
            context,
            owner,
            entries: Vec::new(),
        }
    }
}

impl Recovery {
    /// Add the reference at `order_id` to message `record`.
    pub fn add(
        &mut self,
        order_id: u64,
        record: MessageHandle,
        message: Message,
        state: ReferenceState,
    ) -> Result<(), Error> {
        self.entries
            .try_reserve(1)
            .map_err(|_| Error::AllocationFailed)?;
        self.entries.push(Entry {
            order_id,
            record,
            message,
            state,
        });
        Ok(())
    }

    /// Build the queue from the added references.
    ///
    /// Contiguous runs of order ids share pages (of at most the maximum page capacity) and a
    /// fresh page follows the last reference.
    ///
    /// # Panics
    ///
    /// Panics if two references have the same order id.
    pub fn finish(self, registry: &mut Registry) -> Result<Arc<Queue>, Error> {
        let Self {
            config,
            context,
            owner,
            mut entries,
        } = self;
        config.validate();
        entries.sort_by_key(|entry| entry.order_id);
        for pair in entries.windows(2) {
            if pair[0].order_id == pair[1].order_id {
                error!(name = config.name, order_id = pair[0].order_id, "duplicate reference");
                panic!("duplicate slot: {}", pair[0].order_id);
            }
        }

        // Lay out pages over contiguous runs
        let mut pages: Vec<Arc<Page>> = Vec::new();
        let mut start = 0;
        while start < entries.len() {
            let base = entries[start].order_id;
            let mut len = 1;
            while start + len < entries.len()
                && len < config.max_page_capacity
                && entries[start + len].order_id == base + len as u64
            {
                len += 1;
            }
            let page = Page::try_new(base, len)?;
            if let Some(previous) = pages.last() {
                previous.link().complete(page.clone());
            }
            pages.push(page);
            start += len;
        }
        let next = entries.last().map_or(1, |entry| entry.order_id + 1);
        let tail = Page::try_new(next, config.initial_page_capacity)?;
        if let Some(previous) = pages.last() {
            previous.link().complete(tail.clone());
        }
        pages.push(tail.clone());
        let queue = Queue::build(
            config,
            context,
            owner,
            registry,
            pages,
            Tail {
                page: tail,
                index: 0,
            },
        );

        // Fill the nodes
        let mut deleted = Batch::new();
        let mut records = Vec::new();
        let mut live = 0;
        let mut inflight = 0;
        for (entry, node) in entries.into_iter().zip(queue.nodes()) {
            debug_assert_eq!(entry.order_id, node.order_id());
            entry.message.with_record(|record| {
                record.get_or_insert(entry.record);
            });
            let mut flags = IN_STORE;
            if entry.message.header().retained {
                flags |= RETAINED;
            }
            let bytes = entry.message.len();
            let n = node.node();
            n.fill(entry.message, flags);
            n.set_delivery_count(entry.state.delivery_count());
            match entry.state.state() {
                PersistedState::Consumed => {
                    deleted.push(Op::DeleteReference {
                        owner,
                        order_id: node.order_id(),
                    });
                    records.push(queue.retire(&node));
                    continue;
                }
                PersistedState::Available => n.set_state(State::Available),
                PersistedState::Delivered => n.set_state(State::Delivered),
                PersistedState::Received => n.set_state(State::Received),
            }
            if n.state().inflight() {
                n.set(HAS_MDR);
                queue.add_inflight();
                inflight += 1;
            }
            queue.buffer(bytes);
            queue.track_expiry(&node);
            live += 1;
        }
        let deletions = deleted.len();
        queue.commit(deleted, move |queue| {
            for record in records {
                queue.release_record(record);
            }
            queue.cleanup_head_pages();
        })?;
        info!(name = queue.config.name, owner = owner.0, live, inflight, deletions, "recovered queue");
        Ok(queue)
    }
}

impl Queue {
    /// Restore the delivery id a client recorded for the in-flight message at `order_id`.
    pub fn rehydrate_delivery_id(&self, order_id: u64, id: DeliveryId) -> Result<(), Error> {
        let node = self
            .find(order_id)
            .ok_or(Error::UnknownOrderId(order_id))?;
        let n = node.node();
        if !n.state().inflight() || n.owned() {
            return Err(Error::UnknownOrderId(order_id));
        }
        n.set_delivery_id(Some(id));
        debug!(name = self.config.name, order_id, ?id, "rehydrated delivery id");
        Ok(())
    }

    /// Make every recovered in-flight message without a delivery id available again.
    pub fn complete_rehydrate(self: &Arc<Self>) -> Result<Completion, Error> {
        let mut batch = Batch::new();
        let mut released: Vec<NodeRef> = Vec::new();
        for node in self.assigned_nodes() {
            let n = node.node();
            let state = n.state();
            if !state.inflight() || n.delivery_id().is_some() {
                continue;
            }
            if n.unowned(|| n.transition(state, State::Available)) != Some(true) {
                continue;
            }
            if n.has(HAS_MDR) {
                n.clear(HAS_MDR);
                batch.push(Op::UpdateReference {
                    owner: self.owner,
                    order_id: node.order_id(),
                    state: ReferenceState::new(PersistedState::Available, n.delivery_count()),
                });
            }
            self.remove_inflight();
            released.push(node);
        }
        let completion = self.commit(batch, |_| {})?;
        info!(name = self.config.name, released = released.len(), "completed rehydration");
        if let Some(first) = released.first() {
            self.rewind(first.order_id());
        }
        Ok(completion.and(self.check_waiters()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::Header,
        mocks,
        queue::{
            storage::tests::{config, consumer, message, number, numbered, put, Harness},
            AckKind,
        },
        store::Store,
    };
    use commonware_macros::test_traced;

    /// Persist `message` and reference it from `order_id` with `state`.
    fn persist(
        harness: &Harness,
        recovery: &mut Recovery,
        order_id: u64,
        message: Message,
        state: PersistedState,
        count: u8,
    ) {
        let record = harness.store.store_message(&message).unwrap();
        let state = ReferenceState::new(state, count);
        let mut batch = Batch::new();
        batch.push(Op::CreateReference {
            owner: OwnerHandle(7),
            order_id,
            message: record,
            state,
        });
        assert!(harness.store.commit(batch).is_ok());

        // Recovery sees a fresh copy, as if read back from the store
        let copy = Message::new(message.header().clone(), message.payload().clone());
        recovery.add(order_id, record, copy, state).unwrap();
    }

    #[test_traced]
    fn test_recover_rebuilds_queue() {
        let mut harness = Harness::new();
        let mut recovery = Queue::recover(config(4), harness.context(), OwnerHandle(7));
        for (order_id, state) in [
            (5, PersistedState::Delivered),
            (1, PersistedState::Available),
            (4, PersistedState::Consumed),
            (2, PersistedState::Available),
            (3, PersistedState::Available),
        ] {
            persist(&harness, &mut recovery, order_id, numbered(order_id), state, 1);
        }
        let queue = recovery.finish(&mut harness.registry).unwrap();
        let stats = queue.stats();
        assert_eq!(stats.buffered, 4);
        assert_eq!(stats.inflight, 1);
        let order_ids: Vec<_> = harness
            .store
            .references(OwnerHandle(7))
            .iter()
            .map(|(order_id, _, _)| *order_id)
            .collect();
        assert_eq!(order_ids, vec![1, 2, 3, 5]);

        // The durable client still has the delivered message
        let client = Arc::new(mocks::Client::new(1, true, 8));
        client.restore(queue.key(5), DeliveryId(9));
        queue.rehydrate_delivery_id(5, DeliveryId(9)).unwrap();
        assert_eq!(queue.complete_rehydrate().unwrap(), Completion::Done);
        assert_eq!(queue.stats().inflight, 1);

        let (_, handler) = consumer(&queue, client, None);
        let deliveries = handler.take();
        let order_ids: Vec<_> = deliveries.iter().map(|d| d.order_id).collect();
        assert_eq!(order_ids, vec![5, 1, 2, 3]);
        assert!(deliveries[0].redelivered);
        assert_eq!(deliveries[0].delivery_id, Some(DeliveryId(9)));
        assert_eq!(number(&deliveries[1].message), 1);

        // New puts continue after the last reference
        put(&queue, message(b"new"));
        assert_eq!(handler.take()[0].order_id, 6);
    }

    #[test_traced]
    fn test_unclaimed_inflight_made_available() {
        let mut harness = Harness::new();
        let mut recovery = Queue::recover(config(4), harness.context(), OwnerHandle(7));
        persist(&harness, &mut recovery, 1, numbered(1), PersistedState::Received, 2);
        let queue = recovery.finish(&mut harness.registry).unwrap();
        assert_eq!(queue.stats().inflight, 1);

        queue.complete_rehydrate().unwrap();
        assert_eq!(queue.stats().inflight, 0);
        let references = harness.store.references(OwnerHandle(7));
        assert_eq!(
            references[0].2,
            ReferenceState::new(PersistedState::Available, 2)
        );

        let (_, handler) = consumer(&queue, Arc::new(mocks::Client::new(1, false, 8)), None);
        let delivery = handler.take().pop().unwrap();
        assert_eq!(delivery.delivery_count, 3);
        assert!(delivery.redelivered);
        queue
            .acknowledge(delivery.handle.as_ref().unwrap(), AckKind::Consumed, None, None)
            .unwrap();
        assert!(harness.store.references(OwnerHandle(7)).is_empty());
    }

    #[test_traced]
    fn test_recover_across_gaps() {
        let mut harness = Harness::new();
        let mut config = config(2);
        config.max_page_capacity = 2;
        let mut recovery = Queue::recover(config, harness.context(), OwnerHandle(7));
        for order_id in [1, 2, 3, 10, 11] {
            persist(&harness, &mut recovery, order_id, numbered(order_id), PersistedState::Available, 0);
        }
        let queue = recovery.finish(&mut harness.registry).unwrap();

        // Runs of [1, 2], [3], [10, 11] and a fresh tail page
        assert_eq!(queue.stats().pages, 4);
        put(&queue, numbered(12));
        let (_, handler) = consumer(&queue, Arc::new(mocks::Client::new(1, false, 8)), None);
        let order_ids: Vec<_> = handler.take().iter().map(|d| d.order_id).collect();
        assert_eq!(order_ids, vec![1, 2, 3, 10, 11, 12]);
    }

    #[test_traced]
    fn test_recover_expiring() {
        let mut harness = Harness::new();
        let mut recovery = Queue::recover(config(4), harness.context(), OwnerHandle(7));
        let expiring = Message::new(
            Header {
                expiry: Some(10),
                persistent: true,
                ..Default::default()
            },
            &b"expiring"[..],
        );
        persist(&harness, &mut recovery, 1, expiring, PersistedState::Available, 0);
        let queue = recovery.finish(&mut harness.registry).unwrap();
        harness.clock.set(11);
        let _ = queue.reap();
        assert_eq!(queue.stats().expired, 1);
        assert!(harness.store.references(OwnerHandle(7)).is_empty());
    }

    #[test_traced]
    fn test_rehydrate_unknown() {
        let mut harness = Harness::new();
        let mut recovery = Queue::recover(config(4), harness.context(), OwnerHandle(7));
        persist(&harness, &mut recovery, 1, numbered(1), PersistedState::Available, 0);
        let queue = recovery.finish(&mut harness.registry).unwrap();
        assert!(matches!(
            queue.rehydrate_delivery_id(42, DeliveryId(1)),
            Err(Error::UnknownOrderId(42))
        ));

        // Available messages have no delivery id to restore
        assert!(matches!(
            queue.rehydrate_delivery_id(1, DeliveryId(1)),
            Err(Error::UnknownOrderId(1))
        ));
    }

    #[test_traced]
    #[should_panic(expected = "duplicate slot")]
    fn test_duplicate_reference() {
        let mut harness = Harness::new();
        let mut recovery = Queue::recover(config(4), harness.context(), OwnerHandle(7));
        persist(&harness, &mut recovery, 1, numbered(1), PersistedState::Available, 0);
        recovery
            .add(1, MessageHandle(99), numbered(2), ReferenceState::new(PersistedState::Available, 0))
            .unwrap();
        let _ = recovery.finish(&mut harness.registry);
    }
}
