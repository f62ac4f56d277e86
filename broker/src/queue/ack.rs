//! Acknowledgement of deliveries.
//!
//! A delivery that expects an acknowledgement is owned by the consumer it was handed to until it
//! is acknowledged ([AckKind::Consumed]), returned ([AckKind::NotReceived],
//! [AckKind::NotDelivered]) or relinquished when its session ends. Ownership is tagged with the
//! generation of the delivery, so a stale or duplicated acknowledgement fails with
//! [Error::AlreadyResolved] instead of touching a later delivery of the same node.

use super::{
    node::{AckOwner, State, HAS_MDR, IN_STORE},
    page::NodeRef,
    replay::Action,
    storage::{Queue, Removal},
    waiter::Consumer,
    Completion, Error,
};
use crate::{
    client::Client,
    lock::Scope,
    message::Reliability,
    store::{Batch, Op, PersistedState, ReferenceState},
    transaction::Transaction,
};
use std::{
    fmt,
    sync::{atomic::Ordering, Arc},
};
use tracing::{debug, info, warn};

/// How a delivery is acknowledged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AckKind {
    /// The consumer is done with the message.
    Consumed,
    /// The message arrived (first phase of a two-phase acknowledgement).
    Received,
    /// The consumer gives the message back.
    NotReceived,
    /// The message never reached the consumer (its delivery is not counted).
    NotDelivered,
}

/// How the in-flight messages of an ending session are resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelinquishKind {
    /// Make every message available to other consumers.
    NackAll,
    /// Consume exactly-once messages (so they can never be seen twice) and return the rest.
    AckHighReliability,
}

/// Identifies one delivery of a message.
#[derive(Clone)]
pub struct DeliveryHandle {
    pub(super) node: NodeRef,
    pub(super) generation: u32,
}

impl DeliveryHandle {
    /// Returns the order id of the delivered message.
    pub fn order_id(&self) -> u64 {
        self.node.order_id()
    }
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("order_id", &self.order_id())
            .field("generation", &self.generation)
            .finish()
    }
}

/// Effects of acknowledgements deferred until the batch moves to another consumer or finishes.
struct Deferred {
    queue: Arc<Queue>,
    consumer: Arc<Consumer>,
    acked: u64,
    recheck: bool,
    rewind: Option<u64>,
}

impl Deferred {
    fn flush(self) -> Completion {
        if let Some(order_id) = self.rewind {
            self.queue.rewind(order_id);
        }
        let completion = self.queue.settle(&self.consumer, self.acked, self.recheck);
        self.queue.unhold();
        completion
    }
}

/// Accumulates the effects of many acknowledgements to the same consumer.
///
/// Counters are settled, cursors rewound and delivery resumed once per run of acknowledgements
/// to the same queue and consumer instead of once per message. Remaining effects are applied by
/// [AckBatch::finish] or when the batch is dropped.
#[derive(Default)]
pub struct AckBatch {
    deferred: Option<Deferred>,
}

impl AckBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the deferred effects for `consumer`, flushing those of another consumer.
    fn bind(&mut self, queue: &Arc<Queue>, consumer: &Arc<Consumer>) -> &mut Deferred {
        let same = self.deferred.as_ref().is_some_and(|deferred| {
            Arc::ptr_eq(&deferred.queue, queue) && Arc::ptr_eq(&deferred.consumer, consumer)
        });
        if !same {
            if let Some(previous) = self.deferred.take() {
                let _ = previous.flush();
            }
            queue.hold();
        }
        self.deferred.get_or_insert_with(|| Deferred {
            queue: queue.clone(),
            consumer: consumer.clone(),
            acked: 0,
            recheck: false,
            rewind: None,
        })
    }

    /// Apply every deferred effect.
    pub fn finish(&mut self) -> Completion {
        match self.deferred.take() {
            Some(deferred) => deferred.flush(),
            None => Completion::Done,
        }
    }
}

impl Drop for AckBatch {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

impl Queue {
    /// Account for `acked` resolved deliveries of `consumer`, resuming delivery if `recheck` is
    /// set or the consumer was throttled.
    pub(super) fn settle(
        self: &Arc<Self>,
        consumer: &Arc<Consumer>,
        acked: u64,
        recheck: bool,
    ) -> Completion {
        if acked > 0 {
            consumer.inflight.fetch_sub(acked, Ordering::AcqRel);
        }
        let unpaused = consumer.paused.swap(false, Ordering::AcqRel);
        if recheck || unpaused {
            return self.check_waiters();
        }
        Completion::Done
    }

    /// Acknowledge a delivery.
    ///
    /// Under a transaction, a consume takes effect when the transaction commits. With `batch`,
    /// resuming delivery is deferred until the batch moves on or finishes.
    pub fn acknowledge(
        self: &Arc<Self>,
        handle: &DeliveryHandle,
        kind: AckKind,
        transaction: Option<&dyn Transaction>,
        batch: Option<&mut AckBatch>,
    ) -> Result<Completion, Error> {
        match kind {
            AckKind::Received => self.receive(handle),
            AckKind::Consumed => match transaction {
                Some(transaction) => self.consume_under(handle, transaction),
                None => self.consume(handle, batch),
            },
            AckKind::NotReceived | AckKind::NotDelivered => {
                let n = handle.node.node();
                let owner = n.disown(handle.generation).ok_or(Error::AlreadyResolved)?;
                self.nack(&handle.node, owner, kind == AckKind::NotDelivered, batch)
            }
        }
    }

    /// Move a delivery to the received state.
    fn receive(self: &Arc<Self>, handle: &DeliveryHandle) -> Result<Completion, Error> {
        let n = handle.node.node();
        let Some((consumer, generation)) = n.owner() else {
            return Err(Error::AlreadyResolved);
        };
        if generation != handle.generation {
            return Err(Error::AlreadyResolved);
        }
        if !n.transition(State::Delivered, State::Received) {
            return match n.state() {
                State::Received => Ok(Completion::Done),
                _ => Err(Error::AlreadyResolved),
            };
        }
        if !consumer.client.durable() || !n.has(IN_STORE) {
            return Ok(Completion::Done);
        }
        n.set(HAS_MDR);
        let mut batch = Batch::new();
        batch.push(Op::UpdateReference {
            owner: self.owner,
            order_id: handle.order_id(),
            state: ReferenceState::new(PersistedState::Received, n.delivery_count()),
        });
        self.commit(batch, |_| {})
    }

    /// Consume a delivery outside a transaction.
    fn consume(
        self: &Arc<Self>,
        handle: &DeliveryHandle,
        batch: Option<&mut AckBatch>,
    ) -> Result<Completion, Error> {
        let node = handle.node.clone();
        let n = node.node();
        let order_id = node.order_id();
        let owner = n.disown(handle.generation).ok_or(Error::AlreadyResolved)?;
        let consumer = owner.consumer.clone();
        drop(owner);
        consumer.acks.lock().remove(&order_id);

        // Out of reach of redelivery while the deletion commits
        n.set_state(State::Discarding);
        let bytes = n.with_message(|message| message.map_or(0, |m| m.len()));
        let mut ops = Batch::new();
        if n.has(IN_STORE) {
            ops.push(Op::DeleteReference {
                owner: self.owner,
                order_id,
            });
        }
        self.unbuffer(bytes);
        let lifted = self.remove_inflight();

        let key = self.key(order_id);
        let client = consumer.client.clone();
        let retired = node.clone();
        let result = self.commit(ops, move |queue| {
            let record = queue.retire(&retired);
            queue.release_record(record);
            client.release(key);
            queue.cleanup_head_pages();
        });
        let completion = match result {
            Ok(completion) => completion,
            Err(err) => {
                // Nothing changed in the store: the message is available again
                warn!(name = self.config.name, order_id, ?err, "failed to consume message");
                consumer.client.release(key);
                n.set_delivery_id(None);
                self.buffer(bytes);
                if n.has(HAS_MDR) {
                    n.clear(HAS_MDR);
                    let mut restore = Batch::new();
                    restore.push(Op::UpdateReference {
                        owner: self.owner,
                        order_id,
                        state: ReferenceState::new(PersistedState::Available, n.delivery_count()),
                    });
                    if let Err(err) = self.commit(restore, |_| {}) {
                        // Recovery makes unclaimed deliveries available again
                        warn!(name = self.config.name, order_id, ?err, "failed to restore persisted state");
                    }
                }
                n.set_state(State::Available);
                self.rewind(order_id);
                let _ = self.settle(&consumer, 1, true);
                return Err(err);
            }
        };
        self.count_removal(Removal::Consumed, 1);
        match batch {
            Some(batch) => {
                let deferred = batch.bind(self, &consumer);
                deferred.acked += 1;
                deferred.recheck |= lifted;
                Ok(completion)
            }
            None => Ok(completion.and(self.settle(&consumer, 1, lifted))),
        }
    }

    /// Consume a delivery when `transaction` commits.
    fn consume_under(
        self: &Arc<Self>,
        handle: &DeliveryHandle,
        transaction: &dyn Transaction,
    ) -> Result<Completion, Error> {
        let node = handle.node.clone();
        let n = node.node();
        if !n.owned_by(handle.generation) {
            return Err(Error::AlreadyResolved);
        }
        let key = self.key(node.order_id());
        self.context
            .locks
            .lock(key, Scope::Commit(transaction.id()), true)?;
        let Some(AckOwner {
            consumer,
            mut softlog,
            ..
        }) = n.disown(handle.generation)
        else {
            self.context.locks.unlock(key);
            return Err(Error::AlreadyResolved);
        };
        consumer.acks.lock().remove(&node.order_id());
        self.hold();
        debug!(name = self.config.name, order_id = node.order_id(), "consumed under transaction");
        softlog.fill(self.clone(), Action::Consume { node, consumer });
        transaction.log(softlog);
        Ok(Completion::Done)
    }

    /// Return a disowned delivery to the available state.
    fn nack(
        self: &Arc<Self>,
        node: &NodeRef,
        owner: AckOwner,
        undelivered: bool,
        batch: Option<&mut AckBatch>,
    ) -> Result<Completion, Error> {
        let consumer = owner.consumer.clone();
        drop(owner);
        consumer.acks.lock().remove(&node.order_id());
        let mut ops = Batch::new();
        self.make_available(node, &consumer.client, undelivered, &mut ops);
        let completion = self.commit(ops, |_| {})?;
        match batch {
            Some(batch) => {
                let deferred = batch.bind(self, &consumer);
                deferred.acked += 1;
                deferred.recheck = true;
                deferred.rewind = Some(
                    deferred
                        .rewind
                        .map_or(node.order_id(), |r| r.min(node.order_id())),
                );
                Ok(completion)
            }
            None => {
                self.rewind(node.order_id());
                Ok(completion.and(self.settle(&consumer, 1, true)))
            }
        }
    }

    /// Release an in-flight node back to `Available`, staging the persisted state change.
    ///
    /// The caller rewinds cursors. Returns whether the in-flight limit was lifted.
    fn make_available(
        &self,
        node: &NodeRef,
        client: &Arc<dyn Client>,
        undelivered: bool,
        ops: &mut Batch,
    ) -> bool {
        let n = node.node();
        let order_id = node.order_id();
        client.release(self.key(order_id));
        n.set_delivery_id(None);
        let count = if undelivered {
            n.undelivered()
        } else {
            n.delivery_count()
        };
        if n.has(HAS_MDR) {
            n.clear(HAS_MDR);
            ops.push(Op::UpdateReference {
                owner: self.owner,
                order_id,
                state: ReferenceState::new(PersistedState::Available, count),
            });
        }
        let lifted = self.remove_inflight();
        n.set_state(State::Available);
        self.track_expiry(node);
        lifted
    }

    /// Resolve a single delivery of an ending session.
    pub fn relinquish(
        self: &Arc<Self>,
        handle: &DeliveryHandle,
        kind: RelinquishKind,
    ) -> Result<Completion, Error> {
        let kind = match kind {
            RelinquishKind::AckHighReliability if Self::high_reliability(&handle.node) => {
                AckKind::Consumed
            }
            _ => AckKind::NotReceived,
        };
        self.acknowledge(handle, kind, None, None)
    }

    fn high_reliability(node: &NodeRef) -> bool {
        node.node().with_message(|message| {
            message.is_some_and(|m| m.header().reliability == Reliability::ExactlyOnce)
        })
    }

    /// Resolve every message in flight to `client`, whether owned by one of its consumers or
    /// left over from a previous session.
    pub fn relinquish_all(self: &Arc<Self>, client: &Arc<dyn Client>, kind: RelinquishKind) -> Completion {
        let mut completion = Completion::Done;
        let mut batch = AckBatch::new();
        let mut orphans = 0;
        let mut rewind: Option<u64> = None;
        for node in self.assigned_nodes() {
            let n = node.node();
            if !n.state().inflight() {
                continue;
            }
            match n.owner() {
                Some((consumer, generation)) => {
                    if consumer.client.id() != client.id()
                        || !consumer.acks.lock().contains_key(&node.order_id())
                    {
                        continue;
                    }
                    let handle = DeliveryHandle {
                        node: node.clone(),
                        generation,
                    };
                    let kind = match kind {
                        RelinquishKind::AckHighReliability if Self::high_reliability(&node) => {
                            AckKind::Consumed
                        }
                        _ => AckKind::NotReceived,
                    };
                    match self.acknowledge(&handle, kind, None, Some(&mut batch)) {
                        Ok(c) => completion = completion.and(c),
                        Err(Error::AlreadyResolved) => {}
                        Err(err) => {
                            warn!(name = self.config.name, order_id = node.order_id(), ?err, "failed to relinquish message")
                        }
                    }
                }
                None => {
                    if let Some(c) = self.relinquish_orphan(&node, client, kind) {
                        orphans += 1;
                        rewind = Some(rewind.map_or(node.order_id(), |r| r.min(node.order_id())));
                        completion = completion.and(c);
                    }
                }
            }
        }
        completion = completion.and(batch.finish());
        if let Some(order_id) = rewind {
            self.rewind(order_id);
            completion = completion.and(self.check_waiters());
        }
        info!(name = self.config.name, client = client.id(), ?kind, orphans, "relinquished messages");
        completion
    }

    /// Resolve an unowned node `client` has in flight.
    fn relinquish_orphan(
        self: &Arc<Self>,
        node: &NodeRef,
        client: &Arc<dyn Client>,
        kind: RelinquishKind,
    ) -> Option<Completion> {
        let n = node.node();
        let key = self.key(node.order_id());
        let consume = kind == RelinquishKind::AckHighReliability && Self::high_reliability(node);
        let mut taken = None;
        let granted = self.context.locks.instant(key, &mut || {
            taken = n
                .unowned(|| {
                    let current = n.state();
                    if !current.inflight() || client.inflight(key).is_none() {
                        return None;
                    }
                    n.transition(current, State::Discarding).then_some(current)
                })
                .flatten();
        });
        if granted.is_err() {
            return None;
        }
        taken?;
        if consume {
            client.release(key);
            let lifted = self.remove_inflight();
            let completion = self.destroy(vec![node.clone()], Removal::Consumed);
            if lifted {
                return Some(completion.and(self.check_waiters()));
            }
            return Some(completion);
        }
        let mut ops = Batch::new();
        let lifted = self.make_available(node, client, false, &mut ops);
        let completion = match self.commit(ops, |_| {}) {
            Ok(completion) => completion,
            Err(err) => {
                warn!(name = self.config.name, order_id = node.order_id(), ?err, "failed to persist relinquish");
                Completion::Done
            }
        };
        if lifted {
            return Some(completion.and(self.check_waiters()));
        }
        Some(completion)
    }

    /// Drop the ownership consumers of `client` hold on their deliveries.
    ///
    /// The messages stay in flight to the client: a later consumer of the same client redelivers
    /// them, and [Queue::relinquish_all] resolves them.
    pub fn forget_inflight(&self, client: &Arc<dyn Client>) -> u64 {
        let mut forgotten = 0;
        for node in self.assigned_nodes() {
            let n = node.node();
            let Some((consumer, generation)) = n.owner() else {
                continue;
            };
            if consumer.client.id() != client.id() {
                continue;
            }
            if !consumer.acks.lock().contains_key(&node.order_id()) {
                continue;
            }
            if n.disown(generation).is_none() {
                continue;
            }
            consumer.acks.lock().remove(&node.order_id());
            consumer.inflight.fetch_sub(1, Ordering::AcqRel);
            forgotten += 1;
        }
        debug!(name = self.config.name, client = client.id(), forgotten, "forgot in-flight messages");
        forgotten
    }

    /// Return every delivery `consumer` holds (it stopped acknowledging).
    pub(super) fn evict(self: &Arc<Self>, consumer: &Arc<Consumer>) -> Completion {
        warn!(name = self.config.name, consumer = consumer.id(), inflight = consumer.inflight(), "evicting consumer");
        consumer.handler.evicted();
        let held: Vec<NodeRef> = consumer.acks.lock().values().cloned().collect();
        let mut batch = AckBatch::new();
        let mut completion = Completion::Done;
        for node in held {
            let Some((owner, generation)) = node.node().owner() else {
                continue;
            };
            if !Arc::ptr_eq(&owner, consumer) {
                continue;
            }
            let handle = DeliveryHandle { node, generation };
            if let Ok(c) = self.acknowledge(&handle, AckKind::NotReceived, None, Some(&mut batch)) {
                completion = completion.and(c);
            }
        }
        completion.and(batch.finish())
    }
}
