//! Matching available messages with enabled consumers.
//!
//! [Queue::check_waiters] visits every attached consumer once, starting at a rotating offset so
//! that no consumer is always served first. A visited consumer is locked (at most one thread
//! delivers to a consumer at a time) and served in batches: messages are located and prepared,
//! the store operations recording the deliveries are committed, and only then are the messages
//! handed to the consumer's [crate::client::Handler]. A thread that finds a consumer locked asks
//! the delivering thread to look again before it unlocks.

use super::{
    ack::DeliveryHandle,
    locate::Locate,
    node::{AckOwner, State, HAS_MDR, IN_STORE},
    page::NodeRef,
    replay::SoftLog,
    storage::Queue,
    waiter::{Consumer, Lock, Unlock},
    Completion, Error,
};
use crate::{
    client::{AssignError, Delivery, DeliveryId},
    message::{Message, Reliability},
    store::{Batch, Commit, Op, PersistedState, ReferenceState},
};
use std::sync::{atomic::Ordering, Arc};
use tracing::{debug, error, warn};

/// How a prepared message is handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    /// Looked at by a browser. The node stays available.
    Browse,
    /// No acknowledgement expected. Consumed once handed out.
    Unacked,
    /// Owned by the consumer until acknowledged.
    Acked,
    /// Left in flight by a previous session and adopted by the consumer.
    Redelivery,
}

/// A message located and prepared for delivery.
struct Prepared {
    kind: Kind,
    node: NodeRef,
    message: Message,
    state: PersistedState,
    delivery_id: Option<DeliveryId>,
    delivery_count: u8,
    generation: u32,
    /// A delivered state was staged for the node's reference.
    persisted: bool,
}

impl Prepared {
    fn delivery(&self) -> Delivery {
        let handle = matches!(self.kind, Kind::Acked | Kind::Redelivery).then(|| DeliveryHandle {
            node: self.node.clone(),
            generation: self.generation,
        });
        Delivery {
            handle,
            message: self.message.clone(),
            order_id: self.node.order_id(),
            state: self.state,
            delivery_id: self.delivery_id,
            delivery_count: self.delivery_count,
            redelivered: self.kind == Kind::Redelivery || self.delivery_count > 1,
        }
    }
}

/// Why preparing a message failed.
enum Throttle {
    /// The client has no delivery ids left.
    MaxDeliveryIds,
    /// Memory for the delivery could not be allocated.
    AllocationFailed,
    /// The node was taken by someone else.
    Lost,
}

/// Outcome of serving one batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    /// The batch was full: look for more.
    More,
    /// Nothing left for the consumer.
    Exhausted,
    /// The consumer asked to stop.
    Declined,
    /// Delivery continues once a store commit completes.
    Pending,
}

/// Why a batch ended before it was full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum End {
    Full,
    NoMessage,
    NoMessageForConsumer,
    MaxDeliveryIds,
    AllocationFailed,
    Prevented,
}

impl Queue {
    /// Deliver available messages to enabled consumers.
    pub fn check_waiters(self: &Arc<Self>) -> Completion {
        // Browsing takes no in-flight slot
        let prevented = self.full_delivery_prevention.load(Ordering::Acquire);
        let mut completion = Completion::Done;
        for consumer in self.rotation() {
            if prevented && !consumer.options.browse {
                continue;
            }
            if !self.worth_checking(&consumer) {
                continue;
            }
            if consumer.lock() == Lock::Acquired {
                completion = completion.and(self.serve(consumer));
            }
        }
        completion
    }

    /// Returns whether anything changed since the consumer last found nothing.
    fn worth_checking(&self, consumer: &Consumer) -> bool {
        if consumer.paused() {
            return false;
        }
        !consumer.scans_own_cursor()
            || consumer.last_checked.load(Ordering::Acquire)
                != self.check_waiters_val.load(Ordering::Acquire)
    }

    /// Deliver to a locked consumer until it has nothing left or asks to stop.
    fn serve(self: &Arc<Self>, consumer: Arc<Consumer>) -> Completion {
        let mut completion = Completion::Done;
        loop {
            let (step, removed) = self.serve_batch(&consumer);
            completion = completion.and(removed);
            if step == Step::Pending {
                return Completion::Pending;
            }
            if !self.settle_step(&consumer, step) {
                return completion;
            }
        }
    }

    /// Apply the outcome of a batch, returning whether to keep serving.
    fn settle_step(&self, consumer: &Arc<Consumer>, step: Step) -> bool {
        match step {
            Step::More => true,
            Step::Pending => false,
            Step::Exhausted => self.release_waiter(consumer, false) == Unlock::Recheck,
            Step::Declined => self.release_waiter(consumer, true) == Unlock::Recheck,
        }
    }

    /// Unlock a consumer, completing requests that arrived while it was locked.
    fn release_waiter(&self, consumer: &Arc<Consumer>, declined: bool) -> Unlock {
        let unlock = consumer.unlock(declined);
        match unlock {
            Unlock::Disabled => consumer.handler.disabled(),
            Unlock::Disconnected => {
                self.remove_waiter(consumer);
                consumer.handler.disabled();
            }
            Unlock::Enabled | Unlock::Recheck | Unlock::Stopped => {}
        }
        unlock
    }

    /// Number of messages prepared for a consumer before handing them out.
    fn batch_limit(&self, consumer: &Consumer) -> usize {
        let max_inflight = consumer.client.max_inflight();
        if max_inflight == 0 {
            return self.config.delivery_batch;
        }
        self.config.delivery_batch.min((max_inflight / 4).max(1))
    }

    /// Deliver one batch, returning how it ended and the completion of removing the messages
    /// consumed by handing them out.
    fn serve_batch(self: &Arc<Self>, consumer: &Arc<Consumer>) -> (Step, Completion) {
        let checked = self.check_waiters_val.load(Ordering::Acquire);
        let limit = self.batch_limit(consumer);
        let mut prepared = Vec::new();
        let mut batch = Batch::new();
        let mut end = End::Full;
        while prepared.len() < limit {
            if !consumer.options.browse && self.inflight_capped() {
                end = End::Prevented;
                break;
            }
            let result = match self.locate(consumer) {
                Locate::Found(node) => self.prepare(consumer, node, &mut batch),
                Locate::Redeliver(node) => self.prepare_redelivery(consumer, node, &mut batch),
                Locate::Browsed(node, message) => Ok(Prepared {
                    kind: Kind::Browse,
                    state: PersistedState::Available,
                    delivery_id: None,
                    delivery_count: node.node().delivery_count(),
                    generation: 0,
                    persisted: false,
                    node,
                    message,
                }),
                Locate::NoMessage => {
                    end = End::NoMessage;
                    break;
                }
                Locate::NoMessageForConsumer => {
                    end = End::NoMessageForConsumer;
                    break;
                }
            };
            match result {
                Ok(item) => prepared.push(item),
                Err(Throttle::Lost) => {}
                Err(Throttle::MaxDeliveryIds) => {
                    end = End::MaxDeliveryIds;
                    break;
                }
                Err(Throttle::AllocationFailed) => {
                    end = End::AllocationFailed;
                    break;
                }
            }
        }

        match end {
            End::NoMessageForConsumer => consumer.last_checked.store(checked, Ordering::Release),
            End::NoMessage if consumer.scans_own_cursor() => {
                consumer.last_checked.store(checked, Ordering::Release)
            }
            _ => {}
        }
        if end == End::AllocationFailed {
            self.undo(consumer, prepared);
            return (
                self.fail_consumer(consumer, Error::AllocationFailed),
                Completion::Done,
            );
        }
        let after = match end {
            End::Full => Step::More,
            End::MaxDeliveryIds => self.throttle(consumer),
            End::NoMessage | End::NoMessageForConsumer | End::Prevented | End::AllocationFailed => {
                Step::Exhausted
            }
        };
        if prepared.is_empty() {
            return (after, Completion::Done);
        }

        // Record the deliveries before anyone sees them
        consumer.delivering();
        if batch.is_empty() {
            return self.hand_out(consumer, prepared, after);
        }
        match self.context.store.commit(batch) {
            Ok(Commit::Done) => self.hand_out(consumer, prepared, after),
            Ok(Commit::Pending(pending)) => {
                self.hold();
                let queue = self.clone();
                let consumer = consumer.clone();
                pending.then(move |result| {
                    queue.expect_committed(result);

                    // Pending removals keep the queue held until they complete
                    let (step, _) = queue.hand_out(&consumer, prepared, after);
                    if queue.settle_step(&consumer, step) {
                        let _ = queue.serve(consumer);
                    }
                    queue.unhold();
                });
                (Step::Pending, Completion::Done)
            }
            Err(err) => {
                warn!(name = self.config.name, consumer = consumer.id(), ?err, "failed to record deliveries");
                self.undo(consumer, prepared);
                (Step::Exhausted, Completion::Done)
            }
        }
    }

    /// Stop delivering to a consumer that ran out of delivery ids.
    fn throttle(&self, consumer: &Consumer) -> Step {
        // Acknowledgements unpause the consumer
        consumer.paused.store(true, Ordering::Release);
        if consumer.inflight() > 0 {
            debug!(name = self.config.name, consumer = consumer.id(), "paused consumer");
            return Step::Exhausted;
        }
        consumer.paused.store(false, Ordering::Release);
        warn!(name = self.config.name, consumer = consumer.id(), "no delivery ids available");
        consumer.handler.disabled();
        Step::Declined
    }

    /// Disconnect a consumer after a delivery failure it must hear about.
    fn fail_consumer(&self, consumer: &Arc<Consumer>, err: Error) -> Step {
        if !consumer.handler.delivery_failed(&err) {
            error!(name = self.config.name, consumer = consumer.id(), ?err, "unhandled delivery failure");
            panic!("unhandled delivery failure: {err}");
        }
        warn!(name = self.config.name, consumer = consumer.id(), ?err, "disconnecting consumer");
        let _ = consumer.disconnect();
        Step::Exhausted
    }

    /// Prepare a claimed node for delivery.
    fn prepare(
        &self,
        consumer: &Arc<Consumer>,
        node: NodeRef,
        batch: &mut Batch,
    ) -> Result<Prepared, Throttle> {
        let n = node.node();
        let Some(message) = n.message() else {
            error!(name = self.config.name, order_id = node.order_id(), "claimed node without message");
            panic!("claimed node without message: {}", node.order_id());
        };
        let acknowledged = consumer.options.acknowledge
            && message.header().reliability != Reliability::AtMostOnce;
        if !acknowledged {
            let delivery_count = n.delivered();
            return Ok(Prepared {
                kind: Kind::Unacked,
                node,
                message,
                state: PersistedState::Consumed,
                delivery_id: None,
                delivery_count,
                generation: 0,
                persisted: false,
            });
        }

        let Ok(softlog) = SoftLog::reserve() else {
            self.unclaim(&node);
            return Err(Throttle::AllocationFailed);
        };

        // Owned before the client knows the id, so no redelivery can adopt it
        let generation = n.next_generation();
        n.own(AckOwner {
            consumer: consumer.clone(),
            generation,
            softlog,
        });
        let key = self.key(node.order_id());
        let delivery_id = match consumer.client.assign(key) {
            Ok(id) => id,
            Err(err) => {
                let _ = n.disown(generation);
                self.unclaim(&node);
                return Err(match err {
                    AssignError::Exhausted => Throttle::MaxDeliveryIds,
                    AssignError::AllocationFailed => Throttle::AllocationFailed,
                });
            }
        };
        let delivery_count = n.delivered();
        n.set_delivery_id(Some(delivery_id));
        let persisted = consumer.client.durable() && n.has(IN_STORE);
        if persisted {
            n.set(HAS_MDR);
            batch.push(Op::UpdateReference {
                owner: self.owner,
                order_id: node.order_id(),
                state: ReferenceState::new(PersistedState::Delivered, delivery_count),
            });
        }
        consumer.acks.lock().insert(node.order_id(), node.clone());
        consumer.inflight.fetch_add(1, Ordering::AcqRel);
        self.add_inflight();
        Ok(Prepared {
            kind: Kind::Acked,
            node,
            message,
            state: PersistedState::Delivered,
            delivery_id: Some(delivery_id),
            delivery_count,
            generation,
            persisted,
        })
    }

    /// Adopt a node left in flight by a previous session of the consumer's client.
    fn prepare_redelivery(
        &self,
        consumer: &Arc<Consumer>,
        node: NodeRef,
        batch: &mut Batch,
    ) -> Result<Prepared, Throttle> {
        let n = node.node();
        let key = self.key(node.order_id());
        let Some(message) = n.message() else {
            return Err(Throttle::Lost);
        };
        let Ok(softlog) = SoftLog::reserve() else {
            return Err(Throttle::AllocationFailed);
        };
        let generation = n.next_generation();
        let owner = AckOwner {
            consumer: consumer.clone(),
            generation,
            softlog,
        };
        if n.adopt(owner).is_err() {
            return Err(Throttle::Lost);
        }
        let delivery_id = n.delivery_id().or_else(|| consumer.client.inflight(key));
        n.set_delivery_id(delivery_id);
        let delivery_count = n.delivered();
        let state = n.state().persisted();
        let persisted = consumer.client.durable() && n.has(IN_STORE);
        if persisted {
            n.set(HAS_MDR);
            batch.push(Op::UpdateReference {
                owner: self.owner,
                order_id: node.order_id(),
                state: ReferenceState::new(state, delivery_count),
            });
        }
        consumer.acks.lock().insert(node.order_id(), node.clone());
        consumer.inflight.fetch_add(1, Ordering::AcqRel);
        debug!(name = self.config.name, consumer = consumer.id(), order_id = node.order_id(), "redelivering");
        Ok(Prepared {
            kind: Kind::Redelivery,
            node,
            message,
            state,
            delivery_id,
            delivery_count,
            generation,
            persisted,
        })
    }

    /// Hand prepared messages to the consumer's handler.
    fn hand_out(
        self: &Arc<Self>,
        consumer: &Arc<Consumer>,
        prepared: Vec<Prepared>,
        after: Step,
    ) -> (Step, Completion) {
        let mut consumed = Vec::new();
        let mut remaining = prepared.into_iter();
        let mut declined = false;
        for item in remaining.by_ref() {
            let delivery = item.delivery();
            if item.kind == Kind::Unacked {
                consumed.push(item.node);
            }
            if !consumer.handler.deliver(delivery) {
                declined = true;
                break;
            }
        }
        if declined {
            self.undo(consumer, remaining.collect());
        }

        // Unacknowledged deliveries are gone once handed out
        let completion = if consumed.is_empty() {
            Completion::Done
        } else {
            self.remove_delivered(consumed)
        };
        if declined {
            debug!(name = self.config.name, consumer = consumer.id(), "consumer declined delivery");
            return (Step::Declined, completion);
        }
        (after, completion)
    }

    /// Return prepared messages that were not handed out.
    fn undo(self: &Arc<Self>, consumer: &Arc<Consumer>, prepared: Vec<Prepared>) {
        let mut batch = Batch::new();
        let mut rewind: Option<u64> = None;
        let mut browsed: Option<u64> = None;
        let mut lifted = false;
        for item in prepared {
            let order_id = item.node.order_id();
            let n = item.node.node();
            match item.kind {
                Kind::Browse => {
                    browsed = Some(browsed.map_or(order_id, |b| b.min(order_id)));
                }
                Kind::Unacked => {
                    n.undelivered();
                    n.transition(State::Delivered, State::Available);
                    rewind = Some(rewind.map_or(order_id, |r| r.min(order_id)));
                }
                Kind::Acked => {
                    if n.disown(item.generation).is_none() {
                        continue;
                    }
                    consumer.acks.lock().remove(&order_id);
                    consumer.client.release(self.key(order_id));
                    n.set_delivery_id(None);
                    consumer.inflight.fetch_sub(1, Ordering::AcqRel);
                    lifted |= self.remove_inflight();
                    let count = n.undelivered();
                    if item.persisted {
                        n.clear(HAS_MDR);
                        batch.push(Op::UpdateReference {
                            owner: self.owner,
                            order_id,
                            state: ReferenceState::new(PersistedState::Available, count),
                        });
                    }
                    n.transition(State::Delivered, State::Available);
                    rewind = Some(rewind.map_or(order_id, |r| r.min(order_id)));
                }
                Kind::Redelivery => {
                    if n.disown(item.generation).is_none() {
                        continue;
                    }
                    consumer.acks.lock().remove(&order_id);
                    consumer.inflight.fetch_sub(1, Ordering::AcqRel);
                    n.undelivered();
                    consumer.cursor.rewind(order_id);
                    consumer.redelivering.store(true, Ordering::Release);
                }
            }
        }
        if let Some(order_id) = browsed {
            consumer.cursor.rewind(order_id);
        }
        if let Some(order_id) = rewind {
            self.rewind(order_id);
        }
        if !batch.is_empty() {
            if let Err(err) = self.commit(batch, |_| {}) {
                warn!(name = self.config.name, ?err, "failed to record undelivered messages");
            }
        }
        if lifted {
            let _ = self.check_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks,
        queue::{
            config::Policy,
            storage::tests::{config, consumer, message, numbered, persistent, put, Harness},
            AckKind, Options, Position, Status,
        },
        store::OwnerHandle,
    };
    use commonware_macros::test_traced;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::{collections::HashSet, thread};

    #[test_traced]
    fn test_batch_limited_by_client() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(8));
        let client = Arc::new(mocks::Client::new(1, false, 8));
        let sampled = Consumer::new(
            1,
            Options::default(),
            client.clone(),
            Arc::new(mocks::Handler::default()),
            1,
        );
        assert_eq!(queue.batch_limit(&sampled), 2);

        for i in 0..5 {
            put(&queue, numbered(i));
        }
        let (_, handler) = consumer(&queue, client, None);
        assert_eq!(handler.take().len(), 5);
    }

    #[test_traced]
    fn test_rotation_shares_messages() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(8));
        let (_, first) = consumer(&queue, Arc::new(mocks::Client::new(1, false, 64)), None);
        let (_, second) = consumer(&queue, Arc::new(mocks::Client::new(2, false, 64)), None);
        for i in 0..10 {
            put(&queue, numbered(i));
        }
        let first = first.take().len();
        let second = second.take().len();
        assert_eq!(first + second, 10);
        assert!(first > 0 && second > 0);
    }

    #[test_traced]
    fn test_max_delivery_ids_pauses() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(8));
        for i in 0..4 {
            put(&queue, numbered(i));
        }
        let client = Arc::new(mocks::Client::new(1, false, 2));
        let (consumer, handler) = consumer(&queue, client, None);
        let deliveries = handler.take();
        assert_eq!(deliveries.len(), 2);
        assert!(consumer.paused());
        assert_eq!(consumer.status(), Status::Enabled);

        // An acknowledgement frees an id and resumes delivery
        queue
            .acknowledge(deliveries[0].handle.as_ref().unwrap(), AckKind::Consumed, None, None)
            .unwrap();
        assert!(!consumer.paused());
        let order_ids: Vec<_> = handler.take().iter().map(|d| d.order_id).collect();
        assert_eq!(order_ids, vec![3]);
    }

    #[test_traced]
    fn test_max_delivery_ids_without_inflight_disables() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(8));
        put(&queue, message(b"m"));
        let client = Arc::new(mocks::Client::new(1, false, 0));
        let (consumer, handler) = consumer(&queue, client, None);
        assert!(handler.take().is_empty());
        assert_eq!(consumer.status(), Status::Disabled);
        assert_eq!(handler.disabled_count(), 1);
        assert_eq!(queue.stats().buffered, 1);
        assert_eq!(queue.position(), Position::At(1));
    }

    #[test_traced]
    fn test_allocation_failure_disconnects() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(8));
        put(&queue, message(b"m"));
        let client = Arc::new(mocks::Client::new(1, false, 8));
        client.fail_allocation(true);
        let handler = Arc::new(mocks::Handler::default());
        handler.handle_failures(true);
        let consumer = queue
            .attach(client, handler.clone(), Options::default())
            .unwrap();
        queue.enable(&consumer).unwrap();
        assert_eq!(handler.failures(), 1);
        assert_eq!(handler.disabled_count(), 1);
        assert_eq!(consumer.status(), Status::Disconnected);
        assert_eq!(queue.stats().consumers, 0);

        // The message is still available
        let (_, handler) = consumer_for(&queue);
        assert_eq!(handler.take().len(), 1);
    }

    fn consumer_for(queue: &Arc<Queue>) -> (Arc<Consumer>, Arc<mocks::Handler>) {
        consumer(queue, Arc::new(mocks::Client::new(9, false, 8)), None)
    }

    #[test_traced]
    #[should_panic(expected = "unhandled delivery failure")]
    fn test_unhandled_allocation_failure() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(8));
        put(&queue, message(b"m"));
        let client = Arc::new(mocks::Client::new(1, false, 8));
        client.fail_allocation(true);
        let _ = consumer(&queue, client, None);
    }

    #[test_traced]
    fn test_inflight_limit() {
        let mut harness = Harness::new();
        let mut config = config(8);
        config.policy = Policy {
            max_inflight: 2,
            ..Default::default()
        };
        let queue = harness.queue(config);
        for i in 0..4 {
            put(&queue, numbered(i));
        }
        let (_, handler) = consumer(&queue, Arc::new(mocks::Client::new(1, false, 64)), None);
        let deliveries = handler.take();
        assert_eq!(deliveries.len(), 2);
        assert!(queue.full_delivery_prevention.load(Ordering::Acquire));

        queue
            .acknowledge(deliveries[0].handle.as_ref().unwrap(), AckKind::Consumed, None, None)
            .unwrap();
        assert_eq!(handler.take().len(), 1);
    }

    #[test_traced]
    fn test_durable_delivery_persisted() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(8));
        put(&queue, persistent(b"p"));
        let (_, handler) = consumer(&queue, Arc::new(mocks::Client::new(1, true, 8)), None);
        let delivery = handler.take().pop().unwrap();
        assert_eq!(delivery.state, PersistedState::Delivered);
        let references = harness.store.references(OwnerHandle(7));
        assert_eq!(
            references[0].2,
            ReferenceState::new(PersistedState::Delivered, 1)
        );
        assert!(delivery.handle.unwrap().node.node().has(HAS_MDR));
    }

    #[test_traced]
    fn test_deferred_delivery_commit() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(8));
        put(&queue, persistent(b"p"));
        harness.store.defer(true);
        let (consumer, handler) = consumer(&queue, Arc::new(mocks::Client::new(1, true, 8)), None);

        // Nothing is handed out until the delivered state is durable
        assert!(handler.take().is_empty());
        assert_eq!(consumer.status(), Status::Delivering);
        harness.store.complete_all();
        assert_eq!(handler.take().len(), 1);
        assert_eq!(consumer.status(), Status::Enabled);
    }

    #[test_traced]
    fn test_detach_while_delivering() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(8));
        put(&queue, persistent(b"p"));
        harness.store.defer(true);
        let (consumer, handler) = consumer(&queue, Arc::new(mocks::Client::new(1, true, 8)), None);
        assert_eq!(queue.detach(&consumer).unwrap(), Completion::Pending);
        harness.store.complete_all();
        assert_eq!(handler.disabled_count(), 1);
        assert_eq!(queue.stats().consumers, 0);
        assert_eq!(consumer.status(), Status::Disconnected);
    }

    #[test]
    fn test_no_double_delivery() {
        let mut harness = Harness::new();
        let mut config = config(16);
        config.max_page_capacity = 128;
        let queue = harness.queue(config);
        let handlers: Vec<_> = (0..4)
            .map(|i| consumer(&queue, Arc::new(mocks::Client::new(i, false, 4096)), None).1)
            .collect();

        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        put(&queue, numbered(p * 1000 + i));
                    }
                })
            })
            .collect();
        let checkers: Vec<_> = (0..4u64)
            .map(|seed| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed);
                    for _ in 0..200 {
                        let _ = queue.check_waiters();
                        if rng.gen_bool(0.5) {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        for handle in producers.into_iter().chain(checkers) {
            handle.join().unwrap();
        }
        let _ = queue.check_waiters();

        let mut seen = HashSet::new();
        for handler in &handlers {
            for delivery in handler.take() {
                assert!(seen.insert(delivery.order_id), "delivered twice");
            }
        }
        assert_eq!(seen.len(), 1000);
        assert_eq!(queue.stats().inflight, 1000);
    }

    #[test_traced]
    fn test_inflight_limit_spares_browsers() {
        let mut harness = Harness::new();
        let mut config = config(8);
        config.policy = Policy {
            max_inflight: 1,
            ..Default::default()
        };
        let queue = harness.queue(config);
        put(&queue, numbered(1));
        put(&queue, numbered(2));
        let (_, handler) = consumer(&queue, Arc::new(mocks::Client::new(1, false, 64)), None);
        assert_eq!(handler.take().len(), 1);
        assert!(queue.full_delivery_prevention.load(Ordering::Acquire));

        let browsed = Arc::new(mocks::Handler::default());
        let browser = queue
            .attach(
                Arc::new(mocks::Client::new(2, false, 64)),
                browsed.clone(),
                Options {
                    browse: true,
                    ..Default::default()
                },
            )
            .unwrap();
        queue.enable(&browser).unwrap();
        let order_ids: Vec<_> = browsed.take().iter().map(|d| d.order_id).collect();
        assert_eq!(order_ids, vec![2]);
        assert_eq!(queue.stats().inflight, 1);
    }
}
