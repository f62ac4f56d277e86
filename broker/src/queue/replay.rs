//! Replay of transactional puts and acknowledgements.

use super::{
    node::{State, HAS_MDR, IN_STORE, UNCOMMITTED},
    page::NodeRef,
    storage::{Queue, Removal},
    waiter::Consumer,
    Error,
};
use crate::{
    store::{Batch, MessageHandle, Op, PersistedState, ReferenceState},
    transaction::Phase,
};
use std::sync::{atomic::Ordering, Arc};
use tracing::debug;

/// What a logged entry undoes or completes.
pub(super) enum Action {
    Put {
        node: NodeRef,
    },
    Consume {
        node: NodeRef,
        consumer: Arc<Consumer>,
    },
}

struct Entry {
    queue: Arc<Queue>,
    action: Action,
    /// Rolled back to a savepoint: the commit phases undo the entry instead.
    inverted: bool,
    /// Record released after the reference deletion commits.
    record: Option<MessageHandle>,
    /// The in-flight limit was lifted when the entry resolved.
    lifted: bool,
}

/// A queue operation recorded with a [crate::transaction::Transaction].
///
/// The memory for the entry is reserved before the operation is attempted, so that recording it
/// cannot fail once the operation took effect.
pub struct SoftLog {
    entry: Vec<Entry>,
}

impl SoftLog {
    /// Reserve an empty entry.
    pub(super) fn reserve() -> Result<Self, Error> {
        let mut entry = Vec::new();
        entry
            .try_reserve_exact(1)
            .map_err(|_| Error::AllocationFailed)?;
        Ok(Self { entry })
    }

    /// Record `action` into the reserved entry.
    pub(super) fn fill(&mut self, queue: Arc<Queue>, action: Action) {
        assert!(self.entry.is_empty(), "soft log filled twice");
        self.entry.push(Entry {
            queue,
            action,
            inverted: false,
            record: None,
            lifted: false,
        });
    }

    /// Replay the logged operation for `phase`, staging store operations into `batch`.
    pub fn replay(&mut self, phase: Phase, batch: &mut Batch) {
        for entry in &mut self.entry {
            entry.replay(phase, batch);
        }
    }
}

impl Entry {
    fn replay(&mut self, phase: Phase, batch: &mut Batch) {
        if phase == Phase::SavepointRollback {
            self.inverted = true;
            return;
        }
        let phase = match (phase, self.inverted) {
            (Phase::Commit, true) => {
                self.compensate(batch);
                Phase::Rollback
            }
            (Phase::MemoryCommit, true) => Phase::MemoryRollback,
            (Phase::PostCommit, true) => Phase::PostRollback,
            (phase, _) => phase,
        };
        match &self.action {
            Action::Put { node } => {
                let node = node.clone();
                self.put(phase, node)
            }
            Action::Consume { node, consumer } => {
                let (node, consumer) = (node.clone(), consumer.clone());
                self.consume(phase, node, consumer, batch)
            }
        }
    }

    /// Undo store operations staged before a savepoint rollback.
    fn compensate(&mut self, batch: &mut Batch) {
        let Action::Put { node } = &self.action else {
            return;
        };
        if node.node().has(IN_STORE) {
            batch.push(Op::DeleteReference {
                owner: self.queue.owner,
                order_id: node.order_id(),
            });
        }
    }

    fn put(&mut self, phase: Phase, node: NodeRef) {
        let queue = &self.queue;
        let n = node.node();
        match phase {
            Phase::Commit | Phase::Rollback | Phase::MemoryRollback => {}
            Phase::MemoryCommit => {
                n.clear(UNCOMMITTED);
                queue.track_expiry(&node);
                queue.rewind(node.order_id());
            }
            Phase::PostCommit => {
                queue.counters.enqueued.fetch_add(1, Ordering::AcqRel);
                queue.metrics.enqueued.inc();

                // Getters may have passed the node while it was locked
                queue.rewind(node.order_id());
                let _ = queue.check_waiters();
                queue.reclaim_if_full();
                queue.unhold();
            }
            Phase::PostRollback => {
                let bytes = n.with_message(|message| message.map_or(0, |m| m.len()));
                let record = queue.retire(&node);
                queue.unbuffer(bytes);
                queue.release_record(record);
                debug!(name = queue.config.name, order_id = node.order_id(), "rolled back put");
                queue.cleanup_head_pages();
                queue.unhold();
            }
            Phase::SavepointRollback => unreachable!(),
        }
    }

    fn consume(&mut self, phase: Phase, node: NodeRef, consumer: Arc<Consumer>, batch: &mut Batch) {
        let queue = self.queue.clone();
        let n = node.node();
        let order_id = node.order_id();
        match phase {
            Phase::Commit => {
                if n.has(IN_STORE) {
                    batch.push(Op::DeleteReference {
                        owner: queue.owner,
                        order_id,
                    });
                }
            }
            Phase::MemoryCommit => {
                let bytes = n.with_message(|message| message.map_or(0, |m| m.len()));
                queue.unbuffer(bytes);
                queue.count_removal(Removal::Consumed, 1);
                consumer.client.release(queue.key(order_id));
                self.lifted = queue.remove_inflight();
                self.record = queue.retire(&node);
            }
            Phase::PostCommit => {
                queue.release_record(self.record.take());
                queue.settle(&consumer, 1, self.lifted);
                queue.cleanup_head_pages();
                queue.unhold();
            }
            Phase::Rollback => {
                if n.has(HAS_MDR) {
                    n.clear(HAS_MDR);
                    batch.push(Op::UpdateReference {
                        owner: queue.owner,
                        order_id,
                        state: ReferenceState::new(PersistedState::Available, n.delivery_count()),
                    });
                }
            }
            Phase::MemoryRollback => {
                consumer.client.release(queue.key(order_id));
                n.set_delivery_id(None);
                self.lifted = queue.remove_inflight();
                n.set_state(State::Available);
                queue.track_expiry(&node);
                queue.rewind(order_id);
            }
            Phase::PostRollback => {
                queue.rewind(order_id);
                debug!(name = queue.config.name, order_id, "rolled back acknowledgement");
                queue.settle(&consumer, 1, true);
                queue.unhold();
            }
            Phase::SavepointRollback => unreachable!(),
        }
    }
}
