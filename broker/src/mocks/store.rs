use crate::store::{
    self, Batch, Commit, CommitSignal, Error, MessageHandle, Op, OwnerHandle, ReferenceState,
};
use crate::message::Message;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Default)]
struct State {
    next_record: u64,
    usage: HashMap<MessageHandle, u64>,
    references: BTreeMap<(OwnerHandle, u64), (MessageHandle, ReferenceState)>,
    pending: VecDeque<(Batch, CommitSignal)>,
    defer: bool,
    fail_next: bool,
    deleted: Vec<OwnerHandle>,
    min_active: HashMap<OwnerHandle, u64>,
}

impl State {
    fn apply(&mut self, batch: Batch) {
        for op in batch.into_ops() {
            match op {
                Op::CreateReference {
                    owner,
                    order_id,
                    message,
                    state,
                } => {
                    self.references.insert((owner, order_id), (message, state));
                }
                Op::UpdateReference {
                    owner,
                    order_id,
                    state,
                } => {
                    if let Some(reference) = self.references.get_mut(&(owner, order_id)) {
                        reference.1 = state;
                    }
                }
                Op::DeleteReference { owner, order_id } => {
                    self.references.remove(&(owner, order_id));
                }
            }
        }
    }
}

/// A [crate::store::Store] kept in memory.
///
/// Commits complete immediately unless [Store::defer] is set, in which case they stay pending
/// (and invisible) until [Store::complete_next] or [Store::complete_all] is called.
#[derive(Default)]
pub struct Store {
    state: Mutex<State>,
}

impl Store {
    /// Hold subsequent commits until they are explicitly completed.
    pub fn defer(&self, defer: bool) {
        self.state.lock().defer = defer;
    }

    /// Fail the next commit immediately.
    pub fn fail_next_commit(&self) {
        self.state.lock().fail_next = true;
    }

    /// Complete the oldest pending commit, returning whether there was one.
    pub fn complete_next(&self) -> bool {
        let signal = {
            let mut state = self.state.lock();
            let Some((batch, signal)) = state.pending.pop_front() else {
                return false;
            };
            state.apply(batch);
            signal
        };
        signal.complete(Ok(()));
        true
    }

    /// Complete pending commits (including those issued by their continuations) until none remain.
    pub fn complete_all(&self) {
        while self.complete_next() {}
    }

    /// Returns the usage count of a message record (zero once erased).
    pub fn usage(&self, record: MessageHandle) -> u64 {
        self.state.lock().usage.get(&record).copied().unwrap_or(0)
    }

    /// Returns the committed references of `owner` as `(order_id, record, state)`, in order.
    pub fn references(&self, owner: OwnerHandle) -> Vec<(u64, MessageHandle, ReferenceState)> {
        self.state
            .lock()
            .references
            .range((owner, 0)..=(owner, u64::MAX))
            .map(|((_, order_id), (record, state))| (*order_id, *record, *state))
            .collect()
    }

    /// Returns the owners whose definition records were deleted.
    pub fn deleted_owners(&self) -> Vec<OwnerHandle> {
        self.state.lock().deleted.clone()
    }

    /// Returns the last watermark set for `owner`.
    pub fn min_active(&self, owner: OwnerHandle) -> Option<u64> {
        self.state.lock().min_active.get(&owner).copied()
    }
}

impl store::Store for Store {
    fn store_message(&self, _message: &Message) -> Result<MessageHandle, Error> {
        let mut state = self.state.lock();
        state.next_record += 1;
        let handle = MessageHandle(state.next_record);
        state.usage.insert(handle, 1);
        Ok(handle)
    }

    fn add_message_usage(&self, handle: MessageHandle) -> Result<(), Error> {
        let mut state = self.state.lock();
        let usage = state
            .usage
            .get_mut(&handle)
            .ok_or(Error::NotFound(handle.0))?;
        *usage += 1;
        Ok(())
    }

    fn release_message(&self, handle: MessageHandle) -> Result<(), Error> {
        let mut state = self.state.lock();
        let usage = state
            .usage
            .get_mut(&handle)
            .ok_or(Error::NotFound(handle.0))?;
        *usage -= 1;
        if *usage == 0 {
            state.usage.remove(&handle);
        }
        Ok(())
    }

    fn reserve(&self, _ops: usize) -> Result<(), Error> {
        Ok(())
    }

    fn commit(&self, batch: Batch) -> Result<Commit, Error> {
        let mut state = self.state.lock();
        if state.fail_next {
            state.fail_next = false;
            return Err(Error::CommitFailed("injected failure".into()));
        }
        if state.defer {
            let (pending, signal) = store::pending();
            state.pending.push_back((batch, signal));
            return Ok(Commit::Pending(pending));
        }
        state.apply(batch);
        Ok(Commit::Done)
    }

    fn set_min_active_order_id(&self, owner: OwnerHandle, order_id: u64) {
        self.state.lock().min_active.insert(owner, order_id);
    }

    fn outstanding(&self) -> usize {
        self.state
            .lock()
            .pending
            .iter()
            .map(|(batch, _)| batch.len())
            .sum()
    }

    fn delete_owner(&self, owner: OwnerHandle) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.references.retain(|(o, _), _| *o != owner);
        state.deleted.push(owner);
        Ok(())
    }
}
