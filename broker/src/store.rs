//! Contract with the durable write-ahead store.
//!
//! The queue stages reference operations into a [Batch] and commits them with [Store::commit].
//! A commit either completes immediately ([Commit::Done]) or is acknowledged later
//! ([Commit::Pending]), in which case the caller registers a continuation with
//! [PendingCommit::then] and returns control. The store resumes the continuation (on whatever
//! thread observes completion) through the paired [CommitSignal].
//!
//! # Ordering
//!
//! Message records are reference counted by the store. A reference deletion must be committed
//! before the usage of the message record it points to is released with
//! [Store::release_message]: if a release reached zero while the deletion was uncommitted, a
//! crash would leave a reference to an erased record.

use crate::message::Message;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur when interacting with the store.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("store full")]
    Full,
    #[error("record not found: {0}")]
    NotFound(u64),
    #[error("commit failed: {0}")]
    CommitFailed(String),
}

/// Handle of a queue definition record (the owner of references).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerHandle(pub u64);

/// Handle of a message record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageHandle(pub u64);

/// Persisted message state (the upper two bits of a [ReferenceState]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PersistedState {
    Available = 0,
    Delivered = 1,
    Received = 2,
    Consumed = 3,
}

/// Opaque state byte stored with every reference.
///
/// Encodes the message state in two bits and the redelivery count in six bits, which is
/// sufficient to reconstruct a queue node at recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReferenceState(pub u8);

impl ReferenceState {
    /// Largest redelivery count that can be persisted.
    pub const MAX_DELIVERY_COUNT: u8 = 0x3f;

    /// Encode a state and delivery count (saturating the count).
    pub fn new(state: PersistedState, delivery_count: u8) -> Self {
        Self(((state as u8) << 6) | delivery_count.min(Self::MAX_DELIVERY_COUNT))
    }

    /// Returns the persisted message state.
    pub fn state(&self) -> PersistedState {
        match self.0 >> 6 {
            0 => PersistedState::Available,
            1 => PersistedState::Delivered,
            2 => PersistedState::Received,
            _ => PersistedState::Consumed,
        }
    }

    /// Returns the persisted delivery count.
    pub fn delivery_count(&self) -> u8 {
        self.0 & Self::MAX_DELIVERY_COUNT
    }
}

/// A persistent operation against a queue's references.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// Link a message record to a queue position.
    CreateReference {
        owner: OwnerHandle,
        order_id: u64,
        message: MessageHandle,
        state: ReferenceState,
    },
    /// Update the state byte of an existing reference.
    UpdateReference {
        owner: OwnerHandle,
        order_id: u64,
        state: ReferenceState,
    },
    /// Remove a reference.
    DeleteReference { owner: OwnerHandle, order_id: u64 },
}

/// An ordered set of operations committed atomically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation.
    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    /// Append every operation of `other`.
    pub fn append(&mut self, other: &mut Batch) {
        self.ops.append(&mut other.ops);
    }

    /// Returns the number of staged operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns whether no operations are staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns the staged operations.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Consume the batch, returning its operations.
    pub fn into_ops(self) -> Vec<Op> {
        self.ops
    }
}

/// Continuation resumed when a pending commit completes.
pub type Continuation = Box<dyn FnOnce(Result<(), Error>) + Send>;

enum Resume {
    Waiting,
    Registered(Continuation),
    Completed(Result<(), Error>),
    Finished,
}

/// The caller's side of a commit that has not completed yet.
pub struct PendingCommit {
    shared: Arc<Mutex<Resume>>,
}

/// The store's side of a commit that has not completed yet.
pub struct CommitSignal {
    shared: Arc<Mutex<Resume>>,
}

/// Create a linked [PendingCommit] and [CommitSignal].
pub fn pending() -> (PendingCommit, CommitSignal) {
    let shared = Arc::new(Mutex::new(Resume::Waiting));
    (
        PendingCommit {
            shared: shared.clone(),
        },
        CommitSignal { shared },
    )
}

impl PendingCommit {
    /// Register the continuation to run once the commit completes.
    ///
    /// If the commit already completed, `continuation` runs immediately on this thread.
    pub fn then(self, continuation: impl FnOnce(Result<(), Error>) + Send + 'static) {
        let mut shared = self.shared.lock();
        match std::mem::replace(&mut *shared, Resume::Finished) {
            Resume::Waiting => *shared = Resume::Registered(Box::new(continuation)),
            Resume::Completed(result) => {
                drop(shared);
                continuation(result);
            }
            Resume::Registered(_) | Resume::Finished => {
                panic!("continuation registered twice")
            }
        }
    }
}

impl CommitSignal {
    /// Signal completion, resuming the continuation on this thread if one is registered.
    pub fn complete(self, result: Result<(), Error>) {
        let mut shared = self.shared.lock();
        match std::mem::replace(&mut *shared, Resume::Finished) {
            Resume::Waiting => *shared = Resume::Completed(result),
            Resume::Registered(continuation) => {
                drop(shared);
                continuation(result);
            }
            Resume::Completed(_) | Resume::Finished => panic!("commit completed twice"),
        }
    }
}

/// Outcome of [Store::commit].
pub enum Commit {
    /// The batch is durable.
    Done,
    /// The batch will be durable once the paired [CommitSignal] fires.
    Pending(PendingCommit),
}

/// A durable write-ahead store.
pub trait Store: Send + Sync + 'static {
    /// Persist a new message record with a usage count of one.
    fn store_message(&self, message: &Message) -> Result<MessageHandle, Error>;

    /// Add a usage to an existing message record.
    fn add_message_usage(&self, handle: MessageHandle) -> Result<(), Error>;

    /// Release a usage of a message record, erasing it when no usages remain.
    ///
    /// Callers must only release a usage after the deletion of the reference that held it has
    /// been committed.
    fn release_message(&self, handle: MessageHandle) -> Result<(), Error>;

    /// Reserve capacity for `ops` operations of a following commit.
    fn reserve(&self, ops: usize) -> Result<(), Error>;

    /// Commit a batch of operations atomically.
    fn commit(&self, batch: Batch) -> Result<Commit, Error>;

    /// Hint that no reference of `owner` below `order_id` remains.
    fn set_min_active_order_id(&self, owner: OwnerHandle, order_id: u64);

    /// Returns the number of operations issued but not yet durable.
    fn outstanding(&self) -> usize;

    /// Remove the definition record of a deleted queue.
    fn delete_owner(&self, owner: OwnerHandle) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_reference_state_encoding() {
        let state = ReferenceState::new(PersistedState::Received, 5);
        assert_eq!(state.state(), PersistedState::Received);
        assert_eq!(state.delivery_count(), 5);
        assert_eq!(state.0, 0b1000_0101);

        // Counts saturate at six bits
        let state = ReferenceState::new(PersistedState::Delivered, 200);
        assert_eq!(state.delivery_count(), ReferenceState::MAX_DELIVERY_COUNT);
        assert_eq!(state.state(), PersistedState::Delivered);

        let state = ReferenceState::new(PersistedState::Consumed, 0);
        assert_eq!(state.state(), PersistedState::Consumed);
    }

    #[test]
    fn test_pending_then_complete() {
        let ran = Arc::new(AtomicUsize::new(0));
        let (pending, signal) = pending();
        let counter = ran.clone();
        pending.then(move |result| {
            assert!(result.is_ok());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        signal.complete(Ok(()));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_complete_then_register() {
        let ran = Arc::new(AtomicUsize::new(0));
        let (pending, signal) = pending();
        signal.complete(Err(Error::Full));
        let counter = ran.clone();
        pending.then(move |result| {
            assert_eq!(result, Err(Error::Full));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
