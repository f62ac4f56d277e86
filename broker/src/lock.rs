//! Contract with the per-message lock manager.
//!
//! Locks are keyed by `(queue, order_id)` and are the only mechanism for mutual exclusion between
//! a delivering consumer, a replaying transaction, and an expiry or discard scan touching the same
//! message.

use crate::transaction::TransactionId;
use thiserror::Error;

/// Errors that can occur when interacting with a [LockManager].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("lock not granted")]
    NotGranted,
}

/// Identifies a single message on a single queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    /// Identifier of the queue (its store owner handle).
    pub queue: u64,
    /// Order id of the message on the queue.
    pub order_id: u64,
}

impl Key {
    pub fn new(queue: u64, order_id: u64) -> Self {
        Self { queue, order_id }
    }
}

/// How long a lock is held.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Held until explicitly unlocked.
    Request,
    /// Held until the transaction resolves.
    Commit(TransactionId),
}

/// A manager of exclusive per-message locks.
pub trait LockManager: Send + Sync + 'static {
    /// Try to lock `key`, run `peek` while it is held, and release it.
    ///
    /// Returns [Error::NotGranted] without running `peek` if the key is already locked.
    fn instant(&self, key: Key, peek: &mut dyn FnMut()) -> Result<(), Error>;

    /// Lock `key` for `scope`.
    ///
    /// If `wait` is false, returns [Error::NotGranted] immediately when the key is held by
    /// someone else. Locking a key already held by the same transaction succeeds.
    fn lock(&self, key: Key, scope: Scope, wait: bool) -> Result<(), Error>;

    /// Release a [Scope::Request] lock.
    fn unlock(&self, key: Key);

    /// Release every lock held by `transaction`.
    fn release_transaction(&self, transaction: TransactionId);
}
