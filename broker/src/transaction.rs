//! Contract with the transaction manager.
//!
//! Operations performed under a transaction record a [SoftLog] with the transaction instead of
//! taking effect immediately. When the transaction resolves, the transaction manager replays every
//! entry through each [Phase] in order:
//!
//! ```text
//! commit:   Commit -> (store commit) -> MemoryCommit -> (release locks) -> PostCommit
//! rollback: Rollback -> MemoryRollback -> (release locks) -> PostRollback
//! ```
//!
//! A [Phase::SavepointRollback] may be replayed for entries logged after a savepoint at any time
//! before the transaction resolves. Those entries then undo themselves during the commit phases.

use crate::{queue::SoftLog, store::Op};

/// Identifier of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

/// A point at which the transaction manager replays a [SoftLog].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Before the store commit: stage store operations and adjust counters.
    Commit,
    /// After the store commit, while message locks are still held.
    MemoryCommit,
    /// After message locks are released.
    PostCommit,
    /// Before the staged store operations are discarded.
    Rollback,
    /// After the staged store operations are discarded, while message locks are still held.
    MemoryRollback,
    /// After message locks are released.
    PostRollback,
    /// The transaction rolled back to a savepoint taken before this entry was logged.
    SavepointRollback,
}

/// A transaction that queue operations can participate in.
pub trait Transaction: Send + Sync {
    /// Returns the identifier of the transaction.
    fn id(&self) -> TransactionId;

    /// Stage a store operation to be committed with the transaction.
    fn stage(&self, op: Op);

    /// Record an entry to be replayed when the transaction resolves.
    fn log(&self, entry: SoftLog);
}
