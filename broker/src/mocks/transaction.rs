use crate::{
    lock::LockManager,
    queue::SoftLog,
    store::{self, Batch, Commit, Op, Store},
    transaction::{self, Phase, TransactionId},
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::debug;

/// Position in a [Transaction] that can be rolled back to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Savepoint(usize);

/// A [transaction::Transaction] staging operations in memory.
pub struct Transaction {
    id: TransactionId,
    ops: Mutex<Batch>,
    logs: Mutex<Vec<SoftLog>>,
}

impl Transaction {
    /// Mark the current position for [Transaction::rollback_to].
    pub fn savepoint(&self) -> Savepoint {
        Savepoint(self.logs.lock().len())
    }

    /// Undo every operation performed since `savepoint`.
    pub fn rollback_to(&self, savepoint: Savepoint) {
        let mut scratch = Batch::new();
        for log in self.logs.lock().iter_mut().skip(savepoint.0) {
            log.replay(Phase::SavepointRollback, &mut scratch);
        }
    }
}

impl transaction::Transaction for Transaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn stage(&self, op: Op) {
        self.ops.lock().push(op);
    }

    fn log(&self, entry: SoftLog) {
        self.logs.lock().push(entry);
    }
}

/// Drives [Transaction]s through the replay phases against a store and lock manager.
pub struct Transactions {
    store: Arc<dyn Store>,
    locks: Arc<dyn LockManager>,
    next: AtomicU64,
}

impl Transactions {
    pub fn new(store: Arc<dyn Store>, locks: Arc<dyn LockManager>) -> Self {
        Self {
            store,
            locks,
            next: AtomicU64::new(1),
        }
    }

    /// Start a transaction.
    pub fn begin(&self) -> Transaction {
        Transaction {
            id: TransactionId(self.next.fetch_add(1, Ordering::AcqRel)),
            ops: Mutex::new(Batch::new()),
            logs: Mutex::new(Vec::new()),
        }
    }

    /// Commit `transaction`.
    ///
    /// If the store fails the commit, the transaction is rolled back instead and the error is
    /// returned.
    pub fn commit(&self, transaction: Transaction) -> Result<(), store::Error> {
        let id = transaction.id;
        let mut batch = transaction.ops.into_inner();
        let mut logs = transaction.logs.into_inner();
        for log in &mut logs {
            log.replay(Phase::Commit, &mut batch);
        }
        debug!(id = id.0, ops = batch.len(), "committing transaction");
        match self.store.commit(batch) {
            Ok(Commit::Done) => {
                resolve(&*self.locks, id, &mut logs, true);
                Ok(())
            }
            Ok(Commit::Pending(pending)) => {
                let (store, locks) = (self.store.clone(), self.locks.clone());
                pending.then(move |result| match result {
                    Ok(()) => resolve(&*locks, id, &mut logs, true),
                    Err(_) => rollback(store, locks, id, logs),
                });
                Ok(())
            }
            Err(err) => {
                rollback(self.store.clone(), self.locks.clone(), id, logs);
                Err(err)
            }
        }
    }

    /// Roll `transaction` back.
    pub fn rollback(&self, transaction: Transaction) {
        let logs = transaction.logs.into_inner();
        rollback(self.store.clone(), self.locks.clone(), transaction.id, logs);
    }
}

/// Discard the staged operations, committing only what the log needs to restore.
fn rollback(
    store: Arc<dyn Store>,
    locks: Arc<dyn LockManager>,
    id: TransactionId,
    mut logs: Vec<SoftLog>,
) {
    let mut batch = Batch::new();
    for log in &mut logs {
        log.replay(Phase::Rollback, &mut batch);
    }
    debug!(id = id.0, ops = batch.len(), "rolling back transaction");
    if !batch.is_empty() {
        if let Ok(Commit::Pending(pending)) = store.commit(batch) {
            pending.then(move |_| resolve(&*locks, id, &mut logs, false));
            return;
        }
    }
    resolve(&*locks, id, &mut logs, false);
}

/// Replay the in-memory phases around releasing the transaction's locks.
fn resolve(locks: &dyn LockManager, id: TransactionId, logs: &mut [SoftLog], committed: bool) {
    let (memory, post) = match committed {
        true => (Phase::MemoryCommit, Phase::PostCommit),
        false => (Phase::MemoryRollback, Phase::PostRollback),
    };
    let mut scratch = Batch::new();
    for log in logs.iter_mut() {
        log.replay(memory, &mut scratch);
    }
    locks.release_transaction(id);
    for log in logs.iter_mut() {
        log.replay(post, &mut scratch);
    }
}
