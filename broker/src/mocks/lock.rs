use crate::{
    lock::{Error, Key, LockManager, Scope},
    transaction::TransactionId,
};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Holder {
    Instant,
    Scoped(Scope),
}

/// A [LockManager] kept in memory.
#[derive(Default)]
pub struct Locks {
    held: Mutex<HashMap<Key, Holder>>,
    released: Condvar,
}

impl Locks {
    /// Returns whether `key` is locked.
    pub fn is_locked(&self, key: Key) -> bool {
        self.held.lock().contains_key(&key)
    }
}

impl LockManager for Locks {
    fn instant(&self, key: Key, peek: &mut dyn FnMut()) -> Result<(), Error> {
        {
            let mut held = self.held.lock();
            if held.contains_key(&key) {
                return Err(Error::NotGranted);
            }
            held.insert(key, Holder::Instant);
        }
        peek();
        self.held.lock().remove(&key);
        self.released.notify_all();
        Ok(())
    }

    fn lock(&self, key: Key, scope: Scope, wait: bool) -> Result<(), Error> {
        let mut held = self.held.lock();
        loop {
            match held.get(&key) {
                None => {
                    held.insert(key, Holder::Scoped(scope));
                    return Ok(());
                }
                Some(Holder::Scoped(Scope::Commit(holder)))
                    if scope == Scope::Commit(*holder) =>
                {
                    return Ok(());
                }
                Some(_) if wait => self.released.wait(&mut held),
                Some(_) => return Err(Error::NotGranted),
            }
        }
    }

    fn unlock(&self, key: Key) {
        self.held.lock().remove(&key);
        self.released.notify_all();
    }

    fn release_transaction(&self, transaction: TransactionId) {
        self.held
            .lock()
            .retain(|_, holder| *holder != Holder::Scoped(Scope::Commit(transaction)));
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;

    #[test_traced]
    fn test_scopes() {
        let locks = Locks::default();
        let key = Key::new(1, 1);
        let txn = Scope::Commit(TransactionId(1));
        locks.lock(key, txn, false).unwrap();
        assert!(locks.is_locked(key));

        // Reentrant for the same transaction only
        locks.lock(key, txn, false).unwrap();
        assert_eq!(
            locks.lock(key, Scope::Commit(TransactionId(2)), false),
            Err(Error::NotGranted)
        );
        assert_eq!(locks.instant(key, &mut || panic!("peeked")), Err(Error::NotGranted));

        locks.release_transaction(TransactionId(1));
        let mut peeked = false;
        locks.instant(key, &mut || peeked = true).unwrap();
        assert!(peeked);
        assert!(!locks.is_locked(key));
    }
}
