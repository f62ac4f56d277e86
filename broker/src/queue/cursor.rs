//! Atomic scan positions.
//!
//! A [Cursor] packs a [Position] into one atomic word: an order id, or [Position::Searching]
//! while a thread has taken the cursor to walk forward from it. Updates follow three rules:
//!
//! - A searcher takes the cursor with [Cursor::begin_search] and must [Cursor::publish] its
//!   result. Publishing fails (with [Retry]) if the cursor was rewound in the meantime.
//! - [Cursor::advance] only moves a cursor that still holds the expected position.
//! - [Cursor::rewind] moves a cursor backwards (never forwards) and always wins over a search in
//!   progress.
//!
//! Together these guarantee that a message made available behind the cursor (by a commit,
//! rollback or nack) is never skipped: either the rewind lands after the searcher published, or
//! the searcher's publication fails and it scans again.
//!
//! Each cursor also remembers the page it last resolved to, so that resolving a position does not
//! walk the chain from the head every time.

use super::page::{seek, NodeRef, Page};
use parking_lot::Mutex;
use std::sync::{
    atomic::{fence, AtomicU64, Ordering},
    Arc, Weak,
};

const SEARCHING: u64 = u64::MAX;

/// Value of a [Cursor].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Position {
    /// The next order id to consider.
    At(u64),
    /// A thread is walking forward and has not settled yet.
    Searching,
}

impl Position {
    fn decode(value: u64) -> Self {
        if value == SEARCHING {
            Self::Searching
        } else {
            Self::At(value)
        }
    }
}

/// The cursor was rewound while it was being searched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Retry;

/// An atomically updated scan position.
pub struct Cursor {
    value: AtomicU64,
    hint: Mutex<Weak<Page>>,
}

impl Cursor {
    pub fn new(order_id: u64) -> Self {
        assert!(order_id != SEARCHING);
        Self {
            value: AtomicU64::new(order_id),
            hint: Mutex::new(Weak::new()),
        }
    }

    pub fn load(&self) -> Position {
        Position::decode(self.value.load(Ordering::Acquire))
    }

    /// Take the cursor to search forward from `from`.
    pub fn begin_search(&self, from: u64) -> bool {
        let taken = self
            .value
            .compare_exchange(from, SEARCHING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if taken {
            // Pairs with the fence in rewind: node states are read after the cursor is taken
            fence(Ordering::SeqCst);
        }
        taken
    }

    /// Settle a search at `order_id`.
    pub fn publish(&self, order_id: u64) -> Result<(), Retry> {
        debug_assert!(order_id != SEARCHING);
        self.value
            .compare_exchange(SEARCHING, order_id, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Retry)
    }

    /// Move the cursor from `from` to `to` if nobody moved it in the meantime.
    pub fn advance(&self, from: u64, to: u64) -> bool {
        debug_assert!(to != SEARCHING);
        self.value
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move the cursor back to `order_id` if it is searching or beyond it.
    ///
    /// Returns whether the cursor moved.
    pub fn rewind(&self, order_id: u64) -> bool {
        debug_assert!(order_id != SEARCHING);

        // The node state written by the caller is visible to any search that takes the cursor
        // after this load
        fence(Ordering::SeqCst);
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if current != SEARCHING && current <= order_id {
                return false;
            }
            match self.value.compare_exchange(
                current,
                order_id,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Unconditionally reposition the cursor (only valid while no other thread uses it).
    pub fn reset(&self, order_id: u64) {
        debug_assert!(order_id != SEARCHING);
        self.value.store(order_id, Ordering::Release);
    }

    /// Resolve `order_id` to the first node at or after it.
    ///
    /// Starts from the page this cursor last resolved to when possible, else from `head`.
    pub fn resolve(&self, head: &Arc<Page>, order_id: u64) -> Option<NodeRef> {
        let hinted = self
            .hint
            .lock()
            .upgrade()
            .filter(|page| page.base() <= order_id && page.base() >= head.base());
        let start = hinted.as_ref().unwrap_or(head);
        let node = seek(start, order_id)?;
        *self.hint.lock() = Arc::downgrade(node.page());
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use std::{sync::atomic::AtomicBool, thread};

    #[test_traced]
    fn test_search_publish() {
        let cursor = Cursor::new(5);
        assert!(!cursor.begin_search(4));
        assert!(cursor.begin_search(5));
        assert_eq!(cursor.load(), Position::Searching);
        assert!(!cursor.begin_search(5));
        assert_eq!(cursor.publish(9), Ok(()));
        assert_eq!(cursor.load(), Position::At(9));

        // Publishing without a search fails
        assert_eq!(cursor.publish(10), Err(Retry));
    }

    #[test_traced]
    fn test_rewind_beats_search() {
        let cursor = Cursor::new(5);
        assert!(cursor.begin_search(5));
        assert!(cursor.rewind(3));
        assert_eq!(cursor.publish(8), Err(Retry));
        assert_eq!(cursor.load(), Position::At(3));
    }

    #[test_traced]
    fn test_rewind_never_advances() {
        let cursor = Cursor::new(5);
        assert!(!cursor.rewind(5));
        assert!(!cursor.rewind(7));
        assert_eq!(cursor.load(), Position::At(5));
        assert!(cursor.rewind(2));
        assert_eq!(cursor.load(), Position::At(2));

        // Advancing from a stale position fails
        assert!(!cursor.advance(5, 6));
        assert!(cursor.advance(2, 6));
        assert_eq!(cursor.load(), Position::At(6));
    }

    #[test_traced]
    fn test_resolve_uses_hint() {
        let head = Page::try_new(1, 2).unwrap();
        let second = Page::try_new(3, 2).unwrap();
        head.link().complete(second.clone());

        let cursor = Cursor::new(1);
        let node = cursor.resolve(&head, 4).unwrap();
        assert_eq!(node.order_id(), 4);
        assert!(Arc::ptr_eq(node.page(), &second));

        // An earlier position falls back to the head
        assert_eq!(cursor.resolve(&head, 1).unwrap().order_id(), 1);
        assert!(cursor.resolve(&head, 5).is_none());
    }

    #[test]
    fn test_rewind_not_lost_to_search() {
        for _ in 0..1000 {
            // Node 5 is held by someone else and skipped by searchers until it is returned
            let cursor = Arc::new(Cursor::new(5));
            let available = Arc::new(AtomicBool::new(false));
            let returner = {
                let cursor = cursor.clone();
                let available = available.clone();
                thread::spawn(move || {
                    available.store(true, Ordering::Release);
                    cursor.rewind(5);
                })
            };
            let mut delivered = false;
            if cursor.begin_search(5) {
                delivered = available.load(Ordering::Acquire);
                let _ = cursor.publish(6);
            }
            returner.join().unwrap();

            // Either the searcher saw the node or a later search starts at it
            assert!(delivered || cursor.load() == Position::At(5));
        }
    }
}
