//! Fixed-capacity pages of nodes linked into the queue's chain.
//!
//! Every page ends with a [Slot::End] sentinel holding the [Link] to the next page. The link
//! starts [LinkStatus::Unfinished] and is completed by the producer that took the last node of
//! the page. If that producer fails to allocate the next page, the link is marked
//! [LinkStatus::Failed] and exactly one other producer repairs it.
//!
//! Pages are reference counted. A page removed from the chain (retired from the head or spliced
//! out of the middle) keeps its link, so a reader still positioned on it can always walk forward
//! into the live chain.

use super::{node::Node, Error};
use crate::message::Message;
use parking_lot::RwLock;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
};

/// Status of the link from a page to its successor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkStatus {
    Unfinished = 0,
    Failed = 1,
    Repairing = 2,
    Completed = 3,
}

impl LinkStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unfinished,
            1 => Self::Failed,
            2 => Self::Repairing,
            3 => Self::Completed,
            _ => unreachable!("invalid link status: {value}"),
        }
    }
}

/// Forward link stored in the end-of-page sentinel.
pub struct Link {
    status: AtomicU8,
    next: RwLock<Option<Arc<Page>>>,
}

impl Link {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(LinkStatus::Unfinished as u8),
            next: RwLock::new(None),
        }
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Link `next` and publish it.
    pub fn complete(&self, next: Arc<Page>) {
        *self.next.write() = Some(next);
        self.status
            .store(LinkStatus::Completed as u8, Ordering::Release);
    }

    /// Record that the next page could not be allocated.
    pub fn fail(&self) {
        self.status.store(LinkStatus::Failed as u8, Ordering::Release);
    }

    /// Claim the repair of a failed link. Only one caller succeeds.
    pub fn begin_repair(&self) -> bool {
        self.status
            .compare_exchange(
                LinkStatus::Failed as u8,
                LinkStatus::Repairing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Returns the next page if the link is completed.
    pub fn next(&self) -> Option<Arc<Page>> {
        if self.status() != LinkStatus::Completed {
            return None;
        }
        self.next.read().clone()
    }

    /// Point a completed link at a later page, skipping everything in between.
    pub fn splice(&self, next: Arc<Page>) {
        debug_assert_eq!(self.status(), LinkStatus::Completed);
        *self.next.write() = Some(next);
    }
}

/// One slot of a page.
pub enum Slot {
    Node(Node),
    End(Link),
}

/// A fixed-capacity block of nodes.
pub struct Page {
    base: u64,
    slots: Box<[Slot]>,
    consumed: AtomicUsize,
}

#[cfg(test)]
thread_local! {
    /// Makes the next page allocation on this thread fail.
    pub static FAIL_ALLOCATION: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

impl Page {
    /// Allocate a page of `capacity` nodes with order ids starting at `base`.
    pub fn try_new(base: u64, capacity: usize) -> Result<Arc<Self>, Error> {
        assert!(capacity > 0, "page capacity must be non-zero");
        #[cfg(test)]
        {
            if FAIL_ALLOCATION.with(|fail| fail.replace(false)) {
                return Err(Error::AllocationFailed);
            }
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity + 1)
            .map_err(|_| Error::AllocationFailed)?;
        for index in 0..capacity {
            slots.push(Slot::Node(Node::new(base + index as u64)));
        }
        slots.push(Slot::End(Link::new()));
        Ok(Arc::new(Self {
            base,
            slots: slots.into_boxed_slice(),
            consumed: AtomicUsize::new(0),
        }))
    }

    /// Returns the order id of the first node.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Returns the number of nodes (excluding the sentinel).
    pub fn len(&self) -> usize {
        self.slots.len() - 1
    }

    /// Returns the order id following the last node.
    pub fn end(&self) -> u64 {
        self.base + self.len() as u64
    }

    pub fn node(&self, index: usize) -> &Node {
        match &self.slots[index] {
            Slot::Node(node) => node,
            Slot::End(_) => unreachable!("sentinel is not a node"),
        }
    }

    pub fn link(&self) -> &Link {
        match self.slots.last() {
            Some(Slot::End(link)) => link,
            _ => unreachable!("page without sentinel"),
        }
    }

    /// Returns the next page if it has been linked.
    pub fn next(&self) -> Option<Arc<Page>> {
        self.link().next()
    }

    /// Returns the number of nodes that reached the consumed state.
    pub fn consumed(&self) -> usize {
        self.consumed.load(Ordering::Acquire)
    }

    /// Returns whether every node on the page has been consumed.
    pub fn fully_consumed(&self) -> bool {
        self.consumed() == self.len()
    }

    fn mark_consumed(&self) {
        let consumed = self.consumed.fetch_add(1, Ordering::AcqRel) + 1;
        assert!(consumed <= self.len(), "page consumed more nodes than it holds");
    }
}

/// A counted reference to one node.
#[derive(Clone)]
pub struct NodeRef {
    page: Arc<Page>,
    index: usize,
}

impl NodeRef {
    pub fn new(page: Arc<Page>, index: usize) -> Self {
        debug_assert!(index < page.len());
        Self { page, index }
    }

    pub fn node(&self) -> &Node {
        self.page.node(self.index)
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn order_id(&self) -> u64 {
        self.page.base + self.index as u64
    }

    /// Returns the next node, or `None` if it has not been produced yet.
    pub fn subsequent(&self) -> Option<NodeRef> {
        if self.index + 1 < self.page.len() {
            return Some(Self {
                page: self.page.clone(),
                index: self.index + 1,
            });
        }
        self.page.next().map(|page| Self { page, index: 0 })
    }

    /// Move the node to the consumed state, returning its message.
    ///
    /// Every node is consumed at most once.
    pub fn retire(&self) -> Option<Message> {
        let message = self.node().retire();
        self.page.mark_consumed();
        message
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("order_id", &self.order_id())
            .field("state", &self.node().state())
            .finish()
    }
}

/// Find the first node at or after `order_id`, walking forward from `start`.
///
/// Returns `None` if no such node has been linked yet.
pub fn seek(start: &Arc<Page>, order_id: u64) -> Option<NodeRef> {
    let mut page = start.clone();
    loop {
        if order_id < page.end() {
            let index = order_id.saturating_sub(page.base) as usize;
            return Some(NodeRef::new(page, index));
        }
        page = page.next()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::node::State;
    use commonware_macros::test_traced;

    #[test_traced]
    fn test_subsequent_across_pages() {
        let first = Page::try_new(1, 2).unwrap();
        let node = NodeRef::new(first.clone(), 1);
        assert_eq!(node.order_id(), 2);

        // Next page not linked yet
        assert!(node.subsequent().is_none());

        let second = Page::try_new(3, 2).unwrap();
        first.link().complete(second);
        let next = node.subsequent().unwrap();
        assert_eq!(next.order_id(), 3);
        assert_eq!(next.node().state(), State::Empty);
    }

    #[test_traced]
    fn test_seek_lower_bound() {
        let first = Page::try_new(1, 4).unwrap();
        // Recovered pages may leave gaps in the order id space
        let second = Page::try_new(10, 4).unwrap();
        first.link().complete(second);

        assert_eq!(seek(&first, 0).unwrap().order_id(), 1);
        assert_eq!(seek(&first, 3).unwrap().order_id(), 3);
        assert_eq!(seek(&first, 6).unwrap().order_id(), 10);
        assert_eq!(seek(&first, 13).unwrap().order_id(), 13);
        assert!(seek(&first, 14).is_none());
    }

    #[test_traced]
    fn test_link_repair() {
        let page = Page::try_new(1, 1).unwrap();
        let link = page.link();
        assert_eq!(link.status(), LinkStatus::Unfinished);
        assert!(!link.begin_repair());

        link.fail();
        assert!(link.begin_repair());
        assert!(!link.begin_repair());
        assert_eq!(link.status(), LinkStatus::Repairing);
        assert!(page.next().is_none());

        link.complete(Page::try_new(2, 1).unwrap());
        assert_eq!(page.next().unwrap().base(), 2);
    }

    #[test_traced]
    fn test_allocation_failure() {
        FAIL_ALLOCATION.with(|fail| fail.set(true));
        assert!(matches!(Page::try_new(1, 8), Err(Error::AllocationFailed)));
        assert!(Page::try_new(1, 8).is_ok());
    }
}
