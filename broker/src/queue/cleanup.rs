//! Garbage collection of consumed pages.
//!
//! Pages are freed from the head of the chain once every node on them is consumed and nothing
//! still positions itself on them. Runs of consumed pages trapped behind an older unconsumed
//! message are spliced out of the chain when the share of consumed slots grows too large, which
//! may first evict the consumer holding the oldest message.

use super::{
    cursor::{Cursor, Position},
    node::State,
    page::{seek, Page},
    storage::{Queue, SCAN_IDLE},
    waiter::Consumer,
};
use std::sync::{atomic::Ordering, Arc};
use tracing::debug;

impl Queue {
    /// Free consumed pages at the head of the chain and check how much of the chain is waste.
    pub(super) fn cleanup_head_pages(self: &Arc<Self>) {
        if self
            .head_cleanup
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let freed = self.pop_head_pages();
            self.head_cleanup.store(false, Ordering::Release);
            if freed > 0 {
                debug!(name = self.config.name, freed, head = self.head_order_id(), "freed head pages");
            }
        }
        self.check_waste();
    }

    fn pop_head_pages(&self) -> u64 {
        {
            let head = self.head.read();
            if !head.fully_consumed() || head.next().is_none() {
                return 0;
            }
        }
        self.skip_consumed();

        let mut head = self.head.write();
        let mut freed = 0;
        while let Some(next) = head.next() {
            if !self.poppable(&head) {
                break;
            }
            self.slots.fetch_sub(head.len() as u64, Ordering::AcqRel);
            self.pages.fetch_sub(1, Ordering::AcqRel);
            self.metrics.pages.dec();
            self.metrics.pages_freed.inc();
            *head = next;
            freed += 1;
        }
        if freed > 0 {
            let current = head.clone();
            drop(head);
            self.advance_watermark(&current);
        }
        freed
    }

    /// Returns whether the head `page` can be unlinked.
    fn poppable(&self, page: &Page) -> bool {
        if !page.fully_consumed() {
            return false;
        }
        if !matches!(self.get_cursor.load(), Position::At(at) if at >= page.end()) {
            return false;
        }
        let scan = self.expiry_scan.load(Ordering::Acquire);
        if scan != SCAN_IDLE && scan < page.end() {
            return false;
        }
        self.provably_consumed(page)
    }

    /// Returns whether every node of `page` is consumed with nobody holding its lock.
    fn provably_consumed(&self, page: &Page) -> bool {
        (0..page.len()).all(|index| {
            let node = page.node(index);
            let mut consumed = false;
            let granted = self
                .context
                .locks
                .instant(self.key(node.order_id()), &mut || {
                    consumed = node.state() == State::Consumed;
                });
            granted.is_ok() && consumed
        })
    }

    /// Move the get cursor past consumed nodes so it does not pin their page.
    fn skip_consumed(&self) {
        let Position::At(at) = self.get_cursor.load() else {
            return;
        };
        let mut to = at;
        let mut next = seek(&self.head(), at);
        while let Some(node) = next {
            if node.node().state() != State::Consumed {
                to = node.order_id();
                break;
            }
            to = node.order_id() + 1;
            next = node.subsequent();
        }
        if to > at && self.get_cursor.advance(at, to) {
            debug!(name = self.config.name, from = at, to, "skipped consumed messages");
        }
    }

    /// Evict a consumer that stopped acknowledging or splice out consumed pages if too much of
    /// the chain is consumed.
    fn check_waste(self: &Arc<Self>) {
        let cleanup = &self.config.cleanup;
        let max_page = self.config.max_page_capacity as u64;
        let unassigned = self
            .frontier
            .load(Ordering::Acquire)
            .saturating_sub(self.next_order_id.load(Ordering::Acquire));
        let depth = self.slots.load(Ordering::Acquire).saturating_sub(unassigned);
        if depth < 2 * max_page {
            return;
        }
        let buffered = self.counters.buffered.load(Ordering::Acquire);
        let waste = depth.saturating_sub(buffered) * 100 / depth;
        let evicting = cleanup.bad_acker_ratio > 0 && waste > cleanup.bad_acker_ratio;
        if !evicting && waste <= cleanup.waste_ratio {
            return;
        }

        // At most once per page worth of retired nodes
        let retired = self.retired.load(Ordering::Acquire);
        let last = self.waste_scanned.load(Ordering::Acquire);
        if retired < last.saturating_add(max_page)
            || self
                .waste_scanned
                .compare_exchange(last, retired, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }
        if evicting {
            if let Some(consumer) = self.oldest_holder() {
                if consumer.inflight() >= cleanup.bad_acker_min_inflight {
                    let _ = self.evict(&consumer);
                    return;
                }
            }
        }
        if waste > cleanup.waste_ratio {
            debug!(name = self.config.name, depth, buffered, waste, "consumed slots above waste ratio");
            self.full_clean_pages_scan();
        }
    }

    /// Returns the consumer owning the oldest in-flight message.
    fn oldest_holder(&self) -> Option<Arc<Consumer>> {
        self.assigned_nodes()
            .filter(|node| node.node().state().inflight())
            .find_map(|node| node.node().owner().map(|(consumer, _)| consumer))
    }

    /// Splice runs of consumed pages out of the chain behind the head, returning the number of
    /// pages removed. The last page is never removed.
    pub(super) fn full_clean_pages_scan(&self) -> u64 {
        let head = self.head.write();
        let mut spliced = 0;
        let mut previous = head.clone();
        while let Some(mut page) = previous.next() {
            let mut run: Vec<Arc<Page>> = Vec::new();
            while page.fully_consumed() && self.provably_consumed(&page) {
                let Some(next) = page.next() else {
                    break;
                };
                run.push(page);
                page = next;
            }
            if let Some(first) = run.first() {
                let (from, to) = (first.base(), page.base());
                previous.link().splice(page.clone());
                for removed in &run {
                    self.slots.fetch_sub(removed.len() as u64, Ordering::AcqRel);
                    self.pages.fetch_sub(1, Ordering::AcqRel);
                    self.metrics.pages.dec();
                }
                self.metrics.pages_spliced.inc_by(run.len() as u64);
                spliced += run.len() as u64;
                self.relocate(from, to);
                debug!(name = self.config.name, from, to, pages = run.len(), "spliced consumed pages");
            }
            previous = page;
        }
        spliced
    }

    /// Move cursors positioned inside `[from, to)` to `to`.
    fn relocate(&self, from: u64, to: u64) {
        let relocate = |cursor: &Cursor| {
            if let Position::At(at) = cursor.load() {
                if (from..to).contains(&at) {
                    cursor.advance(at, to);
                }
            }
        };
        relocate(&self.get_cursor);
        for consumer in self.waiters.read().iter() {
            relocate(&consumer.cursor);
        }
    }
}
