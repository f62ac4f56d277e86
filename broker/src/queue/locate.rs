//! Finding the next message for a consumer.
//!
//! Plain consumers share the queue's get cursor. A getter first tries to claim the node at the
//! cursor directly and bump the cursor past it. If that node cannot be claimed, it takes the
//! cursor ([Position::Searching]), walks forward until it claims a node or reaches the end of the
//! produced messages, and publishes where it stopped. Selecting and browsing consumers scan with
//! their own cursors the same way.
//!
//! A node is claimed by moving it from `Available` to `Delivered` under an instant lock, so a
//! claim never races a transaction or scan holding the node's lock. Nodes skipped because they
//! were locked are rewound to by whoever releases them available.

use super::{
    cursor::{Position, Retry},
    node::State,
    page::NodeRef,
    storage::Queue,
    waiter::Consumer,
};
use crate::{client::Selector, message::Message};
use crossbeam_utils::Backoff;
use std::sync::atomic::Ordering;
use tracing::trace;

/// Result of looking for a message.
pub(super) enum Locate {
    /// A node claimed for the consumer (now `Delivered`).
    Found(NodeRef),
    /// A node left in flight by a previous session of the consumer's client.
    Redeliver(NodeRef),
    /// A message a browser may look at (the node is not claimed).
    Browsed(NodeRef, Message),
    /// Nothing is available.
    NoMessage,
    /// Messages are available but none matches the consumer's selector.
    NoMessageForConsumer,
}

/// Result of trying to claim a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Claim {
    Claimed,
    /// The node was not claimable (or was locked by someone else).
    Skip,
    /// The node has not been produced yet.
    Stop,
}

impl Queue {
    /// Move `node` from `Available` to `to` if nobody holds its lock.
    pub(super) fn claim(&self, node: &NodeRef, to: State) -> Claim {
        let n = node.node();
        match n.state() {
            State::Empty => return Claim::Stop,
            State::Available if n.claimable() => {}
            _ => return Claim::Skip,
        }
        let mut claimed = false;
        let granted = self
            .context
            .locks
            .instant(self.key(node.order_id()), &mut || {
                claimed = n.claimable() && n.transition(State::Available, to);
            });
        match granted {
            Ok(()) if claimed => Claim::Claimed,
            _ => Claim::Skip,
        }
    }

    /// Return a claimed node that will not be delivered after all.
    pub(super) fn unclaim(&self, node: &NodeRef) {
        node.node().transition(State::Delivered, State::Available);
        self.rewind(node.order_id());
    }

    pub(super) fn locate(&self, consumer: &Consumer) -> Locate {
        if consumer.redelivering.load(Ordering::Acquire) {
            if let Some(node) = self.locate_inflight(consumer) {
                return Locate::Redeliver(node);
            }
            // Other consumers scan with the cursor from the start
            consumer.redelivering.store(false, Ordering::Release);
            consumer.cursor.reset(self.head_order_id());
        }
        if self.redeliver_only.load(Ordering::Acquire) {
            return Locate::NoMessage;
        }
        if consumer.options.browse {
            return self.locate_browsed(consumer);
        }
        match &consumer.options.selector {
            Some(selector) => self.locate_selected(consumer, selector),
            None => self.locate_next(),
        }
    }

    /// Claim the next available node for a plain consumer.
    fn locate_next(&self) -> Locate {
        let backoff = Backoff::new();
        loop {
            let Position::At(from) = self.get_cursor.load() else {
                backoff.snooze();
                continue;
            };
            let Some(node) = self.resolve(&self.get_cursor, from) else {
                return Locate::NoMessage;
            };

            // Fast path: claim the node at the cursor and step over it
            if node.order_id() == from {
                match self.claim(&node, State::Delivered) {
                    Claim::Stop => return Locate::NoMessage,
                    Claim::Claimed => {
                        if self.get_cursor.advance(from, from + 1) {
                            return Locate::Found(node);
                        }
                        match self.get_cursor.load() {
                            // Rewound to (or before) the claimed node
                            Position::At(now) if now <= from => {
                                self.unclaim(&node);
                                continue;
                            }
                            _ => return Locate::Found(node),
                        }
                    }
                    Claim::Skip => {}
                }
            }

            // Slow path: take the cursor and search forward
            if !self.get_cursor.begin_search(from) {
                continue;
            }
            match self.search(node) {
                Ok(located) => return located,
                Err(Retry) => {
                    trace!(name = self.config.name, from, "search rewound");
                    continue;
                }
            }
        }
    }

    /// Walk forward from `node` with the get cursor taken, publishing where the walk stopped.
    fn search(&self, mut node: NodeRef) -> Result<Locate, Retry> {
        loop {
            match self.claim(&node, State::Delivered) {
                Claim::Claimed => {
                    if let Err(retry) = self.get_cursor.publish(node.order_id() + 1) {
                        self.unclaim(&node);
                        return Err(retry);
                    }
                    return Ok(Locate::Found(node));
                }
                Claim::Stop => {
                    self.get_cursor.publish(node.order_id())?;
                    return Ok(Locate::NoMessage);
                }
                Claim::Skip => match node.subsequent() {
                    Some(next) => node = next,
                    None => {
                        self.get_cursor.publish(node.order_id() + 1)?;
                        return Ok(Locate::NoMessage);
                    }
                },
            }
        }
    }

    /// Claim the next available node matching `selector`.
    fn locate_selected(&self, consumer: &Consumer, selector: &Selector) -> Locate {
        loop {
            // Only the thread delivering to the consumer searches its cursor
            let Position::At(own) = consumer.cursor.load() else {
                return Locate::NoMessage;
            };
            let from = match self.get_cursor.load() {
                Position::At(shared) => own.max(shared),
                Position::Searching => own,
            };
            if !consumer.cursor.begin_search(own) {
                continue;
            }

            let mut position = from;
            let mut rejected = false;
            let mut current = self.resolve(&consumer.cursor, from);
            let found = loop {
                let Some(node) = current else {
                    break None;
                };
                position = node.order_id();
                let n = node.node();
                if n.state() == State::Empty {
                    break None;
                }
                if n.claimable() {
                    match n.message() {
                        Some(message) if selector(&message) => {
                            if self.claim(&node, State::Delivered) == Claim::Claimed {
                                break Some(node);
                            }
                        }
                        Some(_) => rejected = true,
                        None => {}
                    }
                }
                position = node.order_id() + 1;
                current = node.subsequent();
            };

            let publish = found.as_ref().map_or(position, |node| node.order_id() + 1);
            if consumer.cursor.publish(publish).is_err() {
                if let Some(node) = found {
                    self.unclaim(&node);
                }
                continue;
            }
            return match found {
                Some(node) => Locate::Found(node),
                None if rejected => Locate::NoMessageForConsumer,
                None => Locate::NoMessage,
            };
        }
    }

    /// Find the next available node a browser has not seen.
    fn locate_browsed(&self, consumer: &Consumer) -> Locate {
        loop {
            let Position::At(own) = consumer.cursor.load() else {
                return Locate::NoMessage;
            };
            if !consumer.cursor.begin_search(own) {
                continue;
            }
            let selector = consumer.options.selector.as_ref();
            let mut position = own;
            let mut rejected = false;
            let mut current = self.resolve(&consumer.cursor, own);
            let found = loop {
                let Some(node) = current else {
                    break None;
                };
                position = node.order_id();
                let n = node.node();
                if n.state() == State::Empty {
                    break None;
                }
                if n.claimable() {
                    if let Some(message) = n.message() {
                        if selector.map_or(true, |selector| selector(&message)) {
                            break Some((node, message));
                        }
                        rejected = true;
                    }
                }
                position = node.order_id() + 1;
                current = node.subsequent();
            };

            let publish = found
                .as_ref()
                .map_or(position, |(node, _)| node.order_id() + 1);
            if consumer.cursor.publish(publish).is_err() {
                continue;
            }
            return match found {
                Some((node, message)) => Locate::Browsed(node, message),
                None if rejected => Locate::NoMessageForConsumer,
                None => Locate::NoMessage,
            };
        }
    }

    /// Find the next node the consumer's client still has in flight from a previous session.
    fn locate_inflight(&self, consumer: &Consumer) -> Option<NodeRef> {
        let Position::At(own) = consumer.cursor.load() else {
            return None;
        };
        let mut current = self.resolve(&consumer.cursor, own);
        while let Some(node) = current {
            let n = node.node();
            if n.state() == State::Empty {
                break;
            }
            if self.adoptable(consumer, &node) {
                consumer
                    .cursor
                    .advance(own, node.order_id() + 1);
                return Some(node);
            }
            current = node.subsequent();
        }
        None
    }

    /// Returns whether `node` is an unowned delivery to the consumer's client.
    fn adoptable(&self, consumer: &Consumer, node: &NodeRef) -> bool {
        let n = node.node();
        if !n.state().inflight() || n.owned() {
            return false;
        }
        let key = self.key(node.order_id());
        let mut adoptable = false;
        let granted = self.context.locks.instant(key, &mut || {
            adoptable = n.state().inflight()
                && !n.owned()
                && consumer.client.inflight(key).is_some();
        });
        granted.is_ok() && adoptable
    }

    /// Returns whether a message could be delivered to `consumer` right now.
    pub fn check_available(&self, consumer: &Consumer) -> bool {
        if consumer.redelivering.load(Ordering::Acquire) {
            let Position::At(own) = consumer.cursor.load() else {
                return true;
            };
            let mut current = self.resolve(&consumer.cursor, own);
            while let Some(node) = current {
                if node.node().state() == State::Empty {
                    break;
                }
                if self.adoptable(consumer, &node) {
                    return true;
                }
                current = node.subsequent();
            }
        }
        if self.redeliver_only.load(Ordering::Acquire) {
            return false;
        }

        let shared = match self.get_cursor.load() {
            Position::At(shared) => shared,
            Position::Searching => return true,
        };
        let from = if consumer.options.browse {
            match consumer.cursor.load() {
                Position::At(own) => own,
                Position::Searching => return true,
            }
        } else if consumer.options.selector.is_some() {
            match consumer.cursor.load() {
                Position::At(own) => own.max(shared),
                Position::Searching => return true,
            }
        } else {
            shared
        };
        let selector = consumer.options.selector.as_ref();
        let mut current = self.resolve(&self.get_cursor, from);
        while let Some(node) = current {
            let n = node.node();
            if n.state() == State::Empty {
                break;
            }
            if n.claimable() {
                let matches = n.with_message(|message| {
                    message.is_some_and(|message| selector.map_or(true, |s| s(message)))
                });
                if matches {
                    return true;
                }
            }
            current = node.subsequent();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lock::{LockManager, Scope},
        message::Header,
        mocks,
        queue::{
            storage::tests::{config, message, number, numbered, put, Harness},
            AckKind, Options, PutOptions,
        },
        transaction::TransactionId,
    };
    use commonware_macros::test_traced;
    use std::sync::Arc;

    #[test_traced]
    fn test_fast_path_advances_cursor() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(4));
        for i in 0..3 {
            put(&queue, numbered(i));
        }
        let Locate::Found(node) = queue.locate_next() else {
            panic!("expected a message");
        };
        assert_eq!(node.order_id(), 1);
        assert_eq!(node.node().state(), State::Delivered);
        assert_eq!(queue.position(), Position::At(2));
    }

    #[test_traced]
    fn test_search_skips_claimed() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(2));
        for i in 0..5 {
            put(&queue, numbered(i));
        }
        // Claim the second and third messages out of band
        for node in queue.nodes().skip(1).take(2) {
            assert!(node.node().transition(State::Available, State::Delivered));
        }
        let Locate::Found(first) = queue.locate_next() else {
            panic!("expected a message");
        };
        let Locate::Found(fourth) = queue.locate_next() else {
            panic!("expected a message");
        };
        assert_eq!(first.order_id(), 1);
        assert_eq!(fourth.order_id(), 4);
        assert_eq!(queue.position(), Position::At(5));
    }

    #[test_traced]
    fn test_search_stops_at_empty() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(4));
        put(&queue, numbered(0));
        assert!(matches!(queue.locate_next(), Locate::Found(_)));
        assert!(matches!(queue.locate_next(), Locate::NoMessage));
        assert_eq!(queue.position(), Position::At(2));

        put(&queue, numbered(1));
        let Locate::Found(node) = queue.locate_next() else {
            panic!("expected a message");
        };
        assert_eq!(node.order_id(), 2);
    }

    #[test_traced]
    fn test_locked_node_skipped_then_rewound() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(4));
        put(&queue, numbered(0));
        put(&queue, numbered(1));

        // A transaction holds the first message's lock
        let txn = TransactionId(99);
        harness
            .locks
            .lock(queue.key(1), Scope::Commit(txn), false)
            .unwrap();
        let Locate::Found(node) = queue.locate_next() else {
            panic!("expected a message");
        };
        assert_eq!(node.order_id(), 2);
        assert_eq!(queue.position(), Position::At(3));

        // Releasing it available rewinds the cursor
        harness.locks.release_transaction(txn);
        queue.rewind(1);
        let Locate::Found(node) = queue.locate_next() else {
            panic!("expected a message");
        };
        assert_eq!(node.order_id(), 1);
    }

    #[test_traced]
    fn test_out_of_order_commit_rewinds() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(8));
        for i in 0..4 {
            put(&queue, numbered(i));
        }

        // A puts order id 5, B puts order id 6, and B commits first
        let a = harness.transactions.begin();
        queue.put(numbered(5), Some(&a), PutOptions::default()).unwrap();
        let b = harness.transactions.begin();
        queue.put(numbered(6), Some(&b), PutOptions::default()).unwrap();
        harness.transactions.commit(b).unwrap();

        let handler = Arc::new(mocks::Handler::default());
        let consumer = queue
            .attach(
                Arc::new(mocks::Client::new(1, false, 64)),
                handler.clone(),
                Options::default(),
            )
            .unwrap();
        queue.enable(&consumer).unwrap();
        let order_ids: Vec<_> = handler.take().iter().map(|d| d.order_id).collect();
        assert_eq!(order_ids, vec![1, 2, 3, 4, 6]);

        // A's commit rewinds past the cursor and its message is delivered
        harness.transactions.commit(a).unwrap();
        let deliveries = handler.take();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].order_id, 5);
        assert_eq!(number(&deliveries[0].message), 5);
    }

    #[test_traced]
    fn test_selector() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(4));
        for i in 0..6 {
            put(&queue, numbered(i));
        }
        let even: Selector = Arc::new(|message: &Message| number(message) % 2 == 0);
        let handler = Arc::new(mocks::Handler::default());
        let consumer = queue
            .attach(
                Arc::new(mocks::Client::new(1, false, 64)),
                handler.clone(),
                Options {
                    selector: Some(even.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        queue.enable(&consumer).unwrap();
        let numbers: Vec<_> = handler.take().iter().map(|d| number(&d.message)).collect();
        assert_eq!(numbers, vec![0, 2, 4]);

        // Odd messages remain for everyone else
        assert_eq!(queue.stats().buffered, 6);
        assert!(!queue.check_available(&consumer));
        assert_eq!(
            consumer.last_checked.load(Ordering::Acquire),
            queue.check_waiters_val.load(Ordering::Acquire)
        );

        // A new match is found past the rejected ones
        put(&queue, numbered(8));
        let numbers: Vec<_> = handler.take().iter().map(|d| number(&d.message)).collect();
        assert_eq!(numbers, vec![8]);
    }

    #[test_traced]
    fn test_selector_sees_nacked_message() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(4));
        put(&queue, numbered(2));
        let all: Selector = Arc::new(|_: &Message| true);
        let handler = Arc::new(mocks::Handler::default());
        let consumer = queue
            .attach(
                Arc::new(mocks::Client::new(1, false, 64)),
                handler.clone(),
                Options {
                    selector: Some(all),
                    ..Default::default()
                },
            )
            .unwrap();
        queue.enable(&consumer).unwrap();
        let delivery = handler.take().pop().unwrap();

        // The nack rewinds the selecting consumer's own cursor
        queue
            .acknowledge(delivery.handle.as_ref().unwrap(), AckKind::NotReceived, None, None)
            .unwrap();
        let again = handler.take().pop().unwrap();
        assert_eq!(again.order_id, delivery.order_id);
        assert_eq!(again.delivery_count, 2);
        assert!(again.redelivered);
    }

    #[test_traced]
    fn test_browse() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(2));
        for i in 0..3 {
            put(&queue, numbered(i));
        }
        let handler = Arc::new(mocks::Handler::default());
        let browser = queue
            .attach(
                Arc::new(mocks::Client::new(1, false, 64)),
                handler.clone(),
                Options {
                    browse: true,
                    ..Default::default()
                },
            )
            .unwrap();
        queue.enable(&browser).unwrap();
        let deliveries = handler.take();
        assert_eq!(deliveries.len(), 3);
        assert!(deliveries.iter().all(|d| d.handle.is_none()));

        // Browsing leaves everything available
        let stats = queue.stats();
        assert_eq!(stats.buffered, 3);
        assert_eq!(stats.inflight, 0);
        assert_eq!(queue.position(), Position::At(1));

        // Only new messages are browsed next
        put(&queue, numbered(3));
        let numbers: Vec<_> = handler.take().iter().map(|d| number(&d.message)).collect();
        assert_eq!(numbers, vec![3]);
    }

    #[test_traced]
    fn test_redeliver_only() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(4));
        put(&queue, message(b"m"));
        queue.redeliver_only(true);
        let handler = Arc::new(mocks::Handler::default());
        let consumer = queue
            .attach(
                Arc::new(mocks::Client::new(1, false, 64)),
                handler.clone(),
                Options::default(),
            )
            .unwrap();
        queue.enable(&consumer).unwrap();
        assert!(handler.take().is_empty());
        assert!(!queue.check_available(&consumer));

        queue.redeliver_only(false);
        assert_eq!(handler.take().len(), 1);
    }

    #[test_traced]
    fn test_uncommitted_not_available() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(4));
        let txn = harness.transactions.begin();
        queue
            .put(
                Message::new(Header::default(), &b"t"[..]),
                Some(&txn),
                PutOptions::default(),
            )
            .unwrap();
        assert!(matches!(queue.locate_next(), Locate::NoMessage));
        harness.transactions.rollback(txn);
    }
}
