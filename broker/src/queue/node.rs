//! A single message slot.
//!
//! The state of a node moves through:
//!
//! ```text
//! Empty -> Available -> Delivered -> Received -> Consumed
//!              ^            |            |
//!              +------------+------------+   (nack, rollback, session cleanup)
//!
//! Available -> Discarding -> Consumed         (expiry, reclaim, drain)
//! ```
//!
//! A node's message is present iff its state is neither `Empty` nor `Consumed`.

use super::{replay::SoftLog, waiter::Consumer};
use crate::{client::DeliveryId, message::Message, store::PersistedState};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU32, AtomicU8, Ordering},
    Arc,
};
use tracing::error;

/// State of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    /// Slot not produced yet.
    Empty = 0,
    Available = 1,
    Delivered = 2,
    Received = 3,
    Consumed = 4,
    /// Claimed by expiry, reclaim or drain and about to be consumed.
    Discarding = 5,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Empty,
            1 => Self::Available,
            2 => Self::Delivered,
            3 => Self::Received,
            4 => Self::Consumed,
            5 => Self::Discarding,
            _ => {
                error!(value, "unexpected node state");
                panic!("unexpected node state: {value}");
            }
        }
    }

    /// Returns whether a consumer currently holds the message.
    pub fn inflight(&self) -> bool {
        matches!(self, Self::Delivered | Self::Received)
    }

    /// Returns the state persisted with the message reference.
    pub fn persisted(&self) -> PersistedState {
        match self {
            Self::Delivered => PersistedState::Delivered,
            Self::Received => PersistedState::Received,
            Self::Consumed => PersistedState::Consumed,
            Self::Empty | Self::Available | Self::Discarding => PersistedState::Available,
        }
    }
}

/// The node has a reference in the store.
pub const IN_STORE: u8 = 1 << 0;
/// The consuming client persisted a delivery reference for the node.
pub const HAS_MDR: u8 = 1 << 1;
/// The node was put under a transaction that has not committed.
pub const UNCOMMITTED: u8 = 1 << 2;
/// The message must be propagated as retained and is never reclaimed for space.
pub const RETAINED: u8 = 1 << 3;
/// The message carries an expiry and is counted by the expiry reaper.
pub const EXPIRES: u8 = 1 << 4;

/// Acknowledgement state of a node delivered to a consumer.
pub struct AckOwner {
    pub consumer: Arc<Consumer>,
    pub generation: u32,
    /// Memory reserved at delivery so a transactional acknowledgement cannot fail.
    pub softlog: SoftLog,
}

/// One message slot.
pub struct Node {
    order_id: u64,
    state: AtomicU8,
    flags: AtomicU8,
    delivery_count: AtomicU8,
    generation: AtomicU32,
    delivery_id: Mutex<Option<DeliveryId>>,
    message: Mutex<Option<Message>>,
    ack: Mutex<Option<AckOwner>>,
}

impl Node {
    pub fn new(order_id: u64) -> Self {
        Self {
            order_id,
            state: AtomicU8::new(State::Empty as u8),
            flags: AtomicU8::new(0),
            delivery_count: AtomicU8::new(0),
            generation: AtomicU32::new(0),
            delivery_id: Mutex::new(None),
            message: Mutex::new(None),
            ack: Mutex::new(None),
        }
    }

    pub fn order_id(&self) -> u64 {
        self.order_id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Transition from `from` to `to`, returning whether the transition happened.
    pub fn transition(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub fn set(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub fn clear(&self, flag: u8) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    /// Returns whether a consumer could claim the node right now (without taking its lock).
    pub fn claimable(&self) -> bool {
        self.state() == State::Available && !self.has(UNCOMMITTED)
    }

    pub fn delivery_count(&self) -> u8 {
        self.delivery_count.load(Ordering::Acquire)
    }

    pub fn set_delivery_count(&self, count: u8) {
        self.delivery_count.store(count, Ordering::Release);
    }

    /// Record another delivery, returning the new count.
    pub fn delivered(&self) -> u8 {
        let count = self.delivery_count().saturating_add(1);
        self.delivery_count.store(count, Ordering::Release);
        count
    }

    /// Forget the most recent delivery (the message never reached the consumer).
    pub fn undelivered(&self) -> u8 {
        let count = self.delivery_count().saturating_sub(1);
        self.delivery_count.store(count, Ordering::Release);
        count
    }

    /// Start a new delivery generation, invalidating handles from earlier deliveries.
    pub fn next_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub fn delivery_id(&self) -> Option<DeliveryId> {
        *self.delivery_id.lock()
    }

    pub fn set_delivery_id(&self, id: Option<DeliveryId>) {
        *self.delivery_id.lock() = id;
    }

    /// Returns a clone of the message.
    pub fn message(&self) -> Option<Message> {
        self.message.lock().clone()
    }

    /// Fill an empty slot.
    pub fn fill(&self, message: Message, flags: u8) {
        let mut slot = self.message.lock();
        if slot.is_some() || self.state() != State::Empty {
            error!(order_id = self.order_id, "duplicate slot");
            panic!("duplicate slot: {}", self.order_id);
        }
        *slot = Some(message);
        self.flags.store(flags, Ordering::Release);
    }

    /// Run `f` with the message (if any) while holding the message lock.
    pub fn with_message<R>(&self, f: impl FnOnce(Option<&Message>) -> R) -> R {
        f(self.message.lock().as_ref())
    }

    /// Install the acknowledgement owner of a new delivery.
    pub fn own(&self, owner: AckOwner) {
        let mut ack = self.ack.lock();
        assert!(ack.is_none(), "node already owned");
        *ack = Some(owner);
    }

    /// Install an owner on an unowned, in-flight node, handing `owner` back otherwise.
    pub fn adopt(&self, owner: AckOwner) -> Result<(), AckOwner> {
        let mut ack = self.ack.lock();
        if ack.is_some() || !self.state().inflight() {
            return Err(owner);
        }
        *ack = Some(owner);
        Ok(())
    }

    /// Run `f` while no owner can be installed, if the node has none.
    pub fn unowned<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let ack = self.ack.lock();
        if ack.is_some() {
            return None;
        }
        Some(f())
    }

    /// Returns the consumer owning the node and its delivery generation.
    pub fn owner(&self) -> Option<(Arc<Consumer>, u32)> {
        self.ack
            .lock()
            .as_ref()
            .map(|owner| (owner.consumer.clone(), owner.generation))
    }

    /// Take the acknowledgement owner if it belongs to delivery `generation`.
    pub fn disown(&self, generation: u32) -> Option<AckOwner> {
        let mut ack = self.ack.lock();
        match ack.as_ref() {
            Some(owner) if owner.generation == generation => ack.take(),
            _ => None,
        }
    }

    /// Returns whether a consumer currently owns the node.
    pub fn owned(&self) -> bool {
        self.ack.lock().is_some()
    }

    /// Returns whether delivery `generation` still owns the node.
    pub fn owned_by(&self, generation: u32) -> bool {
        matches!(self.ack.lock().as_ref(), Some(owner) if owner.generation == generation)
    }

    /// Move to the consumed state, returning the message.
    pub(super) fn retire(&self) -> Option<Message> {
        let previous = State::from_u8(self.state.swap(State::Consumed as u8, Ordering::AcqRel));
        if previous == State::Consumed {
            error!(order_id = self.order_id, "node consumed twice");
            panic!("node consumed twice: {}", self.order_id);
        }
        self.flags.store(0, Ordering::Release);
        *self.delivery_id.lock() = None;
        self.message.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Header;
    use commonware_macros::test_traced;

    #[test_traced]
    fn test_transitions() {
        let node = Node::new(7);
        assert_eq!(node.state(), State::Empty);
        assert!(!node.claimable());

        node.fill(Message::new(Header::default(), &b"m"[..]), UNCOMMITTED);
        node.set_state(State::Available);
        assert!(!node.claimable());
        node.clear(UNCOMMITTED);
        assert!(node.claimable());

        assert!(node.transition(State::Available, State::Delivered));
        assert!(!node.transition(State::Available, State::Delivered));
        assert!(node.state().inflight());
        assert_eq!(node.state().persisted(), PersistedState::Delivered);

        assert!(node.retire().is_some());
        assert_eq!(node.state(), State::Consumed);
        assert!(node.message().is_none());
    }

    #[test_traced]
    fn test_delivery_count() {
        let node = Node::new(1);
        assert_eq!(node.delivered(), 1);
        assert_eq!(node.delivered(), 2);
        assert_eq!(node.undelivered(), 1);
        assert_eq!(node.undelivered(), 0);
        assert_eq!(node.undelivered(), 0);
    }

    #[test_traced]
    #[should_panic(expected = "duplicate slot")]
    fn test_duplicate_slot() {
        let node = Node::new(1);
        node.fill(Message::new(Header::default(), &b"a"[..]), 0);
        node.fill(Message::new(Header::default(), &b"b"[..]), 0);
    }

    #[test_traced]
    #[should_panic(expected = "node consumed twice")]
    fn test_consumed_twice() {
        let node = Node::new(1);
        node.retire();
        node.retire();
    }
}
