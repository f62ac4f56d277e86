//! Contracts with the client session (delivery-id bookkeeping) and its transport.
//!
//! A [Client] assigns the compact delivery ids used for retransmission and tracks which messages
//! it has in flight. A [Handler] receives deliveries on behalf of one consumer.

use crate::{
    lock::Key,
    message::Message,
    queue::{DeliveryHandle, Error},
    store::PersistedState,
};
use std::sync::Arc;
use thiserror::Error as ThisError;

/// Compact per-client identifier of an in-flight delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeliveryId(pub u32);

/// Reasons a delivery id could not be assigned.
#[derive(Clone, Copy, Debug, ThisError, PartialEq, Eq)]
pub enum AssignError {
    #[error("delivery ids exhausted")]
    Exhausted,
    #[error("allocation failed")]
    AllocationFailed,
}

/// A client session that consumes from queues.
pub trait Client: Send + Sync + 'static {
    /// Returns the identifier of the client.
    fn id(&self) -> u64;

    /// Returns whether the client's state survives a restart.
    ///
    /// Deliveries to durable clients are persisted so they can be redelivered after a restart.
    fn durable(&self) -> bool;

    /// Assign a delivery id to the message at `key`.
    fn assign(&self, key: Key) -> Result<DeliveryId, AssignError>;

    /// Release the delivery id of the message at `key`.
    fn release(&self, key: Key);

    /// Returns the delivery id of the message at `key` if the client has it in flight.
    fn inflight(&self, key: Key) -> Option<DeliveryId>;

    /// Returns the maximum number of delivery ids the client can hold.
    fn max_inflight(&self) -> usize;
}

/// A message handed to a [Handler].
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Handle used to acknowledge the delivery (absent if no acknowledgement is expected).
    pub handle: Option<DeliveryHandle>,
    /// The delivered message.
    pub message: Message,
    /// Order id of the message on the queue.
    pub order_id: u64,
    /// State of the message after this delivery.
    pub state: PersistedState,
    /// Delivery id assigned by the [Client], if any.
    pub delivery_id: Option<DeliveryId>,
    /// Number of times the message has been delivered.
    pub delivery_count: u8,
    /// Whether the message may have been seen before.
    pub redelivered: bool,
}

/// Receives deliveries for a consumer.
pub trait Handler: Send + Sync + 'static {
    /// Deliver a message, returning whether the consumer wants more.
    ///
    /// Returning false disables the consumer until it is enabled again.
    fn deliver(&self, delivery: Delivery) -> bool;

    /// Called when delivery failed in a way that requires the consumer to be disconnected.
    ///
    /// Returns whether the failure was handled. An unhandled failure is fatal.
    fn delivery_failed(&self, _error: &Error) -> bool {
        false
    }

    /// Called when a disable requested while the consumer was busy has completed.
    fn disabled(&self) {}

    /// Called when the consumer's in-flight messages were reclaimed because it stopped acking.
    fn evicted(&self) {}
}

/// Predicate deciding whether a consumer wants a message.
pub type Selector = Arc<dyn Fn(&Message) -> bool + Send + Sync>;
