//! A paged, transactional, multi-producer/multi-consumer message queue.
//!
//! [Queue] holds the in-flight messages of a point-to-point destination, a topic subscription,
//! or a forwarding link to another server, and hands them to competing consumers.
//!
//! # Structure
//!
//! Messages live in nodes on fixed-capacity pages linked into a chain. Every node has an order id
//! (the total order of the queue) that never changes while the node lives. Producers take the next
//! node at the tail under a short put lock; the producer that takes the last node of a page
//! allocates and links the next one.
//!
//! Consumers are matched with messages without a queue-wide lock. The shared get cursor (and each
//! selecting or browsing consumer's own cursor) is one atomic word that is advanced, searched and
//! rewound with compare-and-swap. Individual messages are claimed through the external
//! [crate::lock::LockManager], which is the only mutual exclusion between a delivering consumer, a
//! replaying transaction, and an expiry or reclaim scan touching the same message.
//!
//! ```text
//!            head                                             tail
//!             |                                                 |
//!   +---------v---------+      +-------------------+      +-----v-------------+
//!   | 1 | 2 | 3 | 4 |End|----->| 5 | 6 | 7 | 8 |End|----->| 9 |   |   |   |End|
//!   +-------------------+      +-------------------+      +-------------------+
//!     C   C   D   A              A   A   A   A              A
//!                 ^
//!             get cursor       (C = consumed, D = delivered, A = available)
//! ```
//!
//! # Lifecycle of a message
//!
//! A put outside a transaction commits its store reference and then makes the message
//! available. A put inside a transaction leaves the message invisible (and locked) until the
//! transaction commits. Consumers move messages from available to delivered (and received for
//! two-phase protocols) and acknowledgements move them to consumed, or back to available on a
//! negative acknowledgement or rollback, rewinding every cursor that already passed them.
//!
//! Consumed nodes are garbage collected a page at a time from the head of the chain, and runs of
//! consumed pages trapped in the middle of the queue behind a slow consumer are spliced out.
//!
//! # Durability
//!
//! Store commits may complete asynchronously. Operations that commit return [Completion::Pending]
//! and finish in a continuation run by whichever thread the store signals. A reference deletion is
//! always committed before the message record it points to is released.
//!
//! # Example
//!
//! ```rust
//! use commonware_broker::{
//!     message::{Header, Message},
//!     mocks,
//!     queue::{AckKind, Config, Context, Kind, Options, PutOptions, Queue},
//!     store::OwnerHandle,
//! };
//! use prometheus_client::registry::Registry;
//! use std::sync::Arc;
//!
//! let context = Context {
//!     store: Arc::new(mocks::Store::default()),
//!     locks: Arc::new(mocks::Locks::default()),
//!     clock: Arc::new(mocks::Clock::default()),
//! };
//! let mut registry = Registry::default();
//! let queue = Queue::init(
//!     Config::new("orders", Kind::Point),
//!     context,
//!     OwnerHandle(1),
//!     &mut registry,
//! )
//! .unwrap();
//!
//! // Attach a consumer
//! let handler = Arc::new(mocks::Handler::default());
//! let consumer = queue
//!     .attach(
//!         Arc::new(mocks::Client::new(1, false, 128)),
//!         handler.clone(),
//!         Options::default(),
//!     )
//!     .unwrap();
//! queue.enable(&consumer).unwrap();
//!
//! // Put a message and acknowledge its delivery
//! let message = Message::new(Header::default(), &b"hello"[..]);
//! queue.put(message, None, PutOptions::default()).unwrap();
//! let delivery = handler.take().pop().unwrap();
//! let handle = delivery.handle.unwrap();
//! queue.acknowledge(&handle, AckKind::Consumed, None, None).unwrap();
//! assert_eq!(queue.stats().buffered, 0);
//! ```

mod ack;
mod cleanup;
mod config;
mod cursor;
mod deliver;
mod discard;
mod expiry;
mod limiter;
mod locate;
mod metrics;
mod node;
mod page;
mod put;
mod recovery;
mod replay;
mod storage;
mod waiter;

pub use ack::{AckBatch, AckKind, DeliveryHandle, RelinquishKind};
pub use config::{Cleanup, Config, Context, Kind, Overflow, Policy, PutLockKind, Reclaim};
pub use cursor::Position;
pub use expiry::Reap;
pub use put::PutOptions;
pub use recovery::Recovery;
pub use replay::SoftLog;
pub use storage::{Queue, Stats};
pub use waiter::{Consumer, Options, Status};

use crate::{lock, store};
use thiserror::Error;

/// Errors that can occur when interacting with a [Queue].
#[derive(Debug, Error)]
pub enum Error {
    #[error("destination full")]
    DestinationFull,
    #[error("queue deleted")]
    QueueDeleted,
    #[error("consumer is not attached")]
    WaiterInvalid,
    #[error("consumer already enabled")]
    WaiterEnabled,
    #[error("consumer already disabled")]
    WaiterDisabled,
    #[error("delivery already resolved")]
    AlreadyResolved,
    #[error("allocation failed")]
    AllocationFailed,
    #[error("unknown order id: {0}")]
    UnknownOrderId(u64),
    #[error("store error: {0}")]
    Store(#[from] store::Error),
    #[error("lock error: {0}")]
    Lock(#[from] lock::Error),
}

/// Whether an operation finished or continues after a store commit completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Done,
    Pending,
}

impl Completion {
    /// Combine two completions (pending if either is).
    pub fn and(self, other: Completion) -> Completion {
        match (self, other) {
            (Completion::Done, Completion::Done) => Completion::Done,
            _ => Completion::Pending,
        }
    }
}
