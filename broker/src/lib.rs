//! Deliver persistent messages to competing consumers from a paged, transactional queue.
//!
//! The [queue::Queue] is the message-storage-and-delivery core of a broker: it holds in-flight
//! messages for a subscription, a point-to-point destination, or a forwarding link to another
//! node, and hands them to one or more consumers under transactional and non-transactional
//! semantics.
//!
//! The queue does not own durability, locking, transactions, or per-client delivery-id
//! bookkeeping. Each of these is a collaborator described by a trait in this crate ([store],
//! [lock], [transaction], [client]) and supplied by the embedding broker. In-memory
//! implementations of every collaborator live in [mocks].
//!
//! # Status
//!
//! `commonware-broker` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

pub mod client;
pub mod clock;
pub mod lock;
pub mod message;
pub mod mocks;
pub mod queue;
pub mod store;
pub mod transaction;
