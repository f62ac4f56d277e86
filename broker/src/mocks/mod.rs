//! In-memory implementations of the queue's collaborators, for tests and examples.

mod client;
mod clock;
mod lock;
mod store;
mod transaction;

pub use client::{Client, Handler};
pub use clock::Clock;
pub use lock::Locks;
pub use store::Store;
pub use transaction::{Savepoint, Transaction, Transactions};
