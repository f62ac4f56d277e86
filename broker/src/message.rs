//! Reference-counted messages shared between queues, in-flight deliveries, and the store.

use crate::store::MessageHandle;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

/// Delivery guarantee requested by the publisher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Reliability {
    /// Fire and forget: never redelivered after the first handoff.
    AtMostOnce,
    /// Redelivered until explicitly acknowledged.
    AtLeastOnce,
    /// Redelivered until acknowledged, with a two-phase receive/consume protocol.
    ExactlyOnce,
}

/// Header of a [Message].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Delivery guarantee.
    pub reliability: Reliability,

    /// Whether the message must be written to the store.
    pub persistent: bool,

    /// Expiry time in seconds since the epoch, if the message expires.
    pub expiry: Option<u32>,

    /// Whether the message is retained (and must be propagated as such by forwarding queues).
    pub retained: bool,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            reliability: Reliability::AtLeastOnce,
            persistent: false,
            expiry: None,
            retained: false,
        }
    }
}

struct Inner {
    header: Header,
    payload: Bytes,

    /// Store record for this message, created on first persistent put.
    record: Mutex<Option<MessageHandle>>,
}

/// An immutable message.
///
/// Cloning a [Message] adds a reference. The payload is released when the last reference (held
/// by a queue node, an in-flight delivery, or a browser) is dropped.
#[derive(Clone)]
pub struct Message(Arc<Inner>);

impl Message {
    /// Create a new message.
    pub fn new(header: Header, payload: impl Into<Bytes>) -> Self {
        Self(Arc::new(Inner {
            header,
            payload: payload.into(),
            record: Mutex::new(None),
        }))
    }

    /// Returns the message header.
    pub fn header(&self) -> &Header {
        &self.0.header
    }

    /// Returns the message payload.
    pub fn payload(&self) -> &Bytes {
        &self.0.payload
    }

    /// Returns the number of bytes this message accounts for on a queue.
    pub fn len(&self) -> u64 {
        self.0.payload.len() as u64
    }

    /// Returns whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.0.payload.is_empty()
    }

    /// Returns whether the message has expired at `now` (seconds since the epoch).
    pub fn expired(&self, now: u32) -> bool {
        matches!(self.0.header.expiry, Some(expiry) if expiry <= now)
    }

    /// Returns the store record backing this message, if it has been persisted.
    pub fn record(&self) -> Option<MessageHandle> {
        *self.0.record.lock()
    }

    /// Returns the number of live references to this message.
    pub fn references(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Run `f` with exclusive access to the store record slot.
    pub(crate) fn with_record<R>(&self, f: impl FnOnce(&mut Option<MessageHandle>) -> R) -> R {
        f(&mut self.0.record.lock())
    }

    /// Returns whether two handles refer to the same message.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.0.header)
            .field("len", &self.0.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired() {
        let message = Message::new(
            Header {
                expiry: Some(10),
                ..Default::default()
            },
            &b"payload"[..],
        );
        assert!(!message.expired(9));
        assert!(message.expired(10));
        assert!(message.expired(11));

        let forever = Message::new(Header::default(), Bytes::new());
        assert!(!forever.expired(u32::MAX));
        assert!(forever.is_empty());
    }

    #[test]
    fn test_references() {
        let message = Message::new(Header::default(), &b"abc"[..]);
        assert_eq!(message.references(), 1);
        let browsed = message.clone();
        assert_eq!(message.references(), 2);
        assert!(browsed.ptr_eq(&message));
        drop(browsed);
        assert_eq!(message.references(), 1);
        assert_eq!(message.len(), 3);
    }
}
