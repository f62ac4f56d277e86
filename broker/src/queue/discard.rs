//! Space reclamation: discarding the oldest messages of a full queue, draining, and the removal
//! path shared with expiry and unacknowledged delivery.

use super::{
    config::{Kind, Overflow, Policy},
    cursor::Position,
    locate::Claim,
    node::{State, IN_STORE, RETAINED},
    page::{seek, NodeRef},
    storage::{Queue, Removal},
    Completion, Error,
};
use crate::store::{Batch, Op};
use crossbeam_utils::Backoff;
use std::sync::{atomic::Ordering, Arc};
use tracing::{debug, info, warn};

impl Queue {
    /// Discard the oldest available messages until the queue is back under `policy`.
    ///
    /// The queue is reduced to `survive_percent` of its limits, removing at most
    /// `overfill_multiplier` times the current overfill per call.
    pub(super) fn reclaim(self: &Arc<Self>, policy: &Policy) -> Completion {
        let Some(_guard) = self.get_lock.enter() else {
            return Completion::Done;
        };
        let reclaim = &self.config.reclaim;
        let target_messages = policy.max_messages.saturating_mul(reclaim.survive_percent) / 100;
        let target_bytes = policy.max_bytes.saturating_mul(reclaim.survive_percent) / 100;
        let cap = reclaim
            .overfill_multiplier
            .saturating_mul(self.overfill(policy).max(1));
        let skip_retained = self.config.kind == Kind::RemoteServer;

        let mut removed = 0u64;
        let mut from = None;
        let mut completion = Completion::Done;
        while removed < cap {
            let buffered = self.counters.buffered.load(Ordering::Acquire);
            let bytes = self.counters.bytes.load(Ordering::Acquire);
            let over_messages = policy.max_messages > 0 && buffered > target_messages;
            let over_bytes = policy.max_bytes > 0 && bytes > target_bytes;
            if !over_messages && !over_bytes {
                break;
            }
            let mut need = 0;
            if over_messages {
                need = buffered - target_messages;
            }
            if over_bytes {
                let average = (bytes / buffered.max(1)).max(1);
                need = need.max((bytes - target_bytes).div_ceil(average));
            }
            let limit = (cap - removed).min(reclaim.batch as u64).min(need);
            let (claimed, resume) = self.claim_oldest(limit as usize, from, skip_retained);
            if claimed.is_empty() {
                break;
            }
            removed += claimed.len() as u64;
            from = resume;
            completion = completion.and(self.destroy(claimed, Removal::Discarded));
        }
        if removed > 0 {
            warn!(name = self.config.name, removed, ?policy, "discarded oldest messages");
        }
        completion
    }

    /// Messages above the limits of `policy` (estimated from the average size for byte limits).
    fn overfill(&self, policy: &Policy) -> u64 {
        let buffered = self.counters.buffered.load(Ordering::Acquire);
        let bytes = self.counters.bytes.load(Ordering::Acquire);
        let mut overfill = 0;
        if policy.max_messages > 0 {
            overfill = buffered.saturating_sub(policy.max_messages);
        }
        if policy.max_bytes > 0 && bytes > policy.max_bytes && buffered > 0 {
            let average = (bytes / buffered).max(1);
            overfill = overfill.max((bytes - policy.max_bytes).div_ceil(average));
        }
        overfill
    }

    /// Reclaim space if the queue discards old messages and is full.
    pub(super) fn reclaim_if_full(self: &Arc<Self>) {
        let policy = self.policy();
        if policy.overflow != Overflow::DiscardOld {
            return;
        }
        let buffered = self.counters.buffered.load(Ordering::Acquire);
        let bytes = self.counters.bytes.load(Ordering::Acquire);
        if policy.full(buffered, bytes) {
            let _ = self.reclaim(&policy);
        }
    }

    /// Claim up to `limit` available messages for removal, oldest first.
    ///
    /// Scans from `from` (or the get cursor) and returns where a following scan should resume.
    fn claim_oldest(
        &self,
        limit: usize,
        from: Option<u64>,
        skip_retained: bool,
    ) -> (Vec<NodeRef>, Option<u64>) {
        let start = from.unwrap_or_else(|| match self.get_cursor.load() {
            Position::At(order_id) => order_id,
            Position::Searching => self.head_order_id(),
        });
        let mut claimed = Vec::new();
        let mut resume = from;
        let mut next = seek(&self.head(), start);
        while let Some(node) = next {
            if claimed.len() >= limit {
                break;
            }
            if skip_retained && node.node().has(RETAINED) {
                resume = Some(node.order_id() + 1);
                next = node.subsequent();
                continue;
            }
            match self.claim(&node, State::Discarding) {
                Claim::Claimed => claimed.push(node.clone()),
                Claim::Skip => {}
                Claim::Stop => break,
            }
            resume = Some(node.order_id() + 1);
            next = node.subsequent();
        }
        (claimed, resume)
    }

    /// Discard every message no consumer holds.
    pub fn drain(self: &Arc<Self>) -> Completion {
        let backoff = Backoff::new();
        let _guard = loop {
            if let Some(guard) = self.get_lock.enter() {
                break guard;
            }
            backoff.snooze();
        };
        let mut from = Some(self.head_order_id());
        let mut drained = 0;
        let mut completion = Completion::Done;
        loop {
            let (claimed, resume) = self.claim_oldest(self.config.reclaim.batch, from, false);
            if claimed.is_empty() {
                break;
            }
            drained += claimed.len();
            from = resume;
            completion = completion.and(self.destroy(claimed, Removal::Discarded));
        }
        info!(name = self.config.name, drained, "drained queue");
        completion
    }

    /// Remove claimed `nodes` from the queue, deleting their store references.
    ///
    /// If the deletion cannot be committed, the nodes are made available again.
    pub(super) fn destroy(self: &Arc<Self>, nodes: Vec<NodeRef>, removal: Removal) -> Completion {
        if nodes.is_empty() {
            return Completion::Done;
        }
        let sizes: Vec<u64> = nodes.iter().map(|node| self.take_out(node)).collect();
        match self.delete(&nodes, removal) {
            Ok(completion) => completion,
            Err(err) => {
                warn!(name = self.config.name, count = nodes.len(), ?removal, ?err, "failed to remove messages");
                let mut first = u64::MAX;
                for (node, bytes) in nodes.iter().zip(sizes) {
                    self.buffer(bytes);
                    node.node().set_state(State::Available);
                    self.track_expiry(node);
                    first = first.min(node.order_id());
                }
                self.rewind(first);
                self.check_waiters()
            }
        }
    }

    /// Remove `nodes` already handed out to a consumer that does not acknowledge them.
    ///
    /// The nodes are never made available again. If the deletion cannot be committed they stay
    /// [State::Discarding] and the deletion is retried by the next removal of handed out nodes
    /// or by [Queue::retry_removals].
    pub(super) fn remove_delivered(self: &Arc<Self>, nodes: Vec<NodeRef>) -> Completion {
        for node in &nodes {
            self.take_out(node);
        }
        let mut pending = std::mem::take(&mut *self.undeleted.lock());
        pending.extend(nodes);
        self.delete_delivered(pending)
    }

    /// Retry deleting handed out nodes whose removal failed to commit.
    pub fn retry_removals(self: &Arc<Self>) -> Completion {
        let pending = std::mem::take(&mut *self.undeleted.lock());
        self.delete_delivered(pending)
    }

    fn delete_delivered(self: &Arc<Self>, nodes: Vec<NodeRef>) -> Completion {
        if nodes.is_empty() {
            return Completion::Done;
        }
        match self.delete(&nodes, Removal::Consumed) {
            Ok(completion) => completion,
            Err(err) => {
                warn!(name = self.config.name, count = nodes.len(), ?err, "failed to remove delivered messages");
                self.undeleted.lock().extend(nodes);
                Completion::Done
            }
        }
    }

    /// Account for a claimed node leaving the queue, returning its size.
    fn take_out(&self, node: &NodeRef) -> u64 {
        let bytes = node
            .node()
            .with_message(|message| message.map_or(0, |m| m.len()));
        self.unbuffer(bytes);
        bytes
    }

    /// Delete the store references of `nodes`, retiring them once the deletion is durable.
    fn delete(self: &Arc<Self>, nodes: &[NodeRef], removal: Removal) -> Result<Completion, Error> {
        let mut batch = Batch::new();
        for node in nodes {
            if node.node().has(IN_STORE) {
                batch.push(Op::DeleteReference {
                    owner: self.owner,
                    order_id: node.order_id(),
                });
            }
        }
        let retired = nodes.to_vec();
        let completion = self.commit(batch, move |queue| {
            for node in &retired {
                let record = queue.retire(node);
                queue.release_record(record);
            }
            queue.cleanup_head_pages();
        })?;
        self.count_removal(removal, nodes.len() as u64);
        debug!(name = self.config.name, count = nodes.len(), ?removal, "removed messages");
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::{Header, Message, Reliability},
        mocks,
        queue::{
            config::Config,
            storage::tests::{config, consumer, numbered, persistent, put, Harness},
        },
        store::OwnerHandle,
    };
    use commonware_macros::test_traced;

    fn discarding(mut config: Config, max_messages: u64) -> Config {
        config.policy = Policy {
            max_messages,
            overflow: Overflow::DiscardOld,
            ..Default::default()
        };
        config
    }

    fn order_ids(handler: &mocks::Handler) -> Vec<u64> {
        handler.take().iter().map(|d| d.order_id).collect()
    }

    #[test_traced]
    fn test_reclaim_discards_oldest() {
        let mut harness = Harness::new();
        let queue = harness.queue(discarding(config(4), 20));
        for i in 0..20 {
            put(&queue, numbered(i));
        }
        let stats = queue.stats();
        assert_eq!(stats.buffered, 19);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.enqueued, 20);

        let (_, handler) = consumer(&queue, Arc::new(mocks::Client::new(1, false, 64)), None);
        let order_ids = order_ids(&handler);
        assert_eq!(order_ids.len(), 19);
        assert_eq!(order_ids[0], 2);
    }

    #[test_traced]
    fn test_reclaim_skips_inflight() {
        let mut harness = Harness::new();
        let queue = harness.queue(discarding(config(8), 4));
        for i in 0..3 {
            put(&queue, numbered(i));
        }
        let (_, handler) = consumer(&queue, Arc::new(mocks::Client::new(1, false, 8)), Some(1));
        assert_eq!(order_ids(&handler), vec![1]);

        put(&queue, numbered(3));
        let stats = queue.stats();
        assert_eq!(stats.buffered, 3);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.inflight, 1);

        let (_, other) = consumer(&queue, Arc::new(mocks::Client::new(2, false, 8)), None);
        assert_eq!(order_ids(&other), vec![3, 4]);
    }

    #[test_traced]
    fn test_remote_server_keeps_retained() {
        let mut harness = Harness::new();
        let mut config = discarding(Config::new("link", Kind::RemoteServer), 4);
        config.initial_page_capacity = 8;
        let queue = harness.queue(config);
        let retained = || {
            Message::new(
                Header {
                    retained: true,
                    ..Default::default()
                },
                &b"retained"[..],
            )
        };
        put(&queue, retained());
        put(&queue, retained());
        put(&queue, numbered(3));
        put(&queue, numbered(4));
        assert_eq!(queue.stats().discarded, 1);
        put(&queue, numbered(5));
        assert_eq!(queue.stats().discarded, 2);

        let (_, handler) = consumer(&queue, Arc::new(mocks::Client::new(1, false, 8)), None);
        assert_eq!(order_ids(&handler), vec![1, 2, 5]);
    }

    #[test_traced]
    fn test_set_policy_reclaims() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(4));
        for i in 0..10 {
            put(&queue, numbered(i));
        }
        let completion = queue.set_policy(Policy {
            max_messages: 5,
            overflow: Overflow::DiscardOld,
            ..Default::default()
        });
        assert_eq!(completion, Completion::Done);
        let stats = queue.stats();
        assert_eq!(stats.buffered, 4);
        assert_eq!(stats.discarded, 6);
    }

    #[test_traced]
    fn test_drain() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(4));
        for i in 0..5u64 {
            put(&queue, persistent(&i.to_be_bytes()));
        }
        let (_, handler) = consumer(&queue, Arc::new(mocks::Client::new(1, false, 8)), Some(1));
        assert_eq!(order_ids(&handler), vec![1]);

        assert_eq!(queue.drain(), Completion::Done);
        let stats = queue.stats();
        assert_eq!(stats.buffered, 1);
        assert_eq!(stats.discarded, 4);
        assert_eq!(stats.inflight, 1);
        let references = harness.store.references(OwnerHandle(7));
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].0, 1);
    }

    #[test_traced]
    fn test_failed_removal_restores() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(4));
        for i in 0..3u64 {
            put(&queue, persistent(&i.to_be_bytes()));
        }
        harness.store.fail_next_commit();
        let _ = queue.drain();
        let stats = queue.stats();
        assert_eq!(stats.buffered, 3);
        assert_eq!(stats.discarded, 0);
        assert_eq!(harness.store.references(OwnerHandle(7)).len(), 3);

        let (_, handler) = consumer(&queue, Arc::new(mocks::Client::new(1, false, 8)), None);
        assert_eq!(order_ids(&handler), vec![1, 2, 3]);
    }

    #[test_traced]
    fn test_failed_removal_of_handed_out_not_restored() {
        let mut harness = Harness::new();
        let queue = harness.queue(config(4));
        let message = Message::new(
            Header {
                persistent: true,
                reliability: Reliability::AtMostOnce,
                ..Default::default()
            },
            &b"once"[..],
        );
        put(&queue, message.clone());
        harness.store.fail_next_commit();
        let (_, handler) = consumer(&queue, Arc::new(mocks::Client::new(1, false, 8)), None);
        assert_eq!(order_ids(&handler), vec![1]);

        // Gone from the queue although its reference is still stored
        let stats = queue.stats();
        assert_eq!(stats.buffered, 0);
        assert_eq!(stats.consumed, 0);
        assert_eq!(harness.store.references(OwnerHandle(7)).len(), 1);
        let (_, other) = consumer(&queue, Arc::new(mocks::Client::new(2, false, 8)), None);
        assert!(other.take().is_empty());
        assert!(handler.take().is_empty());

        assert_eq!(queue.retry_removals(), Completion::Done);
        assert_eq!(queue.stats().consumed, 1);
        assert_eq!(queue.metrics.consumed.get(), 1);
        assert!(harness.store.references(OwnerHandle(7)).is_empty());
        assert_eq!(harness.store.usage(message.record().unwrap()), 0);
    }

    #[test_traced]
    fn test_reclaim_by_bytes_keeps_retained() {
        let mut harness = Harness::new();
        let mut config = Config::new("link", Kind::RemoteServer);
        config.initial_page_capacity = 8;
        config.policy = Policy {
            max_bytes: 100,
            overflow: Overflow::DiscardOld,
            ..Default::default()
        };
        let queue = harness.queue(config);
        let sized = |retained: bool, size: usize| {
            Message::new(
                Header {
                    retained,
                    ..Default::default()
                },
                vec![0u8; size],
            )
        };
        put(&queue, sized(true, 10));
        put(&queue, sized(true, 10));
        for _ in 3..=10 {
            put(&queue, sized(false, 10));
        }

        // Reaching the limit removes just enough to get under 95 bytes
        let stats = queue.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.buffered, 9);
        assert_eq!(stats.buffered_bytes, 90);

        // An oversized message is paid for with several average sized ones
        put(&queue, sized(false, 30));
        let stats = queue.stats();
        assert_eq!(stats.discarded, 4);
        assert_eq!(stats.buffered, 7);
        assert_eq!(stats.buffered_bytes, 90);

        let (_, handler) = consumer(&queue, Arc::new(mocks::Client::new(1, false, 16)), None);
        assert_eq!(order_ids(&handler), vec![1, 2, 7, 8, 9, 10, 11]);
    }
}
