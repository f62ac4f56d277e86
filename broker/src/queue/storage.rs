use super::{
    config::{Config, Context, Kind, Policy, PutLockKind},
    cursor::{Cursor, Position},
    expiry::ExpiryCache,
    limiter::Limiter,
    metrics::Metrics,
    node::{EXPIRES, IN_STORE},
    page::{seek, NodeRef, Page},
    waiter::{Consumer, Options, Status},
    Completion, Error,
};
use crate::{
    client::{Client, Handler},
    lock::Key,
    store::{Batch, Commit, MessageHandle, OwnerHandle},
};
use crossbeam_utils::Backoff;
use parking_lot::{Mutex, MutexGuard, RwLock};
use prometheus_client::registry::Registry;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use tracing::{debug, error, info, warn};

/// Position of the next unassigned node.
pub(super) struct Tail {
    pub page: Arc<Page>,
    pub index: usize,
}

/// Serializes slot assignment.
pub(super) struct PutLock {
    kind: PutLockKind,
    tail: Mutex<Tail>,
}

impl PutLock {
    fn new(kind: PutLockKind, tail: Tail) -> Self {
        Self {
            kind,
            tail: Mutex::new(tail),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Tail> {
        match self.kind {
            PutLockKind::Mutex => self.tail.lock(),
            PutLockKind::Spin => {
                let backoff = Backoff::new();
                loop {
                    if let Some(tail) = self.tail.try_lock() {
                        return tail;
                    }
                    backoff.snooze();
                }
            }
        }
    }
}

/// Why a message left the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Removal {
    Consumed,
    Expired,
    Discarded,
}

#[derive(Default)]
pub(super) struct Counters {
    pub buffered: AtomicU64,
    pub bytes: AtomicU64,
    pub inflight: AtomicU64,
    pub high_water_mark: AtomicU64,
    pub enqueued: AtomicU64,
    pub consumed: AtomicU64,
    pub expired: AtomicU64,
    pub discarded: AtomicU64,
    pub rejected: AtomicU64,
    /// Live messages carrying an expiry.
    pub with_expiry: AtomicU64,
}

/// Snapshot of a queue's counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub buffered: u64,
    pub buffered_bytes: u64,
    pub high_water_mark: u64,
    pub inflight: u64,
    pub enqueued: u64,
    pub consumed: u64,
    pub expired: u64,
    pub discarded: u64,
    pub rejected: u64,
    pub pages: u64,
    pub consumers: usize,
}

/// An in-memory, store-backed message queue.
///
/// See the [module documentation](super) for an overview.
pub struct Queue {
    pub(super) config: Config,
    pub(super) policy: RwLock<Policy>,
    pub(super) context: Context,
    pub(super) owner: OwnerHandle,

    pub(super) put_lock: PutLock,
    /// Next order id to assign (mirrors the put lock's tail for lock-free readers).
    pub(super) next_order_id: AtomicU64,
    /// Order id following the last node of the newest page.
    pub(super) frontier: AtomicU64,
    /// Nodes on pages reachable from the head.
    pub(super) slots: AtomicU64,
    pub(super) pages: AtomicU64,

    pub(super) head: RwLock<Arc<Page>>,
    pub(super) get_cursor: Cursor,

    /// Bumped whenever a message may have become available.
    pub(super) check_waiters_val: AtomicU64,
    pub(super) waiters: RwLock<Vec<Arc<Consumer>>>,
    next_consumer: AtomicU64,
    rotation: AtomicUsize,

    pub(super) counters: Counters,

    /// Outstanding reasons to keep the queue's store records (starts at one for the queue itself).
    pre_delete: AtomicU64,
    deleted: AtomicBool,
    deletion_completed: AtomicBool,

    /// Set while the in-flight limit of the policy is reached.
    pub(super) full_delivery_prevention: AtomicBool,
    pub(super) redeliver_only: AtomicBool,

    /// Serializes expiry reaping and space reclamation.
    pub(super) get_lock: Limiter,
    pub(super) head_cleanup: AtomicBool,
    pub(super) freed_since_watermark: AtomicU64,
    /// Nodes retired since the queue was built.
    pub(super) retired: AtomicU64,
    /// Value of [Queue::retired] at the last waste check that scanned the chain.
    pub(super) waste_scanned: AtomicU64,
    pub(super) expiry: Mutex<ExpiryCache>,
    /// Position of a full expiry scan in progress (`u64::MAX` when idle).
    pub(super) expiry_scan: AtomicU64,
    /// Handed out nodes whose deletion failed to commit.
    pub(super) undeleted: Mutex<Vec<NodeRef>>,

    pub(super) metrics: Metrics,
}

/// Value of [Queue::expiry_scan] while no full scan runs.
pub(super) const SCAN_IDLE: u64 = u64::MAX;

impl Queue {
    /// Create an empty queue.
    pub fn init(
        config: Config,
        context: Context,
        owner: OwnerHandle,
        registry: &mut Registry,
    ) -> Result<Arc<Self>, Error> {
        config.validate();
        let head = Page::try_new(1, config.initial_page_capacity)?;
        let next = Page::try_new(head.end(), config.initial_page_capacity)?;
        head.link().complete(next);
        let queue = Self::build(
            config,
            context,
            owner,
            registry,
            vec![head.clone()],
            Tail {
                page: head.clone(),
                index: 0,
            },
        );
        info!(name = queue.config.name, owner = owner.0, "created queue");
        Ok(queue)
    }

    /// Assemble a queue from linked `pages` (the first is the head) with slot assignment
    /// resuming at `tail`.
    pub(super) fn build(
        config: Config,
        context: Context,
        owner: OwnerHandle,
        registry: &mut Registry,
        pages: Vec<Arc<Page>>,
        tail: Tail,
    ) -> Arc<Self> {
        let head = pages[0].clone();
        let mut slots = 0;
        let mut count = 0;
        let mut frontier = head.end();
        let mut page = Some(head.clone());
        while let Some(current) = page {
            slots += current.len() as u64;
            count += 1;
            frontier = current.end();
            page = current.next();
        }
        let next_order_id = tail.page.base() + tail.index as u64;
        let metrics = Metrics::init(registry, &config.name);
        metrics.pages.set(count as i64);
        let policy = config.policy.clone();
        let reclaim_waiters = config.reclaim.max_waiters;
        let expiry_cache_size = config.expiry_cache_size;
        let cursor = head.base();
        Arc::new(Self {
            put_lock: PutLock::new(config.put_lock, tail),
            config,
            policy: RwLock::new(policy),
            context,
            owner,
            next_order_id: AtomicU64::new(next_order_id),
            frontier: AtomicU64::new(frontier),
            slots: AtomicU64::new(slots),
            pages: AtomicU64::new(count),
            head: RwLock::new(head),
            get_cursor: Cursor::new(cursor),
            check_waiters_val: AtomicU64::new(0),
            waiters: RwLock::new(Vec::new()),
            next_consumer: AtomicU64::new(1),
            rotation: AtomicUsize::new(0),
            counters: Counters::default(),
            pre_delete: AtomicU64::new(1),
            deleted: AtomicBool::new(false),
            deletion_completed: AtomicBool::new(false),
            full_delivery_prevention: AtomicBool::new(false),
            redeliver_only: AtomicBool::new(false),
            get_lock: Limiter::new(reclaim_waiters),
            head_cleanup: AtomicBool::new(false),
            freed_since_watermark: AtomicU64::new(0),
            retired: AtomicU64::new(0),
            waste_scanned: AtomicU64::new(0),
            expiry: Mutex::new(ExpiryCache::new(expiry_cache_size)),
            expiry_scan: AtomicU64::new(SCAN_IDLE),
            undeleted: Mutex::new(Vec::new()),
            metrics,
        })
    }

    /// Returns the name of the queue.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the role of the queue.
    pub fn kind(&self) -> Kind {
        self.config.kind
    }

    /// Returns the store handle owning the queue's references.
    pub fn owner(&self) -> OwnerHandle {
        self.owner
    }

    /// Returns the position of the shared get cursor.
    pub fn position(&self) -> Position {
        self.get_cursor.load()
    }

    /// Returns the order id of the first node still linked.
    pub fn head_order_id(&self) -> u64 {
        self.head.read().base()
    }

    pub(super) fn head(&self) -> Arc<Page> {
        self.head.read().clone()
    }

    pub(super) fn key(&self, order_id: u64) -> Key {
        Key::new(self.owner.0, order_id)
    }

    /// Resolve `order_id` against the chain using `cursor`'s page hint.
    pub(super) fn resolve(&self, cursor: &Cursor, order_id: u64) -> Option<NodeRef> {
        let head = self.head();
        cursor.resolve(&head, order_id)
    }

    /// Find the node with exactly `order_id`.
    pub(super) fn find(&self, order_id: u64) -> Option<NodeRef> {
        seek(&self.head(), order_id).filter(|node| node.order_id() == order_id)
    }

    /// Iterate over every linked node from the head.
    pub(super) fn nodes(&self) -> impl Iterator<Item = NodeRef> {
        let head = self.head();
        std::iter::successors(Some(NodeRef::new(head, 0)), |node| node.subsequent())
    }

    /// Iterate over every node assigned to a producer.
    ///
    /// Nodes of puts whose commit is still outstanding are [super::node::State::Empty].
    pub(super) fn assigned_nodes(&self) -> impl Iterator<Item = NodeRef> {
        let next = self.next_order_id.load(Ordering::Acquire);
        self.nodes().take_while(move |node| node.order_id() < next)
    }

    /// Note that a message may have become available.
    pub(super) fn bump(&self) {
        self.check_waiters_val.fetch_add(1, Ordering::AcqRel);
    }

    /// Move every cursor back to `order_id` so the message there is considered again.
    pub(super) fn rewind(&self, order_id: u64) {
        if self.get_cursor.rewind(order_id) {
            debug!(name = self.config.name, order_id, "rewound get cursor");
        }
        for consumer in self.waiters.read().iter() {
            if consumer.scans_own_cursor() {
                consumer.cursor.rewind(order_id);
            }
        }
        self.bump();
    }

    /// Account for a message added to the queue.
    pub(super) fn buffer(&self, bytes: u64) {
        let buffered = self.counters.buffered.fetch_add(1, Ordering::AcqRel) + 1;
        let total = self.counters.bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        let previous = self
            .counters
            .high_water_mark
            .fetch_max(buffered, Ordering::AcqRel);
        self.metrics.buffered.set(buffered as i64);
        self.metrics.buffered_bytes.set(total as i64);
        if buffered > previous {
            self.metrics.high_water_mark.set(buffered as i64);
        }
    }

    /// Account for a message leaving the queue.
    ///
    /// Why it left is counted separately with [Queue::count_removal] once the removal is
    /// accepted by the store.
    pub(super) fn unbuffer(&self, bytes: u64) {
        let buffered = self.counters.buffered.fetch_sub(1, Ordering::AcqRel) - 1;
        let total = self.counters.bytes.fetch_sub(bytes, Ordering::AcqRel) - bytes;
        self.metrics.buffered.set(buffered as i64);
        self.metrics.buffered_bytes.set(total as i64);
    }

    /// Count `count` messages that left the queue for `removal`.
    pub(super) fn count_removal(&self, removal: Removal, count: u64) {
        let (counter, metric) = match removal {
            Removal::Consumed => (&self.counters.consumed, &self.metrics.consumed),
            Removal::Expired => (&self.counters.expired, &self.metrics.expired),
            Removal::Discarded => (&self.counters.discarded, &self.metrics.discarded),
        };
        counter.fetch_add(count, Ordering::AcqRel);
        metric.inc_by(count);
    }

    pub(super) fn add_inflight(&self) {
        let inflight = self.counters.inflight.fetch_add(1, Ordering::AcqRel) + 1;
        self.metrics.inflight.set(inflight as i64);
    }

    /// Account for a message no longer in flight, returning whether this lifted the in-flight
    /// limit (the caller must then check waiters).
    pub(super) fn remove_inflight(&self) -> bool {
        let inflight = self.counters.inflight.fetch_sub(1, Ordering::AcqRel) - 1;
        self.metrics.inflight.set(inflight as i64);
        let max = self.policy.read().max_inflight;
        if (max == 0 || inflight < max)
            && self.full_delivery_prevention.swap(false, Ordering::AcqRel)
        {
            debug!(name = self.config.name, inflight, "lifted delivery prevention");
            return true;
        }
        false
    }

    /// Returns whether the in-flight limit is reached, setting delivery prevention if so.
    pub(super) fn inflight_capped(&self) -> bool {
        let max = self.policy.read().max_inflight;
        if max == 0 || self.counters.inflight.load(Ordering::Acquire) < max {
            return false;
        }
        if !self.full_delivery_prevention.swap(true, Ordering::AcqRel) {
            debug!(name = self.config.name, max, "reached in-flight limit");
        }
        // An acknowledgement may have completed between the check and setting the flag
        if self.counters.inflight.load(Ordering::Acquire) < max {
            self.full_delivery_prevention.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Start tracking the expiry of a newly visible message.
    pub(super) fn track_expiry(&self, node: &NodeRef) {
        let n = node.node();
        let Some(expiry) = n.with_message(|message| message.and_then(|m| m.header().expiry)) else {
            return;
        };
        if !n.has(EXPIRES) {
            n.set(EXPIRES);
            self.counters.with_expiry.fetch_add(1, Ordering::AcqRel);
        }
        self.expiry.lock().insert(expiry, node.order_id());
    }

    /// Move a node to the consumed state, returning the message record its reference used if
    /// the message was persisted.
    pub(super) fn retire(&self, node: &NodeRef) -> Option<MessageHandle> {
        let n = node.node();
        let in_store = n.has(IN_STORE);
        if n.has(EXPIRES) {
            self.counters.with_expiry.fetch_sub(1, Ordering::AcqRel);
        }
        let message = node.retire();
        self.freed_since_watermark.fetch_add(1, Ordering::AcqRel);
        self.retired.fetch_add(1, Ordering::AcqRel);
        message
            .filter(|_| in_store)
            .and_then(|message| message.record())
    }

    /// Release the usage a (committed) deleted reference held on its message record.
    pub(super) fn release_record(&self, record: Option<MessageHandle>) {
        let Some(record) = record else {
            return;
        };
        if let Err(err) = self.context.store.release_message(record) {
            warn!(name = self.config.name, ?record, ?err, "failed to release message");
        }
    }

    /// Commit `batch` and run `then` once it is durable.
    ///
    /// `then` runs on this thread if the commit completes immediately (or the batch is empty),
    /// otherwise on the thread that completes the commit.
    pub(super) fn commit<F>(self: &Arc<Self>, batch: Batch, then: F) -> Result<Completion, Error>
    where
        F: FnOnce(&Arc<Queue>) + Send + 'static,
    {
        if batch.is_empty() {
            then(self);
            return Ok(Completion::Done);
        }
        match self.context.store.commit(batch)? {
            Commit::Done => {
                then(self);
                Ok(Completion::Done)
            }
            Commit::Pending(pending) => {
                self.hold();
                let queue = self.clone();
                pending.then(move |result| {
                    queue.expect_committed(result);
                    then(&queue);
                    queue.unhold();
                });
                Ok(Completion::Pending)
            }
        }
    }

    /// A batch that failed to commit asynchronously leaves memory and store out of sync.
    pub(super) fn expect_committed(&self, result: Result<(), crate::store::Error>) {
        if let Err(err) = result {
            error!(name = self.config.name, ?err, "asynchronous commit failed");
            panic!("asynchronous commit failed: {err}");
        }
    }

    /// Keep the queue's store records until a matching [Queue::unhold].
    pub(super) fn hold(&self) {
        self.pre_delete.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn unhold(&self) {
        if self.pre_delete.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.deletion_completed.store(true, Ordering::Release);
        if let Err(err) = self.context.store.delete_owner(self.owner) {
            error!(name = self.config.name, ?err, "failed to delete queue records");
            return;
        }
        info!(name = self.config.name, owner = self.owner.0, "deleted queue");
    }

    /// Mark the queue deleted. Its store records are removed once nothing uses them.
    pub fn mark_deleted(&self) -> Result<(), Error> {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return Err(Error::QueueDeleted);
        }
        info!(name = self.config.name, "marked queue deleted");
        self.unhold();
        Ok(())
    }

    /// Returns whether [Queue::mark_deleted] was called.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Returns whether the store records of a deleted queue were removed.
    pub fn deletion_completed(&self) -> bool {
        self.deletion_completed.load(Ordering::Acquire)
    }

    /// Returns the current limits.
    pub fn policy(&self) -> Policy {
        self.policy.read().clone()
    }

    /// Replace the limits.
    pub fn set_policy(self: &Arc<Self>, policy: Policy) -> Completion {
        info!(name = self.config.name, ?policy, "updated policy");
        *self.policy.write() = policy.clone();
        let mut completion = Completion::Done;
        let buffered = self.counters.buffered.load(Ordering::Acquire);
        let bytes = self.counters.bytes.load(Ordering::Acquire);
        if policy.overflow == super::Overflow::DiscardOld && policy.full(buffered, bytes) {
            completion = self.reclaim(&policy);
        }
        let inflight = self.counters.inflight.load(Ordering::Acquire);
        if (policy.max_inflight == 0 || inflight < policy.max_inflight)
            && self.full_delivery_prevention.swap(false, Ordering::AcqRel)
        {
            completion = completion.and(self.check_waiters());
        }
        completion
    }

    /// Deliver only messages left in flight by a previous session until cleared.
    pub fn redeliver_only(self: &Arc<Self>, enabled: bool) -> Completion {
        self.redeliver_only.store(enabled, Ordering::Release);
        debug!(name = self.config.name, enabled, "set redeliver only");
        if enabled {
            return Completion::Done;
        }
        self.bump();
        self.check_waiters()
    }

    /// Returns a snapshot of the queue's counters.
    pub fn stats(&self) -> Stats {
        let c = &self.counters;
        Stats {
            buffered: c.buffered.load(Ordering::Acquire),
            buffered_bytes: c.bytes.load(Ordering::Acquire),
            high_water_mark: c.high_water_mark.load(Ordering::Acquire),
            inflight: c.inflight.load(Ordering::Acquire),
            enqueued: c.enqueued.load(Ordering::Acquire),
            consumed: c.consumed.load(Ordering::Acquire),
            expired: c.expired.load(Ordering::Acquire),
            discarded: c.discarded.load(Ordering::Acquire),
            rejected: c.rejected.load(Ordering::Acquire),
            pages: self.pages.load(Ordering::Acquire),
            consumers: self.waiters.read().len(),
        }
    }

    /// Reset the cumulative counters (the high water mark restarts at the current depth).
    pub fn reset_stats(&self) {
        let c = &self.counters;
        c.enqueued.store(0, Ordering::Release);
        c.consumed.store(0, Ordering::Release);
        c.expired.store(0, Ordering::Release);
        c.discarded.store(0, Ordering::Release);
        c.rejected.store(0, Ordering::Release);
        let buffered = c.buffered.load(Ordering::Acquire);
        c.high_water_mark.store(buffered, Ordering::Release);
        self.metrics.high_water_mark.set(buffered as i64);
    }

    /// Attach a consumer. It receives nothing until [Queue::enable] is called.
    pub fn attach(
        &self,
        client: Arc<dyn Client>,
        handler: Arc<dyn Handler>,
        options: Options,
    ) -> Result<Arc<Consumer>, Error> {
        if self.is_deleted() {
            return Err(Error::QueueDeleted);
        }
        let id = self.next_consumer.fetch_add(1, Ordering::AcqRel);
        let consumer = Arc::new(Consumer::new(
            id,
            options,
            client,
            handler,
            self.head_order_id(),
        ));
        self.hold();
        self.waiters.write().push(consumer.clone());
        debug!(name = self.config.name, consumer = id, options = ?consumer.options, "attached consumer");
        Ok(consumer)
    }

    /// Detach a consumer. Its unacknowledged messages stay in flight until acknowledged or
    /// relinquished.
    ///
    /// Returns [Completion::Pending] if a delivery is in progress; the consumer is removed (and
    /// its handler told it is disabled) when the delivery finishes.
    pub fn detach(&self, consumer: &Arc<Consumer>) -> Result<Completion, Error> {
        match consumer.disconnect() {
            Ok(false) => {
                self.remove_waiter(consumer);
                Ok(Completion::Done)
            }
            Ok(true) => Ok(Completion::Pending),
            Err(_) => Err(Error::WaiterInvalid),
        }
    }

    pub(super) fn remove_waiter(&self, consumer: &Arc<Consumer>) {
        let removed = {
            let mut waiters = self.waiters.write();
            let before = waiters.len();
            waiters.retain(|waiter| !Arc::ptr_eq(waiter, consumer));
            before != waiters.len()
        };
        if removed {
            debug!(name = self.config.name, consumer = consumer.id(), "detached consumer");
            self.unhold();
        }
    }

    /// Enable a consumer and deliver any available messages to it.
    pub fn enable(self: &Arc<Self>, consumer: &Arc<Consumer>) -> Result<Completion, Error> {
        match consumer.enable() {
            Ok(false) => {
                consumer.last_checked.store(u64::MAX, Ordering::Release);
                Ok(self.check_waiters())
            }
            // The delivering thread looks again before unlocking
            Ok(true) => Ok(Completion::Done),
            Err(Status::Disconnected) => Err(Error::WaiterInvalid),
            Err(_) => Err(Error::WaiterEnabled),
        }
    }

    /// Disable a consumer.
    ///
    /// Returns [Completion::Pending] if a delivery is in progress; the handler is told once the
    /// consumer is disabled.
    pub fn disable(&self, consumer: &Arc<Consumer>) -> Result<Completion, Error> {
        match consumer.disable() {
            Ok(false) => Ok(Completion::Done),
            Ok(true) => Ok(Completion::Pending),
            Err(Status::Disconnected) => Err(Error::WaiterInvalid),
            Err(_) => Err(Error::WaiterDisabled),
        }
    }

    /// Snapshot the attached consumers starting at a rotating offset.
    pub(super) fn rotation(&self) -> Vec<Arc<Consumer>> {
        let mut waiters = self.waiters.read().clone();
        if waiters.len() > 1 {
            let start = self.rotation.fetch_add(1, Ordering::AcqRel) % waiters.len();
            waiters.rotate_left(start);
        }
        waiters
    }

    /// Record that the head page moved, updating the store's watermark when enough references
    /// were freed.
    pub(super) fn advance_watermark(&self, head: &Page) {
        let freed = self.freed_since_watermark.load(Ordering::Acquire);
        if freed < self.config.cleanup.watermark_refs {
            return;
        }
        self.freed_since_watermark.fetch_sub(freed, Ordering::AcqRel);
        self.context
            .store
            .set_min_active_order_id(self.owner, head.base());
        debug!(name = self.config.name, order_id = head.base(), "advanced watermark");
    }
}
