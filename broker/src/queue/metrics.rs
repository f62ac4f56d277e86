//! Metrics for [super::Queue].

use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics for [super::Queue].
#[derive(Default)]
pub struct Metrics {
    /// Messages currently buffered.
    pub buffered: Gauge,
    /// Bytes currently buffered.
    pub buffered_bytes: Gauge,
    /// Most messages ever buffered at once.
    pub high_water_mark: Gauge,
    /// Messages in flight to consumers.
    pub inflight: Gauge,
    /// Pages in the chain.
    pub pages: Gauge,
    /// Messages enqueued.
    pub enqueued: Counter,
    /// Messages consumed.
    pub consumed: Counter,
    /// Messages expired.
    pub expired: Counter,
    /// Messages discarded to reclaim space.
    pub discarded: Counter,
    /// Puts rejected because the queue was full.
    pub rejected: Counter,
    /// Pages retired from the head of the chain.
    pub pages_freed: Counter,
    /// Pages spliced out of the middle of the chain.
    pub pages_spliced: Counter,
}

impl Metrics {
    /// Create and register metrics with the given registry.
    ///
    /// Metric names will be labeled with the queue's name.
    pub fn init(registry: &mut Registry, name: &str) -> Self {
        let metrics = Self::default();
        let registry = registry.sub_registry_with_label(("queue".into(), name.to_string().into()));
        registry.register("buffered", "Messages currently buffered", metrics.buffered.clone());
        registry.register(
            "buffered_bytes",
            "Bytes currently buffered",
            metrics.buffered_bytes.clone(),
        );
        registry.register(
            "high_water_mark",
            "Most messages ever buffered at once",
            metrics.high_water_mark.clone(),
        );
        registry.register("inflight", "Messages in flight to consumers", metrics.inflight.clone());
        registry.register("pages", "Pages in the chain", metrics.pages.clone());
        registry.register("enqueued", "Messages enqueued", metrics.enqueued.clone());
        registry.register("consumed", "Messages consumed", metrics.consumed.clone());
        registry.register("expired", "Messages expired", metrics.expired.clone());
        registry.register(
            "discarded",
            "Messages discarded to reclaim space",
            metrics.discarded.clone(),
        );
        registry.register(
            "rejected",
            "Puts rejected because the queue was full",
            metrics.rejected.clone(),
        );
        registry.register(
            "pages_freed",
            "Pages retired from the head of the chain",
            metrics.pages_freed.clone(),
        );
        registry.register(
            "pages_spliced",
            "Pages spliced out of the middle of the chain",
            metrics.pages_spliced.clone(),
        );
        metrics
    }
}
