use commonware_broker::{
    message::{Header, Message},
    mocks,
    queue::{Config, Context, Kind, Queue},
    store::OwnerHandle,
};
use criterion::criterion_main;
use prometheus_client::registry::Registry;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::sync::Arc;

mod deliver;
mod put;

criterion_main!(put::benches, deliver::benches);

/// Create a queue backed by in-memory collaborators.
fn queue(page_capacity: usize) -> Arc<Queue> {
    let context = Context {
        store: Arc::new(mocks::Store::default()),
        locks: Arc::new(mocks::Locks::default()),
        clock: Arc::new(mocks::Clock::default()),
    };
    let mut config = Config::new("bench", Kind::Point);
    config.initial_page_capacity = page_capacity;
    config.max_page_capacity = page_capacity;
    let mut registry = Registry::default();
    Queue::init(config, context, OwnerHandle(1), &mut registry).unwrap()
}

/// Generate `count` random messages of `size` bytes.
fn messages(count: usize, size: usize, persistent: bool) -> Vec<Message> {
    let mut rng = StdRng::seed_from_u64(0);
    (0..count)
        .map(|_| {
            let mut payload = vec![0; size];
            rng.fill_bytes(&mut payload);
            let header = Header {
                persistent,
                ..Default::default()
            };
            Message::new(header, payload)
        })
        .collect()
}
