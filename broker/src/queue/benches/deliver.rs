use commonware_broker::{
    mocks,
    queue::{AckKind, Options, PutOptions},
};
use criterion::{criterion_group, BatchSize, Criterion};
use std::sync::Arc;

fn bench_deliver(c: &mut Criterion) {
    for consumers in [1, 4] {
        for messages in [1_000, 10_000] {
            c.bench_function(
                &format!(
                    "{}/consumers={} messages={}",
                    module_path!(),
                    consumers,
                    messages
                ),
                |b| {
                    b.iter_batched(
                        || {
                            let queue = super::queue(256);
                            for message in super::messages(messages, 128, false) {
                                queue.put(message, None, PutOptions::default()).unwrap();
                            }
                            queue
                        },
                        |queue| {
                            // Every consumer is attached before any is enabled
                            let attached: Vec<_> = (0..consumers)
                                .map(|id| {
                                    let client =
                                        Arc::new(mocks::Client::new(id, false, messages));
                                    let handler = Arc::new(mocks::Handler::default());
                                    let consumer = queue
                                        .attach(client, handler.clone(), Options::default())
                                        .unwrap();
                                    (consumer, handler)
                                })
                                .collect();
                            for (consumer, _) in &attached {
                                queue.enable(consumer).unwrap();
                            }
                            for (_, handler) in &attached {
                                for delivery in handler.take() {
                                    let handle = delivery.handle.unwrap();
                                    queue
                                        .acknowledge(&handle, AckKind::Consumed, None, None)
                                        .unwrap();
                                }
                            }
                            assert_eq!(queue.stats().buffered, 0);
                        },
                        BatchSize::LargeInput,
                    );
                },
            );
        }
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_deliver
}
