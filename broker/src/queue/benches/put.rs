use commonware_broker::queue::PutOptions;
use criterion::{criterion_group, BatchSize, Criterion};

fn bench_put(c: &mut Criterion) {
    for page_capacity in [16, 256] {
        for persistent in [false, true] {
            for messages in [1_000, 10_000] {
                c.bench_function(
                    &format!(
                        "{}/page_capacity={} persistent={} messages={}",
                        module_path!(),
                        page_capacity,
                        persistent,
                        messages
                    ),
                    |b| {
                        b.iter_batched(
                            || {
                                (
                                    super::queue(page_capacity),
                                    super::messages(messages, 128, persistent),
                                )
                            },
                            |(queue, messages)| {
                                for message in messages {
                                    queue.put(message, None, PutOptions::default()).unwrap();
                                }
                            },
                            BatchSize::LargeInput,
                        );
                    },
                );
            }
        }
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_put
}
