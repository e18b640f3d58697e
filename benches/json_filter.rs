//! Throughput of the JSON filter's byte-at-a-time hot loop. §10.4: the
//! source profiled this table-driven dispatch against a naive match
//! expression and kept the table because branch prediction on a 30x31
//! grid beat the equivalent match in practice, which is the kind of
//! claim worth re-measuring here.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use eventdance::json_filter::JsonFilter;

fn repeated_objects(count: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    for i in 0..count {
        buf.extend_from_slice(format!(r#"{{"id":{i},"tag":"evt","payload":[1,2,3,4,5],"ok":true}}"#).as_bytes());
    }
    buf
}

fn bench_feed_whole_buffer(c: &mut Criterion) {
    let input = repeated_objects(2000);
    c.bench_function("json_filter/feed_whole_buffer", |b| {
        b.iter_batched(
            JsonFilter::new,
            |mut filter| {
                black_box(filter.feed(black_box(&input)).unwrap());
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_feed_byte_at_a_time(c: &mut Criterion) {
    let input = repeated_objects(50);
    c.bench_function("json_filter/feed_byte_at_a_time", |b| {
        b.iter_batched(
            JsonFilter::new,
            |mut filter| {
                for byte in &input {
                    black_box(filter.feed(black_box(std::slice::from_ref(byte))).unwrap());
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_feed_whole_buffer, bench_feed_byte_at_a_time);
criterion_main!(benches);
