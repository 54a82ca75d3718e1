//! Framing cost of flushed windows and inbound publications.

use bytes::BytesMut;
use coalesce_protocol::{codec, Frame};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const WINDOW_SIZES: [usize; 3] = [1024, 16 * 1024, 64 * 1024];

/// Owned `Frame::Batch` (payload copied into the frame) against the
/// borrowed path the reactor uses.
fn bench_batch_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_framing");

    for size in WINDOW_SIZES {
        let window = vec![b'x'; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("owned", size), &window, |b, window| {
            b.iter(|| codec::encode(&Frame::batch("bench:room", black_box(window.clone()))))
        });
        group.bench_with_input(BenchmarkId::new("borrowed", size), &window, |b, window| {
            b.iter(|| codec::encode_batch("bench:room", black_box(window.as_slice())))
        });
    }

    group.finish();
}

/// Many small publications arriving in one read, as a busy client sends them.
fn bench_publish_stream(c: &mut Criterion) {
    let mut wire = BytesMut::new();
    for n in 0..256u32 {
        let frame = Frame::publish("bench:room", n.to_be_bytes().repeat(16));
        codec::encode_into(&frame, &mut wire).unwrap();
    }
    let wire = wire.freeze();

    let mut group = c.benchmark_group("publish_stream");
    group.throughput(Throughput::Elements(256));
    group.bench_function("decode_from_256", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&wire[..]);
            let mut decoded = 0;
            while let Ok(Some(frame)) = codec::decode_from(&mut buf) {
                black_box(frame);
                decoded += 1;
            }
            decoded
        })
    });
    group.finish();
}

criterion_group!(benches, bench_batch_framing, bench_publish_stream);
criterion_main!(benches);
