//! Codec throughput benchmarks
//!
//! The codec sits on the hot path of every relayed event; these benches
//! keep encode/decode costs visible. Run with `cargo bench --bench codec`.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tokio_util::codec::{Decoder, Encoder};

use waylink::protocol::{codec, ControlEvent, Envelope, Event, EventCodec, ScrollAxis};

fn sample_stream() -> Vec<Envelope> {
    let mut events = Vec::with_capacity(256);
    for i in 0..100u64 {
        events.push(Event::MouseMove {
            dx: (i % 13) as i32 - 6,
            dy: (i % 7) as i32 - 3,
            timestamp_us: i,
        });
    }
    for i in 0..60u64 {
        let code = 16 + (i % 30) as u16;
        events.push(Event::Key {
            code,
            pressed: i % 2 == 0,
            timestamp_us: 100 + i,
        });
    }
    for i in 0..20u64 {
        events.push(Event::MouseScroll {
            axis: ScrollAxis::Vertical,
            value: -15.0,
            steps: Some(-1),
            timestamp_us: 160 + i,
        });
    }
    events.push(Event::Control(ControlEvent::Ping { seq: 1 }));
    events.into_iter().map(Envelope::from_server).collect()
}

fn bench_encode(c: &mut Criterion) {
    let stream = sample_stream();
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(stream.len() as u64));
    group.bench_function("envelope_stream", |b| {
        b.iter(|| {
            for envelope in &stream {
                black_box(codec::encode_envelope(black_box(envelope)));
            }
        })
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let stream = sample_stream();
    let payloads: Vec<_> = stream.iter().map(codec::encode_envelope).collect();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(payloads.len() as u64));
    group.bench_function("envelope_stream", |b| {
        b.iter(|| {
            for payload in &payloads {
                black_box(codec::decode_envelope(black_box(payload)).unwrap());
            }
        })
    });
    group.finish();
}

fn bench_framed_round_trip(c: &mut Criterion) {
    let stream = sample_stream();

    let mut group = c.benchmark_group("framed");
    group.throughput(Throughput::Elements(stream.len() as u64));
    group.bench_function("encode_decode_stream", |b| {
        b.iter(|| {
            let mut codec = EventCodec::default();
            let mut wire = BytesMut::with_capacity(16 * 1024);
            for envelope in &stream {
                codec.encode(envelope.clone(), &mut wire).unwrap();
            }
            let mut decoded = 0usize;
            while let Some(envelope) = codec.decode(&mut wire).unwrap() {
                black_box(envelope);
                decoded += 1;
            }
            assert_eq!(decoded, stream.len());
        })
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_framed_round_trip);
criterion_main!(benches);
