// ABOUTME: Benchmark suite for the connection core: frame parsing, codec encode/decode, and
// ABOUTME: the send/ack queue throughput under the patterns an IPC peer actually exercises

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use criterion::{Criterion, black_box, criterion_group, criterion_main};

use ipc_core::{AckTracker, EndpointMagic, MessageId, RawMessage, SendItem, SendQueue, prepare_send_buffer, try_parse_messages};

fn small_message() -> RawMessage {
    RawMessage {
        endpoint_magic: EndpointMagic(1),
        message_id: MessageId(42),
        payload: Bytes::from_static(b"Hello World"),
        fds: Vec::new(),
    }
}

fn oversize_message() -> RawMessage {
    RawMessage {
        endpoint_magic: EndpointMagic(1),
        message_id: MessageId(42),
        payload: Bytes::from(vec![0xABu8; 64 * 1024]),
        fds: Vec::new(),
    }
}

fn framed(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("small_message", |b| {
        b.iter(|| prepare_send_buffer(black_box(small_message()), 32 * 1024))
    });

    group.bench_function("oversize_message_wrapped", |b| {
        b.iter(|| prepare_send_buffer(black_box(oversize_message()), 32 * 1024))
    });

    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.measurement_time(Duration::from_secs(10));

    let small_wire = framed(&small_message().encode_body());
    group.bench_function("single_small_message", |b| {
        b.iter(|| {
            let mut fds = VecDeque::new();
            try_parse_messages(black_box(&small_wire), &mut fds, EndpointMagic(1))
        })
    });

    let mut batched_wire = Vec::new();
    for id in 0..16u32 {
        let message = RawMessage {
            endpoint_magic: EndpointMagic(1),
            message_id: MessageId(id),
            payload: Bytes::from_static(b"Hello World"),
            fds: Vec::new(),
        };
        batched_wire.extend_from_slice(&framed(&message.encode_body()));
    }
    group.bench_function("sixteen_batched_messages", |b| {
        b.iter(|| {
            let mut fds = VecDeque::new();
            try_parse_messages(black_box(&batched_wire), &mut fds, EndpointMagic(1))
        })
    });

    group.finish();
}

fn bench_queues(c: &mut Criterion) {
    let mut group = c.benchmark_group("queues");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("send_queue_push_pop", |b| {
        let queue = SendQueue::new();
        b.iter(|| {
            queue.push(SendItem { buffer: prepare_send_buffer(small_message(), 32 * 1024), needs_ack: false });
            black_box(queue.pop_blocking())
        })
    });

    group.bench_function("ack_tracker_append_pop", |b| {
        let tracker = AckTracker::new();
        b.iter(|| {
            tracker.append(Bytes::from_static(b"frame"));
            tracker.pop_n(black_box(1));
        })
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_parse, bench_queues);
criterion_main!(benches);
