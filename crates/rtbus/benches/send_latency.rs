// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Send/Read Latency Benchmark
//!
//! Measures the hot paths in isolation:
//! - Sender::send() with different payload sizes
//! - Reader::read() of the latest message
//! - Reader::latest_index()
//!
//! All numbers are intra-process; cross-process costs are identical because
//! the data path is the same shared-memory protocol either way.

#![allow(clippy::uninlined_format_args)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rtbus::sender::{SendMetadata, Sender};
use rtbus::{Channel, QueueConfig, ReadResult, Reader};
use std::hint::black_box as bb;
use std::time::Duration;

fn bench_channel(tag: &str, message_data_size: usize) -> (Channel, String) {
    let name = format!(
        "/rtbus_bench_{tag}_{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    );
    let config = QueueConfig {
        num_watchers: 1,
        num_senders: 2,
        num_pinners: 1,
        queue_size: 1024,
        message_data_size,
    };
    let channel = Channel::open_or_create(&name, config).expect("channel creation");
    (channel, name)
}

/// Benchmark send latency with different payload sizes
fn bench_send_payload_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("send_latency_by_size");

    for size in [64usize, 256, 1024, 4096] {
        let (channel, name) = bench_channel("send", size);
        // Duration::ZERO disables the rate limit so the bench can hammer.
        let mut sender = Sender::attach(&channel, Duration::ZERO).expect("sender attach");

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let metadata = SendMetadata::local();
            b.iter(|| {
                sender.data()[..size].fill(0xab);
                sender.send(bb(size), bb(&metadata)).expect("send");
            });
        });

        drop(sender);
        drop(channel);
        Channel::unlink(&name).ok();
    }

    group.finish();
}

/// Benchmark the reader side against a quiescent channel
fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_latency");

    let (channel, name) = bench_channel("read", 1024);
    let mut sender = Sender::attach(&channel, Duration::ZERO).expect("sender attach");
    for _ in 0..100 {
        sender
            .send_bytes(&[0xab; 512], &SendMetadata::local())
            .expect("send");
    }
    let reader = Reader::new(&channel);
    let latest = reader.latest_index().expect("nothing published");
    let mut buf = vec![0u8; channel.message_data_size()];

    group.bench_function("read_with_copy", |b| {
        b.iter(|| {
            match reader.read(bb(latest), Some(&mut buf), None) {
                ReadResult::Good(context) => bb(context.size),
                other => panic!("unexpected read result {other:?}"),
            };
        });
    });

    group.bench_function("read_metadata_only", |b| {
        b.iter(|| {
            match reader.read(bb(latest), None, None) {
                ReadResult::Good(context) => bb(context.queue_index),
                other => panic!("unexpected read result {other:?}"),
            };
        });
    });

    group.bench_function("latest_index", |b| {
        b.iter(|| bb(reader.latest_index()));
    });

    drop(reader);
    drop(sender);
    drop(channel);
    Channel::unlink(&name).ok();

    group.finish();
}

criterion_group!(benches, bench_send_payload_sizes, bench_read);
criterion_main!(benches);
