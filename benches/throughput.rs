//! Throughput Benchmark for cmdwire
//!
//! This benchmark measures command normalization, event building and OP_MSG
//! framing, the per-dispatch work done on every monitored command.

use bson::doc;
use cmdwire::connection::ServerAddress;
use cmdwire::events::{build_started, build_succeeded};
use cmdwire::protocol::{
    extract_command, extract_reply, Command, CursorBatch, Frame, FrameParser, LegacyFind, Reply,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::time::Instant;

fn legacy_find() -> Command {
    let mut find = LegacyFind::new(
        "shop.orders",
        doc! {
            "$query": { "status": "open", "total": { "$gt": 100 } },
            "$orderby": { "createdAt": -1 },
            "$hint": "status_1",
            "$maxTimeMS": 500,
        },
    );
    find.options.number_to_skip = Some(20);
    find.options.number_to_return = Some(100);
    Command::LegacyFind(find)
}

/// Benchmark command translation
fn bench_translate(c: &mut Criterion) {
    let mut group = c.benchmark_group("translate");
    group.throughput(Throughput::Elements(1));

    let find = legacy_find();
    group.bench_function("legacy_find", |b| {
        b.iter(|| black_box(extract_command(black_box(&find))));
    });

    let get_more = Command::get_more("shop.orders", 8_123_456, 100);
    group.bench_function("get_more", |b| {
        b.iter(|| black_box(extract_command(black_box(&get_more))));
    });

    let modern = Command::modern("shop", doc! { "find": "orders", "filter": { "status": "open" } });
    group.bench_function("modern", |b| {
        b.iter(|| black_box(extract_command(black_box(&modern))));
    });

    let batch = Reply::Cursor(CursorBatch {
        cursor_id: 8_123_456,
        documents: (0..100).map(|i| doc! { "_id": i, "total": i * 10 }).collect(),
    });
    group.bench_function("get_more_reply_100", |b| {
        b.iter(|| black_box(extract_reply(black_box(&get_more), black_box(&batch))));
    });

    group.finish();
}

/// Benchmark event construction
fn bench_events(c: &mut Criterion) {
    let mut group = c.benchmark_group("events");
    group.throughput(Throughput::Elements(1));

    let address = ServerAddress::new("db.example.com", 27017);
    let find = legacy_find();
    let reply = Reply::Cursor(CursorBatch {
        cursor_id: 0,
        documents: vec![doc! { "_id": 1 }],
    });

    group.bench_function("started", |b| {
        let mut request_id = 0;
        b.iter(|| {
            request_id += 1;
            black_box(build_started(&address, request_id, &find))
        });
    });

    group.bench_function("succeeded", |b| {
        let started_at = Instant::now();
        b.iter(|| black_box(build_succeeded(&address, 1, &find, &reply, started_at)));
    });

    let sensitive = Command::modern("admin", doc! { "saslStart": 1, "payload": "secret" });
    group.bench_function("started_redacted", |b| {
        b.iter(|| black_box(build_started(&address, 1, &sensitive)));
    });

    group.finish();
}

/// Benchmark OP_MSG framing
fn bench_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("frames");
    group.throughput(Throughput::Elements(1));

    let frame = Frame::request(
        1,
        doc! {
            "insert": "orders",
            "documents": (0..50).map(|i| doc! { "_id": i, "sku": format!("sku-{}", i) }).collect::<Vec<_>>(),
            "$db": "shop",
        },
    );
    let encoded = frame.encode().unwrap();

    group.bench_function("encode", |b| {
        b.iter(|| black_box(frame.encode().unwrap()));
    });

    group.bench_function("parse", |b| {
        let mut parser = FrameParser::new();
        b.iter(|| black_box(parser.parse(black_box(&encoded)).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_translate, bench_events, bench_frames);
criterion_main!(benches);
