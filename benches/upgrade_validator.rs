#![allow(clippy::all)]
//! Benchmarks for the handshake hot path.
//!
//! Tests: subprotocol parsing, key validation, accept key computation,
//! request head parsing.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use r0n_upgrade::modules::websocket_upgrade::{
    compute_accept_key, parse_subprotocols, validate_key, UpgradeRequest,
};
use std::hint::black_box;

const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

fn protocol_header(count: usize) -> String {
    (0..count)
        .map(|i| format!("proto-{i}.v{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Header validation
// ---------------------------------------------------------------------------

fn bench_subprotocols(c: &mut Criterion) {
    let mut group = c.benchmark_group("upgrade/subprotocols");

    for count in [1, 8, 64] {
        let header = protocol_header(count);
        group.bench_with_input(BenchmarkId::new("parse", count), &header, |b, header| {
            b.iter(|| black_box(parse_subprotocols(black_box(header)).unwrap()));
        });
    }

    group.bench_function("parse_invalid", |b| {
        b.iter(|| black_box(parse_subprotocols(black_box("chat,,superchat")).is_err()));
    });

    group.finish();
}

fn bench_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("upgrade/key");

    group.bench_function("validate", |b| {
        b.iter(|| black_box(validate_key(Some(black_box(KEY)))));
    });

    group.bench_function("validate_invalid", |b| {
        b.iter(|| black_box(validate_key(Some(black_box("not-a-key")))));
    });

    group.bench_function("accept", |b| {
        b.iter(|| black_box(compute_accept_key(black_box(KEY))));
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

fn bench_request_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("upgrade/request");

    let head = format!(
        "GET /chat?room=lobby HTTP/1.1\r\n\
         Host: server.example.com\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {KEY}\r\n\
         Origin: http://example.com\r\n\
         Sec-WebSocket-Protocol: chat, superchat\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );

    group.bench_function("parse", |b| {
        b.iter(|| black_box(UpgradeRequest::parse(black_box(head.as_bytes())).unwrap()));
    });

    group.bench_function("parse_and_check", |b| {
        b.iter(|| {
            let request = UpgradeRequest::parse(black_box(head.as_bytes())).unwrap();
            black_box(request.is_upgrade() && validate_key(request.key()))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_subprotocols, bench_key, bench_request_parse);
criterion_main!(benches);
