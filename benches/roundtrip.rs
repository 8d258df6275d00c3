// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 kvbridge contributors
//
// Micro-benchmarks for the wire codec and the channel round-trip.
//
// Run with:
//   cargo bench --bench roundtrip
//
// Groups:
//   codec    — header and entity encode/decode, no IPC involved
//   channel  — full request/response through a live channel against an
//              echo thread, at three payload sizes

use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use kvbridge::channel::MsgChannel;
use kvbridge::msg::{
    self, BatchReply, CursorRef, MsgHeader, Op, RangeArgs, Status, HEADER_SIZE, NO_RESPONSE_SLOT,
};
use kvbridge::shm_name;

const SIZES: &[(&str, usize)] = &[("small_64", 64), ("medium_1k", 1024), ("large_4k", 4096)];

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    group.bench_function("header_encode_decode", |b| {
        let header = MsgHeader {
            op: Op::Put,
            db_id: 1,
            rel_id: 16384,
            status: Status::Dummy,
            rps_id: 2,
            ety_size: 512,
        };
        let mut buf = [0u8; HEADER_SIZE];
        b.iter(|| {
            header.encode(&mut buf);
            black_box(MsgHeader::decode(&buf).unwrap())
        });
    });

    group.bench_function("put_encode_decode", |b| {
        let key = vec![7u8; 24];
        let value = vec![9u8; 256];
        b.iter(|| {
            let mut out = Vec::with_capacity(msg::put_entity_len(&key, &value));
            msg::encode_put(&mut out, &key, &value);
            black_box(msg::decode_put(&out).unwrap())
        });
    });

    group.bench_function("range_args_encode_decode", |b| {
        let args = RangeArgs {
            cursor: CursorRef {
                pid: 1234,
                cursor_id: 42,
            },
            start: b"key00000".to_vec(),
            limit: b"key99999".to_vec(),
            batch_capacity: 16384,
            attrs: vec![1, 2, 3, 4],
        };
        b.iter(|| {
            let mut out = Vec::with_capacity(args.encoded_len());
            args.encode(&mut out);
            black_box(RangeArgs::decode(&out).unwrap())
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Channel round-trip
// ---------------------------------------------------------------------------

fn bench_channel(c: &mut Criterion) {
    let name = shm_name::channel_name(&format!("bench{}", std::process::id()));
    MsgChannel::remove_storage(&name);
    let ch = Arc::new(MsgChannel::create(&name).expect("create channel"));

    let echo = {
        let ch = Arc::clone(&ch);
        thread::spawn(move || loop {
            let (header, body) = ch.worker_recv_request().expect("recv");
            if header.op == Op::Terminate {
                return;
            }
            if header.rps_id == NO_RESPONSE_SLOT {
                continue;
            }
            let mut entity = Vec::new();
            BatchReply {
                next: true,
                size: body.len() as u64,
            }
            .encode(&mut entity);
            let rsp = MsgHeader::response(&header, Status::Success, entity.len() as u64);
            ch.worker_send_response(header.rps_id as usize, &rsp, |buf| {
                buf.copy_from_slice(&entity)
            })
            .expect("respond");
        })
    };

    let mut group = c.benchmark_group("channel");
    for &(label, size) in SIZES {
        let payload = vec![0x5au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("round_trip", label), &payload, |b, p| {
            b.iter(|| {
                let mut header = MsgHeader::request(Op::Put, 1, 1, p.len() as u64);
                let slot = ch
                    .client_send(&mut header, |buf| buf.copy_from_slice(p), true)
                    .expect("send")
                    .expect("slot");
                let (rsp, body) = ch.client_recv(slot).expect("recv");
                ch.release_slot(slot).expect("release");
                black_box((rsp, body))
            });
        });
    }
    group.finish();

    let mut header = MsgHeader::request(Op::Terminate, 0, 0, 0);
    ch.client_send(&mut header, |_| {}, false).expect("terminate");
    echo.join().unwrap();
    ch.destroy();
}

criterion_group!(benches, bench_codec, bench_channel);
criterion_main!(benches);
