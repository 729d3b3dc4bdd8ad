use criterion::{black_box, criterion_group, criterion_main, Criterion};
use peermap_sync::frame::{decode_all, Frame, FrameDecoder};
use peermap_sync::identity::PeerId;
use peermap_sync::position::Position;
use peermap_sync::protocol::LocationUpdateMessage;
use peermap_sync::registry::PeerRegistry;

fn sample_body() -> String {
    let peer = PeerId::new("ios_42").unwrap();
    let position = Position::new(-12.05, -77.04, 1_700_000_000_000).unwrap();
    LocationUpdateMessage::from_position(&peer, &position, true)
        .encode()
        .unwrap()
}

fn bench_message_encode(c: &mut Criterion) {
    let peer = PeerId::new("ios_42").unwrap();
    let position = Position::new(-12.05, -77.04, 1_700_000_000_000).unwrap();

    c.bench_function("location_update_encode", |b| {
        b.iter(|| {
            let msg = LocationUpdateMessage::from_position(black_box(&peer), black_box(&position), true);
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let body = sample_body();

    c.bench_function("location_update_decode", |b| {
        b.iter(|| {
            black_box(LocationUpdateMessage::decode(black_box(&body)).unwrap());
        })
    });
}

fn bench_frame_encode(c: &mut Criterion) {
    let body = sample_body();

    c.bench_function("send_frame_encode", |b| {
        b.iter(|| {
            let frame = Frame::send_json("/app/update-location", black_box(body.clone()));
            black_box(frame.encode());
        })
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let wire = Frame::message("/topic/locations", "sub-0", "m-1", &sample_body()).encode();

    c.bench_function("message_frame_decode", |b| {
        b.iter(|| {
            black_box(decode_all(black_box(wire.as_bytes())).unwrap());
        })
    });

    // 100 frames arriving in one WebSocket message
    let batch = wire.repeat(100);
    c.bench_function("message_frame_decode_batch_100", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            decoder.push(black_box(batch.as_bytes()));
            let mut count = 0;
            while let Ok(Some(_)) = decoder.next_incoming() {
                count += 1;
            }
            black_box(count);
        })
    });
}

fn bench_registry_upsert(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let registry = PeerRegistry::new();
    let peers: Vec<PeerId> = (0..100)
        .map(|i| PeerId::new(format!("peer_{i}")).unwrap())
        .collect();
    let position = Position::new(-12.05, -77.04, 0).unwrap();

    c.bench_function("registry_upsert_100_peers", |b| {
        b.iter(|| {
            runtime.block_on(async {
                for peer in &peers {
                    registry.upsert(peer.clone(), position).await;
                }
            })
        })
    });

    c.bench_function("registry_snapshot_100_peers", |b| {
        b.iter(|| black_box(runtime.block_on(registry.snapshot())))
    });
}

criterion_group!(
    benches,
    bench_message_encode,
    bench_message_decode,
    bench_frame_encode,
    bench_frame_decode,
    bench_registry_upsert,
);
criterion_main!(benches);
