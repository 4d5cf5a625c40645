use std::collections::BTreeMap;
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use whiteboard_sync::envelope::{open, seal};
use whiteboard_sync::protocol::RelayMessage;
use whiteboard_sync::room::{RoomId, RoomSecret};
use whiteboard_sync::scene::{BinaryFile, SceneSnapshot, SharedAppState};

fn scene(element_count: usize) -> SceneSnapshot {
    let elements = (0..element_count)
        .map(|i| {
            json!({
                "id": format!("el{i}"),
                "type": "rectangle",
                "x": i as f64 * 12.5,
                "y": i as f64 * 7.25,
                "width": 100,
                "height": 60,
                "strokeColor": "#1e1e1e",
                "version": i,
            })
        })
        .collect();
    SceneSnapshot {
        elements,
        app_state: SharedAppState {
            view_background_color: Some("#ffffff".to_string()),
        },
        files: BTreeMap::new(),
        timestamp: 1_700_000_000_000,
    }
}

fn scene_with_image(bytes: usize) -> SceneSnapshot {
    let mut snapshot = scene(10);
    snapshot.files.insert(
        "img".to_string(),
        BinaryFile {
            id: "img".to_string(),
            mime_type: "image/png".to_string(),
            data_url: format!("data:image/png;base64,{}", "A".repeat(bytes)),
            created: 1_700_000_000_000,
            extra: Default::default(),
        },
    );
    snapshot
}

fn bench_seal_small(c: &mut Criterion) {
    let secret = RoomSecret::generate().unwrap();
    let snapshot = scene(10);

    c.bench_function("seal_10_elements", |b| {
        b.iter(|| black_box(seal(&secret, black_box(&snapshot)).unwrap()))
    });
}

fn bench_seal_large(c: &mut Criterion) {
    let secret = RoomSecret::generate().unwrap();
    let snapshot = scene(1_000);

    c.bench_function("seal_1000_elements", |b| {
        b.iter(|| black_box(seal(&secret, black_box(&snapshot)).unwrap()))
    });
}

fn bench_open_small(c: &mut Criterion) {
    let secret = RoomSecret::generate().unwrap();
    let envelope = seal(&secret, &scene(10)).unwrap();

    c.bench_function("open_10_elements", |b| {
        b.iter(|| black_box(open(&secret, black_box(&envelope)).unwrap()))
    });
}

fn bench_seal_open_with_image(c: &mut Criterion) {
    let secret = RoomSecret::generate().unwrap();
    let snapshot = scene_with_image(512 * 1024);

    c.bench_function("seal_open_512KiB_image", |b| {
        b.iter(|| {
            let envelope = seal(&secret, black_box(&snapshot)).unwrap();
            black_box(open(&secret, &envelope).unwrap())
        })
    });
}

fn bench_frame_encode(c: &mut Criterion) {
    let secret = RoomSecret::generate().unwrap();
    let room_id = RoomId::generate().unwrap();
    let envelope = seal(&secret, &scene(100)).unwrap();

    c.bench_function("server_broadcast_encode_100_elements", |b| {
        b.iter(|| {
            let frame = RelayMessage::server_broadcast(room_id.clone(), black_box(&envelope));
            black_box(frame.encode().unwrap())
        })
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let secret = RoomSecret::generate().unwrap();
    let envelope = seal(&secret, &scene(100)).unwrap();
    let text = RelayMessage::client_broadcast(&envelope).encode().unwrap();

    c.bench_function("client_broadcast_decode_100_elements", |b| {
        b.iter(|| {
            let frame = RelayMessage::decode(black_box(&text)).unwrap();
            black_box(frame.envelope())
        })
    });
}

criterion_group!(
    benches,
    bench_seal_small,
    bench_seal_large,
    bench_open_small,
    bench_seal_open_with_image,
    bench_frame_encode,
    bench_frame_decode,
);
criterion_main!(benches);
