use std::hint::black_box;

use collabx_relay::registry::{ConnectionId, Frame, RoomHandle, RoomRegistry};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

/// Join `peers` connections to one room, returning the first id and all handles.
fn populated_room(registry: &RoomRegistry, peers: usize) -> (ConnectionId, Vec<RoomHandle>) {
    let ids: Vec<ConnectionId> = (0..peers).map(|_| ConnectionId::new()).collect();
    let handles = ids.iter().map(|id| registry.join("bench", *id)).collect();
    (ids[0], handles)
}

fn drain(handles: &mut [RoomHandle]) {
    for handle in handles {
        while handle.try_recv().is_some() {}
    }
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("broadcast_fan_out_64B");
    let payload = Frame::from(vec![0u8; 64]);

    for peers in [2usize, 10, 100] {
        let registry = RoomRegistry::new(1024);
        let (sender, mut handles) = populated_room(&registry, peers);

        group.bench_with_input(BenchmarkId::from_parameter(peers), &peers, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(registry.broadcast("bench", sender, payload.clone()).await);
                });
                drain(&mut handles);
            })
        });
    }
    group.finish();
}

fn bench_broadcast_1k_to_100(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = RoomRegistry::new(2048);
    let (sender, mut handles) = populated_room(&registry, 100);
    let payload = Frame::from(vec![0u8; 64]);

    c.bench_function("broadcast_1k_msgs_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                for _ in 0..1000 {
                    black_box(registry.broadcast("bench", sender, payload.clone()).await);
                }
            });
            drain(&mut handles);
        })
    });
}

fn bench_join_leave(c: &mut Criterion) {
    let registry = RoomRegistry::new(16);

    c.bench_function("join_leave_cycle", |b| {
        b.iter(|| {
            let id = ConnectionId::new();
            let handle = registry.join(black_box("doc"), id);
            black_box(registry.leave("doc", id));
            drop(handle);
        })
    });
}

fn bench_snapshot_counts(c: &mut Criterion) {
    let registry = RoomRegistry::new(16);
    let _handles: Vec<RoomHandle> = (0..1000)
        .map(|i| registry.join(&format!("doc{}", i % 50), ConnectionId::new()))
        .collect();

    c.bench_function("snapshot_counts_50_rooms", |b| {
        b.iter(|| black_box(registry.snapshot_counts()))
    });
}

criterion_group!(
    benches,
    bench_broadcast_fan_out,
    bench_broadcast_1k_to_100,
    bench_join_leave,
    bench_snapshot_counts,
);
criterion_main!(benches);
