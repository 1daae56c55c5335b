//! Input codec and history benchmarks
//!
//! Run with: cargo bench --bench codec

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use netcore::input::packet::{decode_input_burst, encode_input_burst};
use netcore::input::{
    ActionTable, AnalogPrecision, FrameActions, InputSnapshot, NetworkInputComponent,
};
use netcore::util::quat::Quat;
use netcore::util::vec2::Vec2;
use rand::Rng;

const DIGITAL: [&str; 12] = [
    "UP", "DOWN", "LEFT", "RIGHT", "JUMP", "CROUCH", "FIRE", "AIM", "RELOAD", "USE", "SPRINT", "MELEE",
];

fn registry() -> ActionTable {
    let mut table = ActionTable::new();
    for name in DIGITAL {
        table.add_digital(name).unwrap();
    }
    table.add_analog("MOVE", AnalogPrecision::Uint16).unwrap();
    table.add_analog("LOOK", AnalogPrecision::Uint8).unwrap();
    table
}

/// Random frame with `active` digital actions held
fn random_actions(active: usize) -> FrameActions {
    let mut rng = rand::thread_rng();
    let mut actions = FrameActions::new()
        .with_analog("MOVE", Vec2::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
        .with_analog("LOOK", Vec2::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
        .with_camera(Quat::from_axis_angle([0.0, 1.0, 0.0], rng.gen_range(-3.0..3.0)));
    for name in DIGITAL.iter().take(active) {
        actions = actions.with_digital(name);
    }
    actions
}

fn bench_pack(c: &mut Criterion) {
    let table = registry();
    let mut group = c.benchmark_group("pack");
    group.sample_size(100);

    for active in [1usize, 4, 9, 12] {
        let actions = random_actions(active);
        group.bench_with_input(BenchmarkId::new("snapshot", active), &actions, |b, actions| {
            b.iter(|| InputSnapshot::pack(&table, black_box(actions), None));
        });
        let snapshot = InputSnapshot::pack(&table, &actions, None);
        group.bench_with_input(BenchmarkId::new("decode", active), &snapshot, |b, snapshot| {
            b.iter(|| black_box(snapshot).decode(&table));
        });
    }

    group.finish();
}

fn bench_burst(c: &mut Criterion) {
    let table = registry();
    let mut group = c.benchmark_group("burst");
    group.sample_size(50);

    for len in [8usize, 32, 128] {
        let snapshots: Vec<InputSnapshot> = (0..len)
            .map(|_| InputSnapshot::pack(&table, &random_actions(3), None))
            .collect();
        let wire = encode_input_burst(len as u32, &snapshots);

        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("encode", len), &snapshots, |b, snapshots| {
            b.iter(|| encode_input_burst(black_box(len as u32), snapshots));
        });
        group.bench_with_input(BenchmarkId::new("decode", len), &wire, |b, wire| {
            b.iter(|| decode_input_burst(black_box(wire)));
        });
    }

    group.finish();
}

fn bench_history(c: &mut Criterion) {
    let table = registry();
    let snapshot = InputSnapshot::pack(&table, &random_actions(2), None);
    let mut group = c.benchmark_group("history");
    group.sample_size(100);
    group.throughput(Throughput::Elements(1000));

    group.bench_function("push_1000", |b| {
        b.iter(|| {
            let mut component = NetworkInputComponent::default();
            for frame in 0..1000u32 {
                component.push_input(frame, snapshot);
            }
            black_box(component.history.len())
        });
    });

    group.bench_function("push_with_gaps_1000", |b| {
        b.iter(|| {
            let mut component = NetworkInputComponent::default();
            for frame in (0..3000u32).step_by(3) {
                component.push_input(frame, snapshot);
            }
            black_box(component.history.len())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_pack, bench_burst, bench_history);
criterion_main!(benches);
