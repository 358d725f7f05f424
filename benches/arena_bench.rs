//! Criterion micro-benchmarks for host arena pushes, checkpoint rewinds and
//! device arena suballocation.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use floe::memory::{ArenaSettings, HostArena, ScratchPool, PAGE_SIZE};
use floe::renderer::core::{DeviceAllocator, DeviceArena, MemoryClass};
use floe::renderer::hal::{BufferUsages, HeadlessDevice};

const RESERVE: usize = 64 << 20;

fn bench_host_push(c: &mut Criterion) {
    let arena = HostArena::new(RESERVE, 64 * PAGE_SIZE);
    c.bench_function("host_arena_push_1k_u64x4", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                black_box(arena.push::<[u64; 4]>(1).unwrap());
            }
            arena.reset();
        });
    });
}

fn bench_checkpoint_rewind(c: &mut Criterion) {
    let arena = HostArena::new(RESERVE, 64 * PAGE_SIZE);
    arena.push::<u8>(4096).unwrap();
    c.bench_function("host_arena_temp_scope_16_pushes", |b| {
        b.iter(|| {
            let temp = arena.temp();
            for size in 1..=16usize {
                black_box(temp.push_bytes(size * 24, 16).unwrap());
            }
        });
    });
}

fn bench_scratch_excluding(c: &mut Criterion) {
    let pool = ScratchPool::new(ArenaSettings {
        reserve_size: 1 << 20,
        commit_size: PAGE_SIZE,
    });
    c.bench_function("scratch_nested_excluding", |b| {
        b.iter(|| {
            let outer = pool.scratch();
            black_box(outer.push::<u32>(64).unwrap());
            let inner = pool.scratch_excluding(&[outer.arena().id()]);
            black_box(inner.push::<u32>(64).unwrap());
        });
    });
}

fn bench_device_arena(c: &mut Criterion) {
    let mut device = HeadlessDevice::default();
    let allocator = DeviceAllocator::new(&device);
    let mut arena = DeviceArena::allocate(
        &allocator,
        &mut device,
        "bench",
        16 << 20,
        BufferUsages::STORAGE,
        MemoryClass::DeviceLocal,
    )
    .unwrap();
    c.bench_function("device_arena_offset_1k", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                black_box(arena.offset(96, 16).unwrap());
            }
            arena.reset();
        });
    });
}

criterion_group!(
    benches,
    bench_host_push,
    bench_checkpoint_rewind,
    bench_scratch_excluding,
    bench_device_arena
);
criterion_main!(benches);
