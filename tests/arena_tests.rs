//! Arena Tests
//!
//! Tests for:
//! - HostArena: push alignment and monotonicity, reservation ceiling, commit growth
//! - Checkpoints: nested scopes, TempArena rewind, reset reuse
//! - ScratchPool: conflict exclusion, over-exclusion panic
//! - DeviceArena: aligned suballocation, exhaustion, reset, host writes

use proptest::prelude::*;

use floe::errors::FloeError;
use floe::memory::{ArenaSettings, HostArena, ScratchPool, PAGE_SIZE};
use floe::renderer::core::{DeviceAllocator, DeviceArena, MemoryClass};
use floe::renderer::hal::{BufferUsages, HeadlessDevice};

fn small_arena() -> HostArena {
    HostArena::new(64 * 1024, PAGE_SIZE)
}

fn small_pool() -> ScratchPool {
    ScratchPool::new(ArenaSettings {
        reserve_size: 64 * 1024,
        commit_size: PAGE_SIZE,
    })
}

// ============================================================================
// HostArena Properties
// ============================================================================

proptest! {
    #[test]
    fn pushes_are_aligned_monotonic_and_within_reserve(
        pushes in prop::collection::vec((0usize..512, 0u32..5), 1..64),
    ) {
        let arena = HostArena::new(16 * 1024, PAGE_SIZE);
        let mut previous_end = 0;
        for (size, align_shift) in pushes {
            let align = 1usize << align_shift;
            match arena.push_bytes(size, align) {
                Ok(span) => {
                    prop_assert_eq!(span.offset() % align, 0);
                    prop_assert!(span.offset() >= previous_end, "push went backwards: {} < {}", span.offset(), previous_end);
                    prop_assert!(span.end() <= arena.reserve_size());
                    prop_assert!(arena.commit_pos() >= span.end());
                    previous_end = span.end();
                }
                Err(FloeError::ArenaExhausted { requested, .. }) => {
                    prop_assert_eq!(requested, size);
                    prop_assert_eq!(arena.offset(), previous_end);
                }
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
        }
    }

    #[test]
    fn checkpoint_restores_cursor(before in 0usize..2048, inside in prop::collection::vec(1usize..256, 0..16)) {
        let arena = small_arena();
        arena.push_bytes(before, 1).unwrap();
        let saved = arena.offset();

        let checkpoint = arena.checkpoint_begin();
        for size in inside {
            arena.push_bytes(size, 8).unwrap();
        }
        arena.checkpoint_end(checkpoint);

        prop_assert_eq!(arena.offset(), saved);
        prop_assert_eq!(arena.depth(), 0);
    }
}

// ============================================================================
// HostArena Behaviour
// ============================================================================

#[test]
fn push_past_reservation_fails_without_moving_cursor() {
    let arena = HostArena::new(PAGE_SIZE, PAGE_SIZE);
    arena.push_bytes(4000, 1).unwrap();

    let err = arena.push_bytes(200, 1).unwrap_err();
    assert!(
        matches!(err, FloeError::ArenaExhausted { requested: 200, reserve } if reserve == PAGE_SIZE),
        "Expected ArenaExhausted, got {err:?}"
    );
    assert_eq!(arena.offset(), 4000);
}

#[test]
fn commit_grows_in_commit_size_steps() {
    let arena = HostArena::new(1 << 20, 2 * PAGE_SIZE);
    assert_eq!(arena.commit_pos(), 2 * PAGE_SIZE);

    arena.push_bytes(2 * PAGE_SIZE + 1, 1).unwrap();
    assert_eq!(arena.commit_pos(), 4 * PAGE_SIZE);
}

#[test]
fn typed_push_round_trips_values() {
    let arena = small_arena();
    let values: Vec<u64> = (0..32).map(|i| i * i).collect();
    let span = arena.push_slice(&values).unwrap();

    assert_eq!(span.len(), 32);
    assert_eq!(span.offset() % 8, 0);
    assert_eq!(arena.to_vec(span), values);
    assert_eq!(arena.get(span, 5), 25);
}

#[test]
fn reset_reuses_the_same_offsets() {
    let arena = small_arena();
    let first = arena.push::<[f32; 4]>(10).unwrap();
    arena.push::<u8>(3).unwrap();
    arena.reset();

    let again = arena.push::<[f32; 4]>(10).unwrap();
    assert_eq!(again.offset(), first.offset());
    assert_eq!(arena.offset(), again.end());
}

#[test]
fn nested_checkpoints_rewind_in_order() {
    let arena = small_arena();
    arena.push::<u32>(4).unwrap();

    let outer = arena.checkpoint_begin();
    arena.push::<u32>(16).unwrap();
    let after_outer_push = arena.offset();

    let inner = arena.checkpoint_begin();
    arena.push::<u32>(64).unwrap();
    assert_eq!(arena.depth(), 2);

    arena.checkpoint_end(inner);
    assert_eq!(arena.offset(), after_outer_push);
    arena.checkpoint_end(outer);
    assert_eq!(arena.offset(), 16);
}

#[test]
fn temp_arena_rewinds_on_drop() {
    let arena = small_arena();
    let kept = arena.push_slice(&[7u32, 8, 9]).unwrap();
    {
        let temp = arena.temp();
        temp.push::<u64>(100).unwrap();
        assert!(arena.offset() > kept.end());
    }
    assert_eq!(arena.offset(), kept.end());
    assert_eq!(arena.to_vec(kept), vec![7, 8, 9]);
}

#[test]
#[should_panic(expected = "checkpoints are outstanding")]
fn reset_inside_checkpoint_panics() {
    let arena = small_arena();
    let _checkpoint = arena.checkpoint_begin();
    arena.reset();
}

#[test]
#[should_panic(expected = "different arena")]
fn span_from_another_arena_panics() {
    let a = small_arena();
    let b = small_arena();
    let span = a.push::<u32>(1).unwrap();
    b.push::<u32>(1).unwrap();
    let _ = b.get(span, 0);
}

// ============================================================================
// ScratchPool Tests
// ============================================================================

#[test]
fn scratch_returns_first_slot_by_default() {
    let pool = small_pool();
    let first = pool.scratch().arena().id();
    let second = pool.scratch().arena().id();
    assert_eq!(first, second);
}

#[test]
fn scratch_excluding_skips_conflicting_arena() {
    let pool = small_pool();
    let outer = pool.scratch();
    outer.push::<u32>(8).unwrap();
    let outer_id = outer.arena().id();

    let inner = pool.scratch_excluding(&[outer_id]);
    assert_ne!(inner.arena().id(), outer_id);
    let span = inner.push::<u32>(8).unwrap();
    assert_eq!(span.offset(), 0, "Expected a fresh slot, got offset {}", span.offset());
}

#[test]
fn scratch_conflicts_with_foreign_arena_are_ignored() {
    let pool = small_pool();
    let foreign = small_arena();
    let scratch = pool.scratch_excluding(&[foreign.id()]);
    assert_eq!(pool.initialised(), vec![scratch.arena().id()]);
}

#[test]
#[should_panic(expected = "scratch exclusions requested")]
fn scratch_over_exclusion_panics() {
    let pool = small_pool();
    let a = small_arena();
    let b = small_arena();
    let c = small_arena();
    let _ = pool.scratch_excluding(&[a.id(), b.id(), c.id()]);
}

#[test]
#[should_panic(expected = "every pool slot is excluded")]
fn scratch_with_every_slot_excluded_panics() {
    let pool = small_pool();
    let first = pool.scratch();
    let second = pool.scratch_excluding(&[first.arena().id()]);
    let ids = [first.arena().id(), second.arena().id()];
    let _ = pool.scratch_excluding(&ids);
}

// ============================================================================
// DeviceArena Tests
// ============================================================================

fn device_arena(device: &mut HeadlessDevice, capacity: u64, class: MemoryClass) -> DeviceArena {
    let allocator = DeviceAllocator::new(&*device);
    DeviceArena::allocate(
        &allocator,
        device,
        "test arena",
        capacity,
        BufferUsages::TRANSFER_SRC,
        class,
    )
    .unwrap()
}

#[test]
fn device_arena_offsets_are_aligned() {
    let mut device = HeadlessDevice::default();
    let mut arena = device_arena(&mut device, 1024, MemoryClass::HostVisible);

    let a = arena.offset(10, 4).unwrap();
    let b = arena.offset(32, 16).unwrap();
    let c = arena.offset(1, 256).unwrap();

    assert_eq!(a.offset, 0);
    assert_eq!(b.offset, 16);
    assert_eq!(c.offset, 256);
    assert_eq!(arena.cursor(), 257);
    assert_eq!(arena.remaining(), 1024 - 257);
}

#[test]
fn device_arena_exhaustion_reports_capacity() {
    let mut device = HeadlessDevice::default();
    let mut arena = device_arena(&mut device, 256, MemoryClass::HostVisible);
    arena.offset(200, 1).unwrap();

    let err = arena.offset(100, 1).unwrap_err();
    assert!(
        matches!(err, FloeError::DeviceArenaExhausted { requested: 100, capacity: 256, offset: 200, .. }),
        "Expected DeviceArenaExhausted, got {err:?}"
    );
    assert_eq!(arena.cursor(), 200);
}

#[test]
fn device_arena_reset_rewinds_without_freeing() {
    let mut device = HeadlessDevice::default();
    let mut arena = device_arena(&mut device, 512, MemoryClass::HostVisible);
    let allocations = device.live_allocations();

    arena.offset(300, 1).unwrap();
    arena.reset();
    assert_eq!(arena.cursor(), 0);
    assert_eq!(arena.offset(512, 1).unwrap().offset, 0);
    assert_eq!(device.live_allocations(), allocations);
}

#[test]
fn device_arena_writes_land_in_the_buffer() {
    let mut device = HeadlessDevice::default();
    let mut arena = device_arena(&mut device, 256, MemoryClass::HostVisible);
    arena.offset(8, 1).unwrap();
    let span = arena.offset(16, 16).unwrap();
    arena.write(&mut device, span, &[1u32, 2, 3, 4]).unwrap();

    let words = device.read_buffer_as::<u32>(arena.buffer().handle, 16, 4).unwrap();
    assert_eq!(words, vec![1, 2, 3, 4]);
    assert_eq!(arena.device_address(16), arena.buffer().address + 16);
}
