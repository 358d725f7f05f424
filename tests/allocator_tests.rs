//! Device Allocator Tests
//!
//! Tests for:
//! - Memory class selection on discrete, unified and host-only devices
//! - Fallback to host-visible memory and the no-match error
//! - Persistent mapping of host-visible buffers
//! - Device addresses and dedicated image memory

use floe::errors::FloeError;
use floe::renderer::core::{DeviceAllocator, MemoryClass, MemoryTypeTable};
use floe::renderer::hal::{
    BufferUsages, Extent2d, Format, GpuDevice, HeadlessConfig, HeadlessDevice, ImageDesc,
    ImageUsages, MemoryPropertyFlags, MemoryType,
};

fn allocate(device: &mut HeadlessDevice, class: MemoryClass) -> floe::renderer::core::Buffer {
    let allocator = DeviceAllocator::new(&*device);
    allocator
        .allocate_buffer(device, "test", 1024, BufferUsages::STORAGE, class)
        .unwrap()
}

// ============================================================================
// Memory Type Selection
// ============================================================================

#[test]
fn discrete_device_picks_exact_matches() {
    let mut device = HeadlessDevice::new(HeadlessConfig::discrete());

    let local = allocate(&mut device, MemoryClass::DeviceLocal);
    let host = allocate(&mut device, MemoryClass::HostVisible);
    let bar = allocate(&mut device, MemoryClass::HostToDevice);

    assert_eq!(local.memory_type_index, 0);
    assert_eq!(host.memory_type_index, 1);
    assert_eq!(bar.memory_type_index, 2);
    assert_eq!(device.buffer_memory_type(bar.handle), Some(2));
}

#[test]
fn unified_device_serves_every_class_from_shared_memory() {
    let mut device = HeadlessDevice::new(HeadlessConfig::unified());

    for class in [MemoryClass::DeviceLocal, MemoryClass::HostToDevice, MemoryClass::HostVisible] {
        let buffer = allocate(&mut device, class);
        assert_eq!(
            buffer.memory_type_index, 0,
            "Expected shared type 0 for {class:?}, got {}",
            buffer.memory_type_index
        );
    }
}

#[test]
fn host_only_device_falls_back_to_host_visible() {
    let mut device = HeadlessDevice::new(HeadlessConfig::host_only());

    let local = allocate(&mut device, MemoryClass::DeviceLocal);
    let bar = allocate(&mut device, MemoryClass::HostToDevice);

    assert_eq!(local.memory_type_index, 0);
    assert_eq!(bar.memory_type_index, 0);
    // The requested class is kept even when the memory came from the fallback.
    assert_eq!(local.class, MemoryClass::DeviceLocal);
    assert!(!local.is_mapped());
}

#[test]
fn no_memory_type_is_an_error() {
    let table = MemoryTypeTable::classify(&[MemoryType {
        property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
        heap_index: 0,
    }]);

    let err = table.select_index(0b1, MemoryClass::HostToDevice).unwrap_err();
    assert!(
        matches!(err, FloeError::NoCompatibleMemoryType { class: MemoryClass::HostToDevice, type_bits: 1 }),
        "Expected NoCompatibleMemoryType, got {err:?}"
    );
}

#[test]
fn type_bits_exclude_otherwise_matching_types() {
    let host = MemoryType {
        property_flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
        heap_index: 1,
    };
    let table = MemoryTypeTable::classify(&[host, host, host]);

    assert_eq!(table.select_index(0b100, MemoryClass::HostVisible).unwrap(), 2);
    assert!(table.select_index(0, MemoryClass::HostVisible).is_err());
}

// ============================================================================
// Mapping & Addresses
// ============================================================================

#[test]
fn host_visible_buffers_are_mapped_once_and_writable() {
    let mut device = HeadlessDevice::default();
    let buffer = allocate(&mut device, MemoryClass::HostVisible);
    assert!(buffer.is_mapped());

    buffer.write(&mut device, 64, &[0xDEAD_BEEFu32, 7]).unwrap();
    let bytes = buffer.host_bytes(&device, 64, 8).unwrap();
    assert_eq!(bytemuck::pod_read_unaligned::<u32>(&bytes[..4]), 0xDEAD_BEEF);
    assert_eq!(bytemuck::pod_read_unaligned::<u32>(&bytes[4..]), 7);
}

#[test]
fn device_local_buffers_reject_host_access() {
    let mut device = HeadlessDevice::default();
    let buffer = allocate(&mut device, MemoryClass::DeviceLocal);
    assert!(!buffer.is_mapped());

    let err = buffer.write(&mut device, 0, &[1u32]).unwrap_err();
    assert!(matches!(err, FloeError::Device(_)), "Expected Device error, got {err:?}");
}

#[test]
fn buffers_carry_distinct_device_addresses() {
    let mut device = HeadlessDevice::default();
    let a = allocate(&mut device, MemoryClass::DeviceLocal);
    let b = allocate(&mut device, MemoryClass::DeviceLocal);

    assert_ne!(a.address, 0);
    assert_ne!(a.address, b.address);
    assert_eq!(a.address_at(100), a.address + 100);
    assert_eq!(device.buffer_device_address(a.handle).unwrap(), a.address);
}

#[test]
fn free_releases_the_allocation() {
    let mut device = HeadlessDevice::default();
    let allocator = DeviceAllocator::new(&device);
    let before = device.allocated_bytes();

    let buffer = allocator
        .allocate_buffer(&mut device, "transient", 4096, BufferUsages::UNIFORM, MemoryClass::HostVisible)
        .unwrap();
    assert!(device.allocated_bytes() >= before + 4096);

    allocator.free_buffer(&mut device, buffer);
    assert_eq!(device.allocated_bytes(), before);
}

#[test]
fn exhausted_budget_surfaces_out_of_memory() {
    let mut device = HeadlessDevice::new(HeadlessConfig::discrete().with_memory_budget(2048));
    let allocator = DeviceAllocator::new(&device);

    let err = allocator
        .allocate_buffer(&mut device, "huge", 4096, BufferUsages::STORAGE, MemoryClass::DeviceLocal)
        .unwrap_err();
    assert!(
        matches!(err, FloeError::OutOfDeviceMemory { requested: 4096 }),
        "Expected OutOfDeviceMemory, got {err:?}"
    );
}

// ============================================================================
// Dedicated Images
// ============================================================================

#[test]
fn dedicated_image_memory_is_bound_at_zero() {
    let mut device = HeadlessDevice::default();
    let allocator = DeviceAllocator::new(&device);
    let image = device
        .create_image(&ImageDesc {
            label: "depth",
            format: Format::Depth32Float,
            extent: Extent2d::new(64, 32),
            usage: ImageUsages::DEPTH_STENCIL_ATTACHMENT,
        })
        .unwrap();

    let memory = allocator.allocate_image_dedicated(&mut device, image).unwrap();
    assert_eq!(device.image_binding(image), Some((memory, 0)));

    // Dedicated memory cannot be shared with a buffer.
    let buffer = device
        .create_buffer(&floe::renderer::hal::BufferDesc {
            label: "intruder",
            size: 16,
            usage: BufferUsages::STORAGE,
        })
        .unwrap();
    assert!(device.bind_buffer_memory(buffer, memory, 0).is_err());
}
