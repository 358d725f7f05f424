//! Device Memory Allocator
//!
//! Classifies the device's memory types once and allocates buffers and
//! dedicated image memory against them.
//!
//! | Class          | Required properties                            |
//! |----------------|------------------------------------------------|
//! | `HostVisible`  | `HOST_VISIBLE \| HOST_COHERENT`                |
//! | `DeviceLocal`  | `DEVICE_LOCAL`                                 |
//! | `HostToDevice` | `DEVICE_LOCAL \| HOST_VISIBLE \| HOST_COHERENT` |
//!
//! Device-local and host-to-device requests fall back to host-visible memory
//! when the hardware offers no exact match. Host-visible buffers are mapped
//! once at allocation and stay mapped until destroyed.

use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::errors::{FloeError, Result};
use crate::renderer::hal::{
    BufferDesc, BufferHandle, BufferUsages, GpuDevice, ImageHandle, MemoryHandle,
    MemoryPropertyFlags, MemoryType,
};

/// Usage class driving memory type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryClass {
    /// CPU-visible staging and readback memory.
    HostVisible,
    /// GPU-only memory.
    DeviceLocal,
    /// GPU memory the CPU can write directly.
    HostToDevice,
}

impl MemoryClass {
    #[must_use]
    pub fn required_flags(self) -> MemoryPropertyFlags {
        match self {
            Self::HostVisible => MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
            Self::DeviceLocal => MemoryPropertyFlags::DEVICE_LOCAL,
            Self::HostToDevice => {
                MemoryPropertyFlags::DEVICE_LOCAL
                    | MemoryPropertyFlags::HOST_VISIBLE
                    | MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }

    /// Whether buffers of this class are persistently mapped.
    #[inline]
    #[must_use]
    pub fn is_host_visible(self) -> bool {
        !matches!(self, Self::DeviceLocal)
    }
}

// ============================================================================
// Memory Type Table
// ============================================================================

/// Snapshot of the device's memory types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTypeTable {
    types: SmallVec<[MemoryType; 8]>,
}

impl MemoryTypeTable {
    #[must_use]
    pub fn classify(types: &[MemoryType]) -> Self {
        Self {
            types: types.iter().copied().collect(),
        }
    }

    #[must_use]
    pub fn types(&self) -> &[MemoryType] {
        &self.types
    }

    fn first_match(&self, type_bits: u32, required: MemoryPropertyFlags) -> Option<u32> {
        self.types
            .iter()
            .enumerate()
            .find(|(index, ty)| type_bits & (1 << index) != 0 && ty.property_flags.contains(required))
            .map(|(index, _)| index as u32)
    }

    /// First memory type allowed by `type_bits` that satisfies `class`.
    ///
    /// Device-local and host-to-device requests degrade to host-visible
    /// memory; failing that, no memory type qualifies.
    pub fn select_index(&self, type_bits: u32, class: MemoryClass) -> Result<u32> {
        if let Some(index) = self.first_match(type_bits, class.required_flags()) {
            return Ok(index);
        }
        if class != MemoryClass::HostVisible {
            if let Some(index) = self.first_match(type_bits, MemoryClass::HostVisible.required_flags()) {
                log::warn!(
                    "No {class:?} memory type in mask {type_bits:#x}; falling back to host-visible type {index}"
                );
                return Ok(index);
            }
        }
        Err(FloeError::NoCompatibleMemoryType { type_bits, class })
    }
}

// ============================================================================
// Buffer
// ============================================================================

/// A device buffer with its own memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    pub handle: BufferHandle,
    pub memory: MemoryHandle,
    pub memory_type_index: u32,
    /// Device address of byte 0.
    pub address: u64,
    pub capacity: u64,
    pub class: MemoryClass,
    mapped: bool,
}

impl Buffer {
    #[inline]
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// Device address of `offset`.
    #[inline]
    #[must_use]
    pub fn address_at(&self, offset: u64) -> u64 {
        self.address + offset
    }

    /// Write `data` through the persistent mapping.
    pub fn write<D: GpuDevice, T: Pod>(&self, device: &mut D, offset: u64, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.host_bytes_mut(device, offset, bytes.len() as u64)?
            .copy_from_slice(bytes);
        Ok(())
    }

    /// Host view of a mapped range.
    pub fn host_bytes_mut<'d, D: GpuDevice>(&self, device: &'d mut D, offset: u64, len: u64) -> Result<&'d mut [u8]> {
        if !self.mapped {
            return Err(FloeError::Device(format!(
                "buffer {} is not host mapped",
                self.handle.raw()
            )));
        }
        device.mapped_bytes_mut(self.handle, offset, len)
    }

    pub fn host_bytes<'d, D: GpuDevice>(&self, device: &'d D, offset: u64, len: u64) -> Result<&'d [u8]> {
        if !self.mapped {
            return Err(FloeError::Device(format!(
                "buffer {} is not host mapped",
                self.handle.raw()
            )));
        }
        device.mapped_bytes(self.handle, offset, len)
    }
}

// ============================================================================
// Allocator
// ============================================================================

#[derive(Debug, Clone)]
pub struct DeviceAllocator {
    table: MemoryTypeTable,
}

impl DeviceAllocator {
    #[must_use]
    pub fn new<D: GpuDevice>(device: &D) -> Self {
        Self {
            table: MemoryTypeTable::classify(device.memory_types()),
        }
    }

    #[must_use]
    pub fn table(&self) -> &MemoryTypeTable {
        &self.table
    }

    /// Create a buffer, allocate and bind its memory, and map it if `class`
    /// is host visible.
    pub fn allocate_buffer<D: GpuDevice>(
        &self,
        device: &mut D,
        label: &str,
        capacity: u64,
        usage: BufferUsages,
        class: MemoryClass,
    ) -> Result<Buffer> {
        let handle = device.create_buffer(&BufferDesc {
            label,
            size: capacity,
            usage: usage | BufferUsages::DEVICE_ADDRESS,
        })?;
        let requirements = device.buffer_memory_requirements(handle)?;
        let memory_type_index = self.table.select_index(requirements.type_bits, class)?;
        let memory = device.allocate_memory(requirements.size, memory_type_index, None)?;
        device.bind_buffer_memory(handle, memory, 0)?;
        let address = device.buffer_device_address(handle)?;

        let mapped = class.is_host_visible();
        if mapped {
            device.map_memory(memory)?;
        }

        log::info!(
            "Allocated buffer '{label}': {capacity} bytes, {class:?} (memory type {memory_type_index})"
        );

        Ok(Buffer {
            handle,
            memory,
            memory_type_index,
            address,
            capacity,
            class,
            mapped,
        })
    }

    /// Allocate and bind device-local memory used by `image` alone.
    pub fn allocate_image_dedicated<D: GpuDevice>(&self, device: &mut D, image: ImageHandle) -> Result<MemoryHandle> {
        let requirements = device.image_memory_requirements(image)?;
        let index = self
            .table
            .select_index(requirements.type_bits, MemoryClass::DeviceLocal)?;
        let memory = device.allocate_memory(requirements.size, index, Some(image))?;
        device.bind_image_memory(image, memory, 0)?;
        Ok(memory)
    }

    pub fn free_buffer<D: GpuDevice>(&self, device: &mut D, buffer: Buffer) {
        device.destroy_buffer(buffer.handle);
        device.free_memory(buffer.memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(flags: MemoryPropertyFlags) -> MemoryType {
        MemoryType {
            property_flags: flags,
            heap_index: 0,
        }
    }

    #[test]
    fn selection_respects_type_bits() {
        let table = MemoryTypeTable::classify(&[
            ty(MemoryPropertyFlags::DEVICE_LOCAL),
            ty(MemoryPropertyFlags::DEVICE_LOCAL),
        ]);
        assert_eq!(table.select_index(0b10, MemoryClass::DeviceLocal).unwrap(), 1);
    }

    #[test]
    fn host_visible_has_no_fallback() {
        let table = MemoryTypeTable::classify(&[ty(MemoryPropertyFlags::DEVICE_LOCAL)]);
        assert!(matches!(
            table.select_index(0b1, MemoryClass::HostVisible),
            Err(FloeError::NoCompatibleMemoryType { .. })
        ));
    }
}
