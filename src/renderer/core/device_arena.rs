//! Device Arena
//!
//! A bump allocator over a pre-sized [`Buffer`]. It has the same
//! no-individual-free contract as the host arena but no commit staging:
//! the buffer is sized up front and [`DeviceArena::reset`] is a cursor
//! rewind that never releases the buffer.
//!
//! Besides byte suballocation, images can be placed into the arena's
//! memory so several images share one device allocation.

use bytemuck::Pod;

use super::allocator::{Buffer, DeviceAllocator, MemoryClass};
use crate::errors::{FloeError, Result};
use crate::renderer::hal::{BufferUsages, GpuDevice, ImageHandle};

/// A region handed out by a [`DeviceArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceSpan {
    pub offset: u64,
    pub size: u64,
}

impl DeviceSpan {
    #[inline]
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug)]
pub struct DeviceArena {
    label: String,
    buffer: Buffer,
    cursor: u64,
}

impl DeviceArena {
    /// Wrap an already allocated buffer.
    #[must_use]
    pub fn new(label: impl Into<String>, buffer: Buffer) -> Self {
        Self {
            label: label.into(),
            buffer,
            cursor: 0,
        }
    }

    /// Allocate a backing buffer of `capacity` bytes and wrap it.
    pub fn allocate<D: GpuDevice>(
        allocator: &DeviceAllocator,
        device: &mut D,
        label: &str,
        capacity: u64,
        usage: BufferUsages,
        class: MemoryClass,
    ) -> Result<Self> {
        let buffer = allocator.allocate_buffer(device, label, capacity, usage, class)?;
        Ok(Self::new(label, buffer))
    }

    fn exhausted(&self, offset: u64, requested: u64) -> FloeError {
        FloeError::DeviceArenaExhausted {
            label: self.label.clone(),
            offset,
            requested,
            capacity: self.buffer.capacity,
        }
    }

    /// Align the cursor to `align` and advance it by `size`.
    pub fn offset(&mut self, size: u64, align: u64) -> Result<DeviceSpan> {
        assert!(
            align.is_power_of_two(),
            "device arena alignment must be a power of two, got {align}"
        );
        let start = self.cursor.next_multiple_of(align);
        let end = start
            .checked_add(size)
            .filter(|&end| end <= self.buffer.capacity)
            .ok_or_else(|| self.exhausted(start, size))?;
        self.cursor = end;
        Ok(DeviceSpan { offset: start, size })
    }

    /// Bind `image` at the cursor using the image's own requirements and
    /// advance past it.
    pub fn bind_image<D: GpuDevice>(&mut self, device: &mut D, image: ImageHandle) -> Result<DeviceSpan> {
        let requirements = device.image_memory_requirements(image)?;
        if requirements.type_bits & (1 << self.buffer.memory_type_index) == 0 {
            return Err(FloeError::Device(format!(
                "image {} cannot live in memory type {} of arena '{}'",
                image.raw(),
                self.buffer.memory_type_index,
                self.label
            )));
        }
        let span = self.offset(requirements.size, requirements.alignment.max(1))?;
        device.bind_image_memory(image, self.buffer.memory, span.offset)?;
        Ok(span)
    }

    /// Bind `image` inside a previously handed-out `slot` if it fits there.
    ///
    /// Returns `false` and leaves the image unbound when it does not fit.
    pub fn bind_image_in<D: GpuDevice>(&self, device: &mut D, image: ImageHandle, slot: DeviceSpan) -> Result<bool> {
        let requirements = device.image_memory_requirements(image)?;
        let fits = requirements.size <= slot.size
            && slot.offset % requirements.alignment.max(1) == 0
            && requirements.type_bits & (1 << self.buffer.memory_type_index) != 0;
        if fits {
            device.bind_image_memory(image, self.buffer.memory, slot.offset)?;
        }
        Ok(fits)
    }

    /// Rewind the cursor to the start of the buffer.
    #[inline]
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Device address of `offset`, for handing to shaders.
    #[inline]
    #[must_use]
    pub fn device_address(&self, offset: u64) -> u64 {
        self.buffer.address_at(offset)
    }

    /// Host view of `span`; the arena's buffer must be host visible.
    pub fn host_bytes_mut<'d, D: GpuDevice>(&self, device: &'d mut D, span: DeviceSpan) -> Result<&'d mut [u8]> {
        self.buffer.host_bytes_mut(device, span.offset, span.size)
    }

    /// Copy `data` into the start of `span`.
    pub fn write<D: GpuDevice, T: Pod>(&self, device: &mut D, span: DeviceSpan, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        assert!(
            bytes.len() as u64 <= span.size,
            "{} bytes written into a {}-byte span",
            bytes.len(),
            span.size
        );
        self.buffer.write(device, span.offset, bytes)
    }

    #[inline]
    #[must_use]
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    #[inline]
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Next free byte.
    #[inline]
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.buffer.capacity
    }

    #[inline]
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.buffer.capacity - self.cursor
    }
}
