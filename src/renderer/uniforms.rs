//! Uniform Staging
//!
//! Uniform blocks are written by the host into a host-visible staging arena
//! and copied into one device-local uniform buffer at the start of each
//! frame's command stream. Shaders address them by device address, which is
//! the uniform buffer's address plus the staging offset.
//!
//! Staging is double-buffered per frame slot: an allocation is valid until
//! the frame it was made for rotates out.

use bytemuck::Pod;

use crate::errors::Result;
use crate::renderer::core::{Buffer, DeviceAllocator, DeviceArena, DeviceSpan, MemoryClass};
use crate::renderer::hal::{
    AccessFlags, BufferBarrier, BufferCopy, BufferUsages, CommandBuffer, GpuDevice, PipelineStages,
};

pub const UNIFORM_ALIGNMENT: u64 = 16;

/// A uniform block allocated for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformAllocation {
    pub span: DeviceSpan,
    /// Frame slot whose staging arena holds the host copy.
    pub slot: usize,
    /// Address shaders read the block from.
    pub device_address: u64,
}

#[derive(Debug)]
pub struct UniformStaging {
    staging: [DeviceArena; 2],
    uniforms: Buffer,
    slot: usize,
}

impl UniformStaging {
    pub fn new<D: GpuDevice>(allocator: &DeviceAllocator, device: &mut D, size: u64) -> Result<Self> {
        let staging = [
            DeviceArena::allocate(
                allocator,
                device,
                "uniform staging 0",
                size,
                BufferUsages::TRANSFER_SRC,
                MemoryClass::HostVisible,
            )?,
            DeviceArena::allocate(
                allocator,
                device,
                "uniform staging 1",
                size,
                BufferUsages::TRANSFER_SRC,
                MemoryClass::HostVisible,
            )?,
        ];
        let uniforms = allocator.allocate_buffer(
            device,
            "uniforms",
            size,
            BufferUsages::TRANSFER_DST | BufferUsages::UNIFORM,
            MemoryClass::DeviceLocal,
        )?;
        Ok(Self {
            staging,
            uniforms,
            slot: 0,
        })
    }

    /// Reserve `size` bytes, 16-byte aligned, in the current frame slot.
    pub fn alloc(&mut self, size: u64) -> Result<UniformAllocation> {
        let span = self.staging[self.slot].offset(size, UNIFORM_ALIGNMENT)?;
        Ok(UniformAllocation {
            span,
            slot: self.slot,
            device_address: self.uniforms.address_at(span.offset),
        })
    }

    fn check_current(&self, allocation: &UniformAllocation) {
        assert_eq!(
            allocation.slot, self.slot,
            "uniform allocation used after its frame rotated out"
        );
    }

    /// Copy `data` into the host side of `allocation`.
    pub fn write<D: GpuDevice, T: Pod>(&self, device: &mut D, allocation: &UniformAllocation, data: &[T]) -> Result<()> {
        self.check_current(allocation);
        self.staging[self.slot].write(device, allocation.span, data)
    }

    pub fn host_bytes_mut<'d, D: GpuDevice>(
        &self,
        device: &'d mut D,
        allocation: &UniformAllocation,
    ) -> Result<&'d mut [u8]> {
        self.check_current(allocation);
        self.staging[self.slot].host_bytes_mut(device, allocation.span)
    }

    /// Record the staging → device copy for the current slot, bracketed by
    /// barriers against shader reads of the previous frame.
    pub fn record_copy(&self, cmd: &mut CommandBuffer) {
        let used = self.used();
        if used == 0 {
            return;
        }
        let barrier = BufferBarrier {
            buffer: self.uniforms.handle,
            offset: 0,
            size: used,
            src_stage: PipelineStages::VERTEX_SHADER | PipelineStages::FRAGMENT_SHADER,
            dst_stage: PipelineStages::TRANSFER,
            src_access: AccessFlags::empty(),
            dst_access: AccessFlags::TRANSFER_WRITE,
            queue_transfer: None,
        };
        cmd.buffer_barrier(barrier);
        cmd.copy_buffer(
            self.staging[self.slot].buffer().handle,
            self.uniforms.handle,
            BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: used,
            },
        );
        cmd.buffer_barrier(BufferBarrier {
            src_stage: PipelineStages::TRANSFER,
            dst_stage: PipelineStages::VERTEX_SHADER
                | PipelineStages::FRAGMENT_SHADER
                | PipelineStages::COMPUTE_SHADER,
            src_access: AccessFlags::TRANSFER_WRITE,
            dst_access: AccessFlags::UNIFORM_READ,
            ..barrier
        });
    }

    /// Move to the other slot and empty it.
    pub fn rotate(&mut self) {
        self.slot ^= 1;
        self.staging[self.slot].reset();
    }

    /// Bytes allocated in the current slot.
    #[inline]
    #[must_use]
    pub fn used(&self) -> u64 {
        self.staging[self.slot].cursor()
    }

    #[inline]
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    #[must_use]
    pub fn device_buffer(&self) -> &Buffer {
        &self.uniforms
    }

    #[inline]
    #[must_use]
    pub fn staging(&self, slot: usize) -> &DeviceArena {
        &self.staging[slot]
    }
}
