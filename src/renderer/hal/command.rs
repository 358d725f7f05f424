//! Command Recording
//!
//! A backend-agnostic command list. Backends replay the recorded
//! [`Command`]s at submit time.

use bytemuck::{Pod, Zeroable};

use super::{
    AccessFlags, BufferHandle, Extent2d, ImageHandle, ImageLayout, PipelineHandle, PipelineStages,
};

/// Device layout of one indexed indirect draw.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Zeroable, Pod)]
pub struct DrawIndexedIndirect {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// Queue-family ownership transfer carried by a barrier.
///
/// The same barrier is recorded twice: as a release on the source family's
/// command buffer and as an acquire on the destination family's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTransfer {
    pub src_family: u32,
    pub dst_family: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Tightly packed buffer region copied into a whole image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub extent: Extent2d,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
    pub src_stage: PipelineStages,
    pub dst_stage: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub queue_transfer: Option<QueueTransfer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: ImageHandle,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub src_stage: PipelineStages,
    pub dst_stage: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub queue_transfer: Option<QueueTransfer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        region: BufferCopy,
    },
    CopyBufferToImage {
        src: BufferHandle,
        dst: ImageHandle,
        region: BufferImageCopy,
    },
    /// Fill `size` bytes with the repeated 32-bit `value`.
    FillBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
        value: u32,
    },
    BufferBarrier(BufferBarrier),
    ImageBarrier(ImageBarrier),
    BindComputePipeline(PipelineHandle),
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    BindGraphicsPipeline(PipelineHandle),
    BindVertexBuffer(BufferHandle),
    BindIndexBuffer(BufferHandle),
    /// Indexed draws whose parameters and count live in device buffers.
    DrawIndexedIndirectCount {
        buffer: BufferHandle,
        offset: u64,
        count_buffer: BufferHandle,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
    },
}

/// A recorded command list bound to one queue family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandBuffer {
    queue_family: u32,
    commands: Vec<Command>,
}

impl CommandBuffer {
    #[must_use]
    pub fn new(queue_family: u32) -> Self {
        Self {
            queue_family,
            commands: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    #[inline]
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Drop all recorded commands, keeping the allocation.
    pub fn reset(&mut self) {
        self.commands.clear();
    }

    #[inline]
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, region: BufferCopy) {
        if region.size > 0 {
            self.push(Command::CopyBuffer { src, dst, region });
        }
    }

    pub fn copy_buffer_to_image(&mut self, src: BufferHandle, dst: ImageHandle, region: BufferImageCopy) {
        self.push(Command::CopyBufferToImage { src, dst, region });
    }

    pub fn fill_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64, value: u32) {
        self.push(Command::FillBuffer {
            buffer,
            offset,
            size,
            value,
        });
    }

    pub fn buffer_barrier(&mut self, barrier: BufferBarrier) {
        self.push(Command::BufferBarrier(barrier));
    }

    pub fn image_barrier(&mut self, barrier: ImageBarrier) {
        self.push(Command::ImageBarrier(barrier));
    }

    pub fn dispatch(&mut self, pipeline: PipelineHandle, x: u32, y: u32, z: u32) {
        self.push(Command::BindComputePipeline(pipeline));
        self.push(Command::Dispatch { x, y, z });
    }
}
