//! Draw Records
//!
//! The host appends one [`DrawInfo`] per object per frame. Records live in
//! two host-writable device buffers used alternately, so the device can
//! still read frame N-1's list while the host fills frame N's.
//!
//! Buffer layout, mirrored by the cull pass:
//!
//! ```text
//!  [ count: u32 | pad: [u32; 3] ][ DrawInfo; capacity ]
//!    16 bytes                      96 bytes each
//! ```

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::errors::Result;
use crate::renderer::core::{Buffer, DeviceAllocator, MemoryClass};
use crate::renderer::hal::{bindings, BufferUsages, DescriptorResource, DescriptorWrite, GpuDevice};
use crate::renderer::resources::mesh::MeshId;
use crate::renderer::resources::texture::TextureId;

/// One object to draw this frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Zeroable, Pod)]
pub struct DrawInfo {
    pub transform: Mat4,
    pub mesh_id: u32,
    pub texture_id: u32,
    pub specularity: f32,
    pub shader_id: u32,
    /// Packed RGBA8.
    pub color: u32,
    pub _pad: [u32; 3],
}

impl DrawInfo {
    #[must_use]
    pub fn new(mesh: MeshId, transform: Mat4) -> Self {
        Self {
            transform,
            mesh_id: mesh.0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_texture(mut self, texture: TextureId) -> Self {
        self.texture_id = texture.0;
        self
    }

    #[must_use]
    pub fn with_color(mut self, rgba: [u8; 4]) -> Self {
        self.color = u32::from_le_bytes(rgba);
        self
    }

    #[must_use]
    pub fn with_specularity(mut self, specularity: f32) -> Self {
        self.specularity = specularity;
        self
    }

    #[must_use]
    pub fn with_shader(mut self, shader_id: u32) -> Self {
        self.shader_id = shader_id;
        self
    }
}

impl Default for DrawInfo {
    fn default() -> Self {
        Self {
            transform: Mat4::IDENTITY,
            mesh_id: 0,
            texture_id: TextureId::NULL.0,
            specularity: 0.0,
            shader_id: 0,
            color: u32::MAX,
            _pad: [0; 3],
        }
    }
}

/// Header preceding the records of a draw-info buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Zeroable, Pod)]
pub struct DrawListHeader {
    pub count: u32,
    pub _pad: [u32; 3],
}

pub const DRAW_INFO_SIZE: u64 = std::mem::size_of::<DrawInfo>() as u64;
pub const DRAW_LIST_HEADER_SIZE: u64 = std::mem::size_of::<DrawListHeader>() as u64;

// ============================================================================
// Double-Buffered Draw Lists
// ============================================================================

#[derive(Debug)]
pub struct DrawInfoBuffers {
    buffers: [Buffer; 2],
    counts: [u32; 2],
    active: usize,
    capacity: u32,
}

impl DrawInfoBuffers {
    pub fn new<D: GpuDevice>(allocator: &DeviceAllocator, device: &mut D, capacity: u32) -> Result<Self> {
        let size = DRAW_LIST_HEADER_SIZE + u64::from(capacity) * DRAW_INFO_SIZE;
        let mut allocate = |label: &str| {
            let buffer = allocator.allocate_buffer(
                device,
                label,
                size,
                BufferUsages::STORAGE,
                MemoryClass::HostToDevice,
            )?;
            buffer.write(device, 0, &[DrawListHeader::default()])?;
            Ok::<_, crate::errors::FloeError>(buffer)
        };
        let buffers = [allocate("draw infos 0")?, allocate("draw infos 1")?];
        Ok(Self {
            buffers,
            counts: [0; 2],
            active: 0,
            capacity,
        })
    }

    /// Append `draw` to the active list and return its index.
    ///
    /// # Panics
    ///
    /// Panics when the list already holds `capacity` records.
    pub fn push<D: GpuDevice>(&mut self, device: &mut D, draw: &DrawInfo) -> Result<u32> {
        let index = self.counts[self.active];
        assert!(
            index < self.capacity,
            "draw capacity exceeded: {} records per frame",
            self.capacity
        );
        let buffer = &self.buffers[self.active];
        buffer.write(
            device,
            DRAW_LIST_HEADER_SIZE + u64::from(index) * DRAW_INFO_SIZE,
            std::slice::from_ref(draw),
        )?;
        buffer.write(
            device,
            0,
            &[DrawListHeader {
                count: index + 1,
                _pad: [0; 3],
            }],
        )?;
        self.counts[self.active] = index + 1;
        Ok(index)
    }

    /// Switch to the other list and empty it.
    pub fn rotate<D: GpuDevice>(&mut self, device: &mut D) -> Result<()> {
        self.active ^= 1;
        self.counts[self.active] = 0;
        self.buffers[self.active].write(device, 0, &[DrawListHeader::default()])
    }

    /// Points the draw-info binding at the active list.
    #[must_use]
    pub fn descriptor_write(&self) -> DescriptorWrite {
        let buffer = &self.buffers[self.active];
        DescriptorWrite {
            binding: bindings::DRAW_INFO,
            array_element: 0,
            resource: DescriptorResource::Buffer {
                buffer: buffer.handle,
                offset: 0,
                size: buffer.capacity,
            },
        }
    }

    #[inline]
    #[must_use]
    pub fn active_index(&self) -> usize {
        self.active
    }

    /// Records in the active list.
    #[inline]
    #[must_use]
    pub fn count(&self) -> u32 {
        self.counts[self.active]
    }

    #[inline]
    #[must_use]
    pub fn count_of(&self, index: usize) -> u32 {
        self.counts[index]
    }

    #[inline]
    #[must_use]
    pub fn active_buffer(&self) -> &Buffer {
        &self.buffers[self.active]
    }

    #[inline]
    #[must_use]
    pub fn buffer(&self, index: usize) -> &Buffer {
        &self.buffers[index]
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_matches_device() {
        assert_eq!(DRAW_INFO_SIZE, 96);
        assert_eq!(DRAW_LIST_HEADER_SIZE, 16);
    }

    #[test]
    fn color_packs_rgba() {
        let draw = DrawInfo::new(MeshId(3), Mat4::IDENTITY).with_color([1, 2, 3, 4]);
        assert_eq!(draw.color.to_le_bytes(), [1, 2, 3, 4]);
        assert_eq!(draw.mesh_id, 3);
    }
}
