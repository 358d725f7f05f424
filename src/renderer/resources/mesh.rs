//! Mesh Storage
//!
//! All meshes share three permanent device-local buffers:
//!
//! ```text
//!  vertex buffer  [ mesh0 verts | mesh1 verts | ... ]   Vertex, 32 bytes
//!  index buffer   [ mesh0 idx   | mesh1 idx   | ... ]   u32
//!  handle buffer  [ h0 | h1 | ... ]                     MeshHandle, 16 bytes
//! ```
//!
//! Each buffer is append-only; a mesh id is the index of its handle.
//!
//! # File format
//!
//! Little-endian `u32 vertex_count`, `u32 index_count`, then
//! `vertex_count` [`Vertex`] records, then `index_count` `u32` indices.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::errors::{FloeError, Result};
use crate::renderer::core::{Buffer, DeviceAllocator, MemoryClass};
use crate::renderer::hal::{BufferUsages, GpuDevice};
use crate::renderer::settings::RendererSettings;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Zeroable, Pod)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

/// Where one mesh lives inside the shared vertex and index buffers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Zeroable, Pod)]
pub struct MeshHandle {
    pub vertex_offset: i32,
    pub vertex_count: u32,
    pub first_index: u32,
    pub index_count: u32,
}

/// Stable append-order mesh id.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Zeroable, Pod)]
pub struct MeshId(pub u32);

pub const VERTEX_SIZE: u64 = std::mem::size_of::<Vertex>() as u64;
pub const INDEX_SIZE: u64 = std::mem::size_of::<u32>() as u64;
pub const HANDLE_SIZE: u64 = std::mem::size_of::<MeshHandle>() as u64;

// ============================================================================
// File Header
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshHeader {
    pub vertex_count: u32,
    pub index_count: u32,
}

impl MeshHeader {
    pub const SIZE: u64 = 8;

    pub fn read_from(reader: &mut impl Read) -> std::io::Result<Self> {
        let mut raw = [0u8; 8];
        reader.read_exact(&mut raw)?;
        Ok(Self {
            vertex_count: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            index_count: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        })
    }

    #[must_use]
    pub fn vertex_bytes(&self) -> u64 {
        u64::from(self.vertex_count) * VERTEX_SIZE
    }

    #[must_use]
    pub fn index_bytes(&self) -> u64 {
        u64::from(self.index_count) * INDEX_SIZE
    }
}

/// Write `vertices` and `indices` in the mesh file format.
pub fn write_mesh_file(path: impl AsRef<Path>, vertices: &[Vertex], indices: &[u32]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&(vertices.len() as u32).to_le_bytes())?;
    out.write_all(&(indices.len() as u32).to_le_bytes())?;
    out.write_all(bytemuck::cast_slice(vertices))?;
    out.write_all(bytemuck::cast_slice(indices))?;
    out.flush()?;
    Ok(())
}

// ============================================================================
// Storage
// ============================================================================

/// Permanent geometry buffers and their logical fill counts.
#[derive(Debug)]
pub struct MeshStorage {
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    handle_buffer: Buffer,
    vertex_count: u32,
    index_count: u32,
    handle_count: u32,
    max_meshes: u32,
}

impl MeshStorage {
    pub fn new<D: GpuDevice>(allocator: &DeviceAllocator, device: &mut D, settings: &RendererSettings) -> Result<Self> {
        let geometry = BufferUsages::TRANSFER_DST | BufferUsages::STORAGE;
        let vertex_buffer = allocator.allocate_buffer(
            device,
            "mesh vertices",
            settings.vertex_buffer_size,
            geometry | BufferUsages::VERTEX,
            MemoryClass::DeviceLocal,
        )?;
        let index_buffer = allocator.allocate_buffer(
            device,
            "mesh indices",
            settings.index_buffer_size,
            geometry | BufferUsages::INDEX,
            MemoryClass::DeviceLocal,
        )?;
        let handle_buffer = allocator.allocate_buffer(
            device,
            "mesh handles",
            u64::from(settings.max_meshes) * HANDLE_SIZE,
            geometry,
            MemoryClass::DeviceLocal,
        )?;

        Ok(Self {
            vertex_buffer,
            index_buffer,
            handle_buffer,
            vertex_count: 0,
            index_count: 0,
            handle_count: 0,
            max_meshes: settings.max_meshes,
        })
    }

    /// Whether `vertices` more vertices and `indices` more indices fit
    /// behind the current contents.
    pub(crate) fn check_room(&self, vertices: u64, indices: u64, meshes: u64) -> Result<()> {
        let vertex_limit = self.vertex_buffer.capacity / VERTEX_SIZE;
        if u64::from(self.vertex_count) + vertices > vertex_limit {
            return Err(FloeError::CapacityExceeded {
                what: "vertex buffer",
                limit: vertex_limit,
            });
        }
        let index_limit = self.index_buffer.capacity / INDEX_SIZE;
        if u64::from(self.index_count) + indices > index_limit {
            return Err(FloeError::CapacityExceeded {
                what: "index buffer",
                limit: index_limit,
            });
        }
        if u64::from(self.handle_count) + meshes > u64::from(self.max_meshes) {
            return Err(FloeError::CapacityExceeded {
                what: "mesh",
                limit: u64::from(self.max_meshes),
            });
        }
        Ok(())
    }

    /// Advance the logical counts after a batch landed on the device.
    pub(crate) fn commit(&mut self, vertices: u32, indices: u32, handles: u32) {
        self.vertex_count += vertices;
        self.index_count += indices;
        self.handle_count += handles;
    }

    #[inline]
    #[must_use]
    pub fn vertex_buffer(&self) -> &Buffer {
        &self.vertex_buffer
    }

    #[inline]
    #[must_use]
    pub fn index_buffer(&self) -> &Buffer {
        &self.index_buffer
    }

    #[inline]
    #[must_use]
    pub fn handle_buffer(&self) -> &Buffer {
        &self.handle_buffer
    }

    /// Vertices resident on the device.
    #[inline]
    #[must_use]
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    #[inline]
    #[must_use]
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    #[inline]
    #[must_use]
    pub fn handle_count(&self) -> u32 {
        self.handle_count
    }

    #[inline]
    #[must_use]
    pub fn max_meshes(&self) -> u32 {
        self.max_meshes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_layouts() {
        assert_eq!(VERTEX_SIZE, 32);
        assert_eq!(HANDLE_SIZE, 16);
    }

    #[test]
    fn header_reads_little_endian() {
        let raw = [8u8, 0, 0, 0, 12, 0, 0, 0];
        let header = MeshHeader::read_from(&mut raw.as_slice()).unwrap();
        assert_eq!(header, MeshHeader { vertex_count: 8, index_count: 12 });
        assert_eq!(header.vertex_bytes(), 256);
        assert_eq!(header.index_bytes(), 48);
    }
}
