//! Device Resources
//!
//! Long-lived GPU data owned by the renderer:
//!
//! - [`mesh`]: shared vertex/index/handle buffers and the mesh file format
//! - [`texture`]: images, views and samplers addressed by bindless id

pub mod mesh;
pub mod texture;

pub use mesh::{write_mesh_file, MeshHandle, MeshHeader, MeshId, MeshStorage, Vertex};
pub use texture::{
    TextureDescriptor, TextureFlags, TextureId, TextureKind, TextureRegistry, TextureUsage, Texture,
};
