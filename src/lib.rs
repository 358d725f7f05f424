#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

pub mod errors;
pub mod memory;
pub mod renderer;

pub use errors::{FloeError, Result};
pub use memory::{ArenaSettings, HostArena, ScratchPool};
pub use renderer::core::{DeviceAllocator, DeviceArena, MemoryClass};
pub use renderer::cull::CullParams;
pub use renderer::draw::DrawInfo;
pub use renderer::hal::{GpuDevice, HeadlessConfig, HeadlessDevice};
pub use renderer::resources::{MeshId, TextureDescriptor, TextureId};
pub use renderer::transfer::TransferEngine;
pub use renderer::{FrameReport, Renderer, RendererPipelines, RendererSettings};
