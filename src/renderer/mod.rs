//! Rendering Core
//!
//! [`Renderer`] owns every device resource the frame loop touches and is the
//! surface applications drive:
//!
//! | Call                  | Effect                                              |
//! |-----------------------|-----------------------------------------------------|
//! | `create_mesh`         | queue a mesh upload, returns its final id at once   |
//! | `create_texture`      | create an image (arena-placed or dedicated)         |
//! | `texture_from_file`   | decode, create and queue the pixel upload           |
//! | `alloc_uniform`       | per-frame uniform block with its device address     |
//! | `submit_draw`         | append a draw record to the current frame           |
//! | `run_frame`           | wait, acquire, stage, cull, submit, present, rotate |
//! | `on_resize`           | rebuild window-relative textures and the swapchain  |
//!
//! # Example
//!
//! ```rust,ignore
//! use floe::renderer::{Renderer, RendererPipelines};
//! use floe::renderer::hal::HeadlessDevice;
//! use floe::renderer::cull::headless_kernel;
//!
//! let mut device = HeadlessDevice::default();
//! let pipelines = RendererPipelines {
//!     cull: device.register_compute_kernel(headless_kernel(64)),
//!     draw: device.register_graphics_pipeline(),
//! };
//! let mut renderer = Renderer::new(device, RendererSettings::default(), pipelines)?;
//!
//! let cube = renderer.create_mesh("assets/cube.mesh")?;
//! renderer.submit_draw(&DrawInfo::new(cube, Mat4::IDENTITY))?;
//! renderer.run_frame()?;
//! ```

use std::path::Path;

use bytemuck::Pod;

use crate::errors::Result;
use crate::memory::ScratchPool;

pub mod core;
pub mod cull;
pub mod draw;
pub mod frame;
pub mod hal;
pub mod resources;
pub mod settings;
pub mod swapchain;
pub mod transfer;
pub mod uniforms;

use self::core::{Buffer, DeviceAllocator, DeviceArena, MemoryClass};
use self::cull::{indirect_buffer_size, CullParams};
use self::draw::{DrawInfo, DrawInfoBuffers};
pub use self::frame::{FrameReport, FrameState, FrameSync, IndirectDrawRecipe, RecipeContext, RenderRecipe, RendererPipelines};
use self::hal::{bindings, BufferUsages, CommandBuffer, DescriptorResource, DescriptorWrite, Format, GpuDevice};
use self::resources::mesh::{MeshId, MeshStorage};
use self::resources::texture::{decode_rgba8, TextureDescriptor, TextureId, TextureRegistry};
pub use self::settings::RendererSettings;
use self::swapchain::Swapchain;
use self::transfer::{FlushStats, TransferEngine};
use self::uniforms::{UniformAllocation, UniformStaging};

pub struct Renderer<D: GpuDevice> {
    device: D,
    settings: RendererSettings,
    allocator: DeviceAllocator,
    scratch: ScratchPool,

    // Resources
    meshes: MeshStorage,
    textures: TextureRegistry,
    image_arena: DeviceArena,
    transfer: TransferEngine,

    // Per-frame data
    draw_infos: DrawInfoBuffers,
    uniforms: UniformStaging,
    indirect: Buffer,
    cull_params_buffer: Buffer,
    cull_params: CullParams,

    // Presentation
    swapchain: Swapchain,
    frame_commands: Vec<CommandBuffer>,
    sync: FrameSync,
    pipelines: RendererPipelines,
    recipe: Box<dyn RenderRecipe>,

    frame_count: u64,
    state: FrameState,
}

impl<D: GpuDevice> Renderer<D> {
    /// Allocate every permanent resource and the swapchain.
    pub fn new(mut device: D, settings: RendererSettings, pipelines: RendererPipelines) -> Result<Self> {
        settings.validate()?;
        let allocator = DeviceAllocator::new(&device);
        let scratch = ScratchPool::new(settings.scratch.clone());

        let meshes = MeshStorage::new(&allocator, &mut device, &settings)?;
        let image_arena = DeviceArena::allocate(
            &allocator,
            &mut device,
            "images",
            settings.image_arena_size,
            BufferUsages::STORAGE,
            MemoryClass::DeviceLocal,
        )?;
        let transfer = TransferEngine::new(&mut device, &allocator, settings.staging_size)?;

        let draw_infos = DrawInfoBuffers::new(&allocator, &mut device, settings.max_draws)?;
        let uniforms = UniformStaging::new(&allocator, &mut device, settings.uniform_size)?;
        let indirect = allocator.allocate_buffer(
            &mut device,
            "indirect draws",
            indirect_buffer_size(settings.max_draws),
            BufferUsages::STORAGE | BufferUsages::INDIRECT | BufferUsages::TRANSFER_DST,
            MemoryClass::DeviceLocal,
        )?;
        let cull_params = CullParams::default();
        let cull_params_buffer = allocator.allocate_buffer(
            &mut device,
            "cull params",
            std::mem::size_of::<CullParams>() as u64,
            BufferUsages::UNIFORM | BufferUsages::STORAGE,
            MemoryClass::HostToDevice,
        )?;
        cull_params_buffer.write(&mut device, 0, &[cull_params])?;

        let swapchain = Swapchain::new(&mut device, settings.swapchain_format)?;
        let graphics = device.queue_families().graphics;
        let frame_commands = (0..swapchain.image_count())
            .map(|_| CommandBuffer::new(graphics))
            .collect();
        let sync = FrameSync::new(&mut device)?;
        let textures = TextureRegistry::new(settings.max_textures);

        let whole = |binding: u32, buffer: &Buffer| DescriptorWrite {
            binding,
            array_element: 0,
            resource: DescriptorResource::Buffer {
                buffer: buffer.handle,
                offset: 0,
                size: buffer.capacity,
            },
        };
        device.update_descriptors(&[
            draw_infos.descriptor_write(),
            whole(bindings::MESH_HANDLES, meshes.handle_buffer()),
            whole(bindings::INDIRECT, &indirect),
            whole(bindings::CULL_PARAMS, &cull_params_buffer),
        ])?;

        log::info!(
            "Renderer ready: {} meshes, {} textures, {} draws per frame, {} swapchain images",
            settings.max_meshes,
            settings.max_textures,
            settings.max_draws,
            swapchain.image_count()
        );

        Ok(Self {
            device,
            settings,
            allocator,
            scratch,
            meshes,
            textures,
            image_arena,
            transfer,
            draw_infos,
            uniforms,
            indirect,
            cull_params_buffer,
            cull_params,
            swapchain,
            frame_commands,
            sync,
            pipelines,
            recipe: Box::new(IndirectDrawRecipe),
            frame_count: 0,
            state: FrameState::Idle,
        })
    }

    /// Replace the recipe that records the draw part of each frame.
    #[must_use]
    pub fn with_recipe(mut self, recipe: impl RenderRecipe + 'static) -> Self {
        self.recipe = Box::new(recipe);
        self
    }

    // ========================================================================
    // Resources
    // ========================================================================

    /// Queue the mesh at `path` for upload. The id is valid immediately; the
    /// geometry lands on the device at the next flush.
    pub fn create_mesh(&mut self, path: impl AsRef<Path>) -> Result<MeshId> {
        self.transfer.queue_mesh(path, &self.meshes)
    }

    pub fn create_texture(&mut self, desc: &TextureDescriptor) -> Result<TextureId> {
        self.textures
            .create(&mut self.device, &self.allocator, &mut self.image_arena, desc)
    }

    /// Queue tightly packed `pixels` for upload into texture `id`.
    pub fn upload_texture(&mut self, id: TextureId, pixels: Vec<u8>) -> Result<()> {
        self.textures.require(id)?;
        let request = self.transfer.queue_texture();
        request.texture = id;
        request.pixels = pixels;
        Ok(())
    }

    /// Decode an image file into a new sampled RGBA8 sRGB texture.
    pub fn texture_from_file(&mut self, path: impl AsRef<Path>) -> Result<TextureId> {
        let (extent, pixels) = decode_rgba8(path)?;
        let id = self.create_texture(&TextureDescriptor::sampled(Format::Rgba8UnormSrgb, extent))?;
        self.upload_texture(id, pixels)?;
        Ok(id)
    }

    /// Upload everything queued now instead of at the next frame.
    pub fn flush_transfers(&mut self) -> Result<FlushStats> {
        self.transfer
            .flush(&mut self.device, &self.scratch, &mut self.meshes, &mut self.textures)
    }

    // ========================================================================
    // Per-Frame Data
    // ========================================================================

    /// Allocate a uniform block for the current frame.
    pub fn alloc_uniform(&mut self, size: u64) -> Result<UniformAllocation> {
        self.uniforms.alloc(size)
    }

    pub fn write_uniform<T: Pod>(&mut self, allocation: &UniformAllocation, data: &[T]) -> Result<()> {
        self.uniforms.write(&mut self.device, allocation, data)
    }

    /// Append a draw record to the current frame.
    ///
    /// # Panics
    ///
    /// Panics when more than `max_draws` records are submitted in one frame.
    pub fn submit_draw(&mut self, draw: &DrawInfo) -> Result<u32> {
        self.draw_infos.push(&mut self.device, draw)
    }

    /// Parameters for the next frame's cull pass.
    pub fn set_cull_params(&mut self, params: CullParams) {
        self.cull_params = params;
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    #[inline]
    #[must_use]
    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    #[inline]
    #[must_use]
    pub fn allocator(&self) -> &DeviceAllocator {
        &self.allocator
    }

    #[inline]
    #[must_use]
    pub fn scratch(&self) -> &ScratchPool {
        &self.scratch
    }

    #[inline]
    #[must_use]
    pub fn meshes(&self) -> &MeshStorage {
        &self.meshes
    }

    /// Mesh ids handed out so far, including uploads still queued.
    #[must_use]
    pub fn mesh_count(&self) -> u32 {
        self.meshes.handle_count() + self.transfer.pending_meshes().len() as u32
    }

    #[inline]
    #[must_use]
    pub fn textures(&self) -> &TextureRegistry {
        &self.textures
    }

    #[inline]
    #[must_use]
    pub fn image_arena(&self) -> &DeviceArena {
        &self.image_arena
    }

    #[inline]
    #[must_use]
    pub fn transfer(&self) -> &TransferEngine {
        &self.transfer
    }

    #[inline]
    #[must_use]
    pub fn draw_infos(&self) -> &DrawInfoBuffers {
        &self.draw_infos
    }

    #[inline]
    #[must_use]
    pub fn uniforms(&self) -> &UniformStaging {
        &self.uniforms
    }

    #[inline]
    #[must_use]
    pub fn indirect_buffer(&self) -> &Buffer {
        &self.indirect
    }

    #[inline]
    #[must_use]
    pub fn cull_params(&self) -> &CullParams {
        &self.cull_params
    }

    #[inline]
    #[must_use]
    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    #[inline]
    #[must_use]
    pub fn frame_commands(&self) -> &[CommandBuffer] {
        &self.frame_commands
    }

    #[inline]
    #[must_use]
    pub fn sync(&self) -> &FrameSync {
        &self.sync
    }

    #[inline]
    #[must_use]
    pub fn pipelines(&self) -> &RendererPipelines {
        &self.pipelines
    }

    /// Frames completed so far.
    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> FrameState {
        self.state
    }
}
