//! wgpu Backend
//!
//! Maps [`GpuDevice`] onto `wgpu`. wgpu manages memory and synchronisation
//! itself, so several HAL concepts collapse:
//!
//! - One queue family serves graphics and transfer; ownership barriers and
//!   layout transitions are no-ops.
//! - Memory allocations are bookkeeping records. Host-visible buffers keep a
//!   host shadow that is uploaded with `queue.write_buffer` before every
//!   submission that follows a host write.
//! - Buffer → image copies are replayed with `queue.write_texture` from the
//!   source buffer's shadow, which lifts wgpu's row-pitch restriction.
//! - Fences and semaphores are flags set at submit; waiting on a signalled
//!   fence polls the device until the queue drains.
//! - The swapchain is a ring of offscreen render targets. Windowing stays
//!   with the embedding application.
//!
//! Pipelines are created by the pipeline layer and registered together with
//! the global-set bindings they read, so the backend can build their bind
//! groups from the current descriptor writes.

use std::num::NonZeroU64;

use rustc_hash::FxHashMap;

use super::{
    BufferDesc, BufferHandle, BufferUsages, Command, DescriptorResource, DescriptorWrite, Extent2d,
    FenceHandle, Format, GpuDevice, ImageDesc, ImageHandle, ImageLayout, ImageUsages,
    ImageViewHandle, MemoryHandle, MemoryPropertyFlags, MemoryRequirements, MemoryType,
    PipelineHandle, PresentStatus, QueueFamilies, SamplerDesc, SamplerHandle, SemaphoreHandle,
    SubmitInfo, SwapchainHandle,
};
use crate::errors::{FloeError, Result};

const QUEUE_FAMILY: u32 = 0;
const COPY_ALIGNMENT: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

fn device_error(err: impl std::fmt::Display) -> FloeError {
    FloeError::Device(err.to_string())
}

fn texture_format(format: Format) -> wgpu::TextureFormat {
    match format {
        Format::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        Format::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        Format::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
        Format::Depth32Float => wgpu::TextureFormat::Depth32Float,
    }
}

fn buffer_usages(usage: BufferUsages) -> wgpu::BufferUsages {
    let mut out = wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
    for (ours, theirs) in [
        (BufferUsages::UNIFORM, wgpu::BufferUsages::UNIFORM),
        (BufferUsages::STORAGE, wgpu::BufferUsages::STORAGE),
        (BufferUsages::INDEX, wgpu::BufferUsages::INDEX),
        (BufferUsages::VERTEX, wgpu::BufferUsages::VERTEX),
        (BufferUsages::INDIRECT, wgpu::BufferUsages::INDIRECT),
    ] {
        if usage.contains(ours) {
            out |= theirs;
        }
    }
    out
}

fn texture_usages(usage: ImageUsages) -> wgpu::TextureUsages {
    let mut out = wgpu::TextureUsages::empty();
    if usage.contains(ImageUsages::TRANSFER_DST) {
        out |= wgpu::TextureUsages::COPY_DST;
    }
    if usage.contains(ImageUsages::SAMPLED) {
        out |= wgpu::TextureUsages::TEXTURE_BINDING;
    }
    if usage.intersects(ImageUsages::COLOR_ATTACHMENT | ImageUsages::DEPTH_STENCIL_ATTACHMENT) {
        out |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    out
}

// ============================================================================
// Resource Records
// ============================================================================

struct MemoryRecord {
    size: u64,
    type_index: u32,
    mapped: bool,
}

struct BufferRecord {
    buffer: wgpu::Buffer,
    size: u64,
    address: u64,
    memory: Option<MemoryHandle>,
    shadow: Vec<u8>,
    dirty: bool,
}

struct ImageRecord {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    extent: Extent2d,
    format: Format,
}

struct PipelineRecord {
    kind: PipelineKind,
    bindings: Vec<u32>,
}

enum PipelineKind {
    Compute(wgpu::ComputePipeline),
    Render(wgpu::RenderPipeline),
}

struct SwapchainRecord {
    images: Vec<ImageHandle>,
    extent: Extent2d,
    next: u32,
}

/// Pipeline and buffer bindings active while replaying one command buffer.
#[derive(Default)]
struct Bound {
    compute: Option<PipelineHandle>,
    graphics: Option<PipelineHandle>,
    vertex: Option<BufferHandle>,
    index: Option<BufferHandle>,
    target: Option<ImageHandle>,
}

// ============================================================================
// Device
// ============================================================================

/// [`GpuDevice`] over a `wgpu` device and queue.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    memory_types: [MemoryType; 3],
    surface_extent: Extent2d,
    swapchain_image_count: u32,

    memories: FxHashMap<u32, MemoryRecord>,
    buffers: FxHashMap<u32, BufferRecord>,
    images: FxHashMap<u32, ImageRecord>,
    views: FxHashMap<u32, wgpu::TextureView>,
    samplers: FxHashMap<u32, wgpu::Sampler>,
    pipelines: FxHashMap<PipelineHandle, PipelineRecord>,
    descriptors: FxHashMap<(u32, u32), DescriptorResource>,
    semaphores: FxHashMap<u32, bool>,
    fences: FxHashMap<u32, bool>,
    swapchains: FxHashMap<u32, SwapchainRecord>,

    next_id: u32,
    next_address: u64,
}

impl WgpuDevice {
    /// Open the default adapter with indirect-count draws enabled.
    pub fn new(surface_extent: Extent2d) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(device_error)?;

        let mut required_features = wgpu::Features::MULTI_DRAW_INDIRECT_COUNT;
        if !adapter.features().contains(required_features) {
            return Err(FloeError::Device(format!(
                "adapter '{}' lacks indirect-count draws",
                adapter.get_info().name
            )));
        }
        required_features |= adapter.features() & wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("floe device"),
            required_features,
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(device_error)?;

        log::info!(
            "wgpu device: {} ({:?}), surface {}x{}",
            adapter.get_info().name,
            adapter.get_info().backend,
            surface_extent.width,
            surface_extent.height
        );

        let host = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
        Ok(Self {
            device,
            queue,
            memory_types: [
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: host,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL | host,
                    heap_index: 0,
                },
            ],
            surface_extent,
            swapchain_image_count: 3,
            memories: FxHashMap::default(),
            buffers: FxHashMap::default(),
            images: FxHashMap::default(),
            views: FxHashMap::default(),
            samplers: FxHashMap::default(),
            pipelines: FxHashMap::default(),
            descriptors: FxHashMap::default(),
            semaphores: FxHashMap::default(),
            fences: FxHashMap::default(),
            swapchains: FxHashMap::default(),
            next_id: 1,
            next_address: 0x1_0000,
        })
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    #[must_use]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[must_use]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Report a new surface size; the next acquire returns out-of-date.
    pub fn resize(&mut self, extent: Extent2d) {
        self.surface_extent = extent;
    }

    /// Register a compute pipeline reading the given global-set bindings.
    pub fn register_compute_pipeline(&mut self, pipeline: wgpu::ComputePipeline, bindings: &[u32]) -> PipelineHandle {
        let handle = PipelineHandle(self.next_id());
        self.pipelines.insert(
            handle,
            PipelineRecord {
                kind: PipelineKind::Compute(pipeline),
                bindings: bindings.to_vec(),
            },
        );
        handle
    }

    /// Register a render pipeline reading the given global-set bindings.
    pub fn register_render_pipeline(&mut self, pipeline: wgpu::RenderPipeline, bindings: &[u32]) -> PipelineHandle {
        let handle = PipelineHandle(self.next_id());
        self.pipelines.insert(
            handle,
            PipelineRecord {
                kind: PipelineKind::Render(pipeline),
                bindings: bindings.to_vec(),
            },
        );
        handle
    }

    /// The offscreen texture behind a swapchain image.
    #[must_use]
    pub fn texture(&self, image: ImageHandle) -> Option<&wgpu::Texture> {
        self.images.get(&image.0).map(|record| &record.texture)
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    fn buffer(&self, buffer: BufferHandle) -> Result<&BufferRecord> {
        self.buffers
            .get(&buffer.0)
            .ok_or_else(|| FloeError::Device(format!("unknown buffer {}", buffer.0)))
    }

    fn image(&self, image: ImageHandle) -> Result<&ImageRecord> {
        self.images
            .get(&image.0)
            .ok_or_else(|| FloeError::Device(format!("unknown image {}", image.0)))
    }

    fn pipeline(&self, pipeline: PipelineHandle) -> Result<&PipelineRecord> {
        self.pipelines
            .get(&pipeline)
            .ok_or_else(|| FloeError::Device(format!("unknown pipeline {}", pipeline.0)))
    }

    fn mapped_range(&self, buffer: BufferHandle, offset: u64, len: u64) -> Result<(usize, usize)> {
        let record = self.buffer(buffer)?;
        let memory = record
            .memory
            .and_then(|memory| self.memories.get(&memory.0))
            .ok_or_else(|| FloeError::Device(format!("buffer {} has no memory bound", buffer.0)))?;
        if !memory.mapped {
            return Err(FloeError::Device(format!("buffer {} is not host mapped", buffer.0)));
        }
        if offset + len > record.size {
            return Err(FloeError::Device(format!(
                "mapped range {offset}..{} exceeds buffer size {}",
                offset + len,
                record.size
            )));
        }
        Ok((offset as usize, (offset + len) as usize))
    }

    fn bind_group(&self, pipeline: PipelineHandle) -> Result<Option<wgpu::BindGroup>> {
        let record = self.pipeline(pipeline)?;
        if record.bindings.is_empty() {
            return Ok(None);
        }
        let mut entries = Vec::with_capacity(record.bindings.len());
        for &binding in &record.bindings {
            let Some(DescriptorResource::Buffer { buffer, offset, size }) = self.descriptors.get(&(binding, 0)) else {
                return Err(FloeError::Device(format!("binding {binding} has no buffer bound")));
            };
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &self.buffer(*buffer)?.buffer,
                    offset: *offset,
                    size: NonZeroU64::new(*size),
                }),
            });
        }
        let layout = match &record.kind {
            PipelineKind::Compute(pipeline) => pipeline.get_bind_group_layout(0),
            PipelineKind::Render(pipeline) => pipeline.get_bind_group_layout(0),
        };
        Ok(Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("floe global set"),
            layout: &layout,
            entries: &entries,
        })))
    }

    // ========================================================================
    // Replay
    // ========================================================================

    fn upload_shadows(&mut self) {
        for record in self.buffers.values_mut().filter(|record| record.dirty) {
            self.queue.write_buffer(&record.buffer, 0, &record.shadow);
            record.dirty = false;
        }
    }

    fn write_texture_from_shadow(&self, src: BufferHandle, dst: ImageHandle, offset: u64, extent: Extent2d) -> Result<()> {
        let image = self.image(dst)?;
        let row = extent.width * image.format.bytes_per_pixel();
        let len = u64::from(row) * u64::from(extent.height);
        let (start, end) = self.mapped_range(src, offset, len)?;
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &image.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &self.buffer(src)?.shadow[start..end],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(row),
                rows_per_image: Some(extent.height),
            },
            wgpu::Extent3d {
                width: extent.width,
                height: extent.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn encode(&self, encoder: &mut wgpu::CommandEncoder, command: &Command, bound: &mut Bound) -> Result<()> {
        match *command {
            Command::CopyBuffer { src, dst, region } => {
                encoder.copy_buffer_to_buffer(
                    &self.buffer(src)?.buffer,
                    region.src_offset,
                    &self.buffer(dst)?.buffer,
                    region.dst_offset,
                    region.size.next_multiple_of(COPY_ALIGNMENT),
                );
            }
            // Replayed through the queue before the encoder is submitted.
            Command::CopyBufferToImage { .. } => {}
            Command::FillBuffer {
                buffer,
                offset,
                size,
                value,
            } => {
                if value != 0 {
                    return Err(FloeError::Device(format!("wgpu can only clear buffers to zero, got {value:#x}")));
                }
                encoder.clear_buffer(&self.buffer(buffer)?.buffer, offset, Some(size));
            }
            Command::BufferBarrier(_) => {}
            Command::ImageBarrier(barrier) => {
                if barrier.new_layout == ImageLayout::ColorAttachment {
                    bound.target = Some(barrier.image);
                }
            }
            Command::BindComputePipeline(pipeline) => bound.compute = Some(pipeline),
            Command::BindGraphicsPipeline(pipeline) => bound.graphics = Some(pipeline),
            Command::BindVertexBuffer(buffer) => bound.vertex = Some(buffer),
            Command::BindIndexBuffer(buffer) => bound.index = Some(buffer),
            Command::Dispatch { x, y, z } => {
                let handle = bound
                    .compute
                    .ok_or_else(|| FloeError::Device("dispatch without a bound compute pipeline".into()))?;
                let PipelineKind::Compute(pipeline) = &self.pipeline(handle)?.kind else {
                    return Err(FloeError::Device(format!("pipeline {} is not a compute pipeline", handle.0)));
                };
                let bind_group = self.bind_group(handle)?;
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("floe cull"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(pipeline);
                if let Some(group) = &bind_group {
                    pass.set_bind_group(0, group, &[]);
                }
                pass.dispatch_workgroups(x, y, z);
            }
            Command::DrawIndexedIndirectCount {
                buffer,
                offset,
                count_buffer,
                count_offset,
                max_draw_count,
                ..
            } => {
                let handle = bound
                    .graphics
                    .ok_or_else(|| FloeError::Device("draw without a bound graphics pipeline".into()))?;
                let PipelineKind::Render(pipeline) = &self.pipeline(handle)?.kind else {
                    return Err(FloeError::Device(format!("pipeline {} is not a render pipeline", handle.0)));
                };
                let target = bound
                    .target
                    .ok_or_else(|| FloeError::Device("draw without a colour attachment".into()))?;
                let vertex = bound
                    .vertex
                    .ok_or_else(|| FloeError::Device("draw without a bound vertex buffer".into()))?;
                let index = bound
                    .index
                    .ok_or_else(|| FloeError::Device("draw without a bound index buffer".into()))?;
                let bind_group = self.bind_group(handle)?;

                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("floe scene"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &self.image(target)?.view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                            store: wgpu::StoreOp::Store,
                        },
                        depth_slice: None,
                    })],
                    ..Default::default()
                });
                pass.set_pipeline(pipeline);
                if let Some(group) = &bind_group {
                    pass.set_bind_group(0, group, &[]);
                }
                pass.set_vertex_buffer(0, self.buffer(vertex)?.buffer.slice(..));
                pass.set_index_buffer(self.buffer(index)?.buffer.slice(..), wgpu::IndexFormat::Uint32);
                pass.multi_draw_indexed_indirect_count(
                    &self.buffer(buffer)?.buffer,
                    offset,
                    &self.buffer(count_buffer)?.buffer,
                    count_offset,
                    max_draw_count,
                );
            }
        }
        Ok(())
    }

    fn wait_queue(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map(|_| ())
            .map_err(device_error)
    }
}

impl GpuDevice for WgpuDevice {
    fn memory_types(&self) -> &[MemoryType] {
        &self.memory_types
    }

    fn queue_families(&self) -> QueueFamilies {
        QueueFamilies {
            graphics: QUEUE_FAMILY,
            transfer: QUEUE_FAMILY,
        }
    }

    fn surface_extent(&self) -> Extent2d {
        self.surface_extent
    }

    // ------------------------------------------------------------------------
    // Buffers & Memory
    // ------------------------------------------------------------------------

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle> {
        if desc.size == 0 {
            return Err(FloeError::Device(format!("buffer '{}' has zero size", desc.label)));
        }
        let size = desc.size.next_multiple_of(COPY_ALIGNMENT);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size,
            usage: buffer_usages(desc.usage),
            mapped_at_creation: false,
        });
        let id = self.next_id();
        let address = self.next_address;
        self.next_address += size.next_multiple_of(0x1_0000) + 0x1_0000;
        self.buffers.insert(
            id,
            BufferRecord {
                buffer,
                size: desc.size,
                address,
                memory: None,
                shadow: Vec::new(),
                dirty: false,
            },
        );
        Ok(BufferHandle(id))
    }

    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> Result<MemoryRequirements> {
        Ok(MemoryRequirements {
            size: self.buffer(buffer)?.size.next_multiple_of(COPY_ALIGNMENT),
            alignment: 256,
            type_bits: 0b111,
        })
    }

    fn allocate_memory(
        &mut self,
        size: u64,
        memory_type_index: u32,
        _dedicated: Option<ImageHandle>,
    ) -> Result<MemoryHandle> {
        if memory_type_index as usize >= self.memory_types.len() {
            return Err(FloeError::Device(format!("no memory type {memory_type_index}")));
        }
        let id = self.next_id();
        self.memories.insert(
            id,
            MemoryRecord {
                size,
                type_index: memory_type_index,
                mapped: false,
            },
        );
        Ok(MemoryHandle(id))
    }

    fn bind_buffer_memory(&mut self, buffer: BufferHandle, memory: MemoryHandle, _offset: u64) -> Result<()> {
        if !self.memories.contains_key(&memory.0) {
            return Err(FloeError::Device(format!("unknown memory {}", memory.0)));
        }
        let record = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| FloeError::Device(format!("unknown buffer {}", buffer.0)))?;
        record.memory = Some(memory);
        Ok(())
    }

    fn buffer_device_address(&self, buffer: BufferHandle) -> Result<u64> {
        Ok(self.buffer(buffer)?.address)
    }

    fn map_memory(&mut self, memory: MemoryHandle) -> Result<()> {
        let record = self
            .memories
            .get_mut(&memory.0)
            .ok_or_else(|| FloeError::Device(format!("unknown memory {}", memory.0)))?;
        let flags = self.memory_types[record.type_index as usize].property_flags;
        if !flags.contains(MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(FloeError::Device(format!(
                "memory {} ({} bytes) is not host visible",
                memory.0, record.size
            )));
        }
        record.mapped = true;
        for buffer in self.buffers.values_mut().filter(|buffer| buffer.memory == Some(memory)) {
            buffer.shadow.resize(buffer.size.next_multiple_of(COPY_ALIGNMENT) as usize, 0);
        }
        Ok(())
    }

    fn mapped_bytes(&self, buffer: BufferHandle, offset: u64, len: u64) -> Result<&[u8]> {
        let (start, end) = self.mapped_range(buffer, offset, len)?;
        Ok(&self.buffer(buffer)?.shadow[start..end])
    }

    fn mapped_bytes_mut(&mut self, buffer: BufferHandle, offset: u64, len: u64) -> Result<&mut [u8]> {
        let (start, end) = self.mapped_range(buffer, offset, len)?;
        let record = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| FloeError::Device(format!("unknown buffer {}", buffer.0)))?;
        record.dirty = true;
        Ok(&mut record.shadow[start..end])
    }

    // ------------------------------------------------------------------------
    // Images
    // ------------------------------------------------------------------------

    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<ImageHandle> {
        if desc.extent.is_empty() {
            return Err(FloeError::Device(format!("image '{}' has an empty extent", desc.label)));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.extent.width,
                height: desc.extent.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(desc.format),
            usage: texture_usages(desc.usage),
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = self.next_id();
        self.images.insert(
            id,
            ImageRecord {
                texture,
                view,
                extent: desc.extent,
                format: desc.format,
            },
        );
        Ok(ImageHandle(id))
    }

    fn image_memory_requirements(&self, image: ImageHandle) -> Result<MemoryRequirements> {
        let record = self.image(image)?;
        let size = u64::from(record.extent.width)
            * u64::from(record.extent.height)
            * u64::from(record.format.bytes_per_pixel());
        Ok(MemoryRequirements {
            size: size.next_multiple_of(256),
            alignment: 256,
            type_bits: 0b111,
        })
    }

    fn bind_image_memory(&mut self, image: ImageHandle, memory: MemoryHandle, _offset: u64) -> Result<()> {
        if !self.memories.contains_key(&memory.0) {
            return Err(FloeError::Device(format!("unknown memory {}", memory.0)));
        }
        self.image(image).map(|_| ())
    }

    fn create_image_view(&mut self, image: ImageHandle) -> Result<ImageViewHandle> {
        let view = self
            .image(image)?
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let id = self.next_id();
        self.views.insert(id, view);
        Ok(ImageViewHandle(id))
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle> {
        let address_mode = match desc.address_mode {
            super::AddressMode::Repeat => wgpu::AddressMode::Repeat,
            super::AddressMode::MirroredRepeat => wgpu::AddressMode::MirrorRepeat,
            super::AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
            super::AddressMode::ClampToBorder => wgpu::AddressMode::ClampToBorder,
        };
        let border_color = if desc.address_mode == super::AddressMode::ClampToBorder {
            if !self.device.features().contains(wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER) {
                return Err(FloeError::Device("adapter lacks clamp-to-border samplers".into()));
            }
            Some(match desc.border {
                super::BorderColor::TransparentBlack => wgpu::SamplerBorderColor::TransparentBlack,
                super::BorderColor::OpaqueBlack => wgpu::SamplerBorderColor::OpaqueBlack,
                super::BorderColor::OpaqueWhite => wgpu::SamplerBorderColor::OpaqueWhite,
            })
        } else {
            None
        };
        let filter = if desc.linear {
            wgpu::FilterMode::Linear
        } else {
            wgpu::FilterMode::Nearest
        };
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("floe sampler"),
            address_mode_u: address_mode,
            address_mode_v: address_mode,
            address_mode_w: address_mode,
            mag_filter: filter,
            min_filter: filter,
            border_color,
            ..Default::default()
        });
        let id = self.next_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(record) = self.buffers.remove(&buffer.0) {
            record.buffer.destroy();
        }
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        if let Some(record) = self.images.remove(&image.0) {
            record.texture.destroy();
        }
    }

    fn destroy_image_view(&mut self, view: ImageViewHandle) {
        self.views.remove(&view.0);
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn free_memory(&mut self, memory: MemoryHandle) {
        self.memories.remove(&memory.0);
    }

    // ------------------------------------------------------------------------
    // Synchronisation
    // ------------------------------------------------------------------------

    fn create_semaphore(&mut self) -> Result<SemaphoreHandle> {
        let id = self.next_id();
        self.semaphores.insert(id, false);
        Ok(SemaphoreHandle(id))
    }

    fn create_fence(&mut self, signaled: bool) -> Result<FenceHandle> {
        let id = self.next_id();
        self.fences.insert(id, signaled);
        Ok(FenceHandle(id))
    }

    fn wait_for_fence(&mut self, fence: FenceHandle) -> Result<()> {
        match self.fences.get(&fence.0) {
            Some(true) => self.wait_queue(),
            Some(false) => Err(FloeError::FenceNeverSignaled(fence.0)),
            None => Err(FloeError::Device(format!("unknown fence {}", fence.0))),
        }
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> Result<()> {
        let signaled = self
            .fences
            .get_mut(&fence.0)
            .ok_or_else(|| FloeError::Device(format!("unknown fence {}", fence.0)))?;
        *signaled = false;
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.wait_queue()
    }

    // ------------------------------------------------------------------------
    // Work
    // ------------------------------------------------------------------------

    fn submit(&mut self, queue_family: u32, submit: &SubmitInfo<'_>) -> Result<()> {
        if queue_family != QUEUE_FAMILY {
            return Err(FloeError::Device(format!("no queue family {queue_family}")));
        }
        if let Some((semaphore, _)) = submit.wait {
            match self.semaphores.get_mut(&semaphore.0) {
                Some(signaled) if *signaled => *signaled = false,
                _ => return Err(FloeError::SemaphoreNeverSignaled(semaphore.0)),
            }
        }

        self.upload_shadows();
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("floe submission"),
            });
        for buffer in submit.command_buffers {
            let mut bound = Bound::default();
            for command in buffer.commands() {
                if let Command::CopyBufferToImage { src, dst, region } = *command {
                    self.write_texture_from_shadow(src, dst, region.buffer_offset, region.extent)?;
                }
                self.encode(&mut encoder, command, &mut bound)?;
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        if let Some(semaphore) = submit.signal {
            self.semaphores.insert(semaphore.0, true);
        }
        if let Some(fence) = submit.fence {
            self.fences.insert(fence.0, true);
        }
        Ok(())
    }

    fn update_descriptors(&mut self, writes: &[DescriptorWrite]) -> Result<()> {
        for write in writes {
            self.descriptors
                .insert((write.binding, write.array_element), write.resource);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Presentation
    // ------------------------------------------------------------------------

    fn create_swapchain(
        &mut self,
        format: Format,
        extent: Extent2d,
        _old: Option<SwapchainHandle>,
    ) -> Result<SwapchainHandle> {
        let mut images = Vec::with_capacity(self.swapchain_image_count as usize);
        for _ in 0..self.swapchain_image_count {
            images.push(self.create_image(&ImageDesc {
                label: "swapchain image",
                format,
                extent,
                usage: ImageUsages::COLOR_ATTACHMENT | ImageUsages::SAMPLED,
            })?);
        }
        let id = self.next_id();
        self.swapchains.insert(
            id,
            SwapchainRecord {
                images,
                extent,
                next: 0,
            },
        );
        Ok(SwapchainHandle(id))
    }

    fn swapchain_images(&self, swapchain: SwapchainHandle) -> Result<&[ImageHandle]> {
        self.swapchains
            .get(&swapchain.0)
            .map(|record| record.images.as_slice())
            .ok_or_else(|| FloeError::Device(format!("unknown swapchain {}", swapchain.0)))
    }

    fn acquire_next_image(&mut self, swapchain: SwapchainHandle, signal: SemaphoreHandle) -> Result<u32> {
        let surface = self.surface_extent;
        let record = self
            .swapchains
            .get_mut(&swapchain.0)
            .ok_or_else(|| FloeError::Device(format!("unknown swapchain {}", swapchain.0)))?;
        if record.extent != surface {
            return Err(FloeError::SwapchainOutOfDate);
        }
        let index = record.next;
        record.next = (index + 1) % record.images.len() as u32;
        self.semaphores.insert(signal.0, true);
        Ok(index)
    }

    fn present(
        &mut self,
        swapchain: SwapchainHandle,
        wait: SemaphoreHandle,
        _image_index: u32,
    ) -> Result<PresentStatus> {
        self.semaphores.insert(wait.0, false);
        let record = self
            .swapchains
            .get(&swapchain.0)
            .ok_or_else(|| FloeError::Device(format!("unknown swapchain {}", swapchain.0)))?;
        if record.extent != self.surface_extent {
            return Err(FloeError::SwapchainOutOfDate);
        }
        Ok(PresentStatus::Optimal)
    }

    fn destroy_swapchain(&mut self, swapchain: SwapchainHandle) {
        if let Some(record) = self.swapchains.remove(&swapchain.0) {
            for image in record.images {
                self.destroy_image(image);
            }
        }
    }
}
