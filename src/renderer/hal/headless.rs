//! Headless Device
//!
//! A software [`GpuDevice`] that executes recorded commands on the host at
//! submit time. It keeps the explicit-API contracts observable:
//!
//! - Memory allocations are byte vectors; device-local memory is grown on
//!   first touch, host-visible memory is materialised when mapped.
//! - Waiting on a fence or semaphore nothing will signal is an error rather
//!   than a hang.
//! - Queue-family ownership is tracked per resource. Reading data on one
//!   family that was last written on another, without a matching
//!   release/acquire barrier pair, is a [`FloeError::QueueOwnership`].
//! - Compute pipelines are host kernels over the bound descriptors.
//!
//! Test hooks let callers reshape the memory type table, split or share the
//! queues, resize the surface and force out-of-date presentation results.

use rustc_hash::{FxHashMap, FxHashSet};

use super::command::{Command, DrawIndexedIndirect, QueueTransfer};
use super::{
    BufferDesc, BufferHandle, BufferUsages, DescriptorResource, DescriptorWrite, Extent2d,
    FenceHandle, Format, GpuDevice, ImageDesc, ImageHandle, ImageLayout, ImageUsages,
    ImageViewHandle, MemoryHandle, MemoryPropertyFlags, MemoryRequirements, MemoryType,
    PipelineHandle, PresentStatus, QueueFamilies, SamplerDesc, SamplerHandle, SemaphoreHandle,
    SubmitInfo, SwapchainHandle,
};
use crate::errors::{FloeError, Result};

pub const GRAPHICS_FAMILY: u32 = 0;
pub const TRANSFER_FAMILY: u32 = 1;

/// A host-side compute kernel standing in for a compute pipeline.
pub type ComputeKernel = Box<dyn Fn(&mut KernelContext<'_>, [u32; 3]) -> Result<()>>;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessConfig {
    pub memory_types: Vec<MemoryType>,
    pub separate_transfer_queue: bool,
    pub surface_extent: Extent2d,
    pub swapchain_image_count: u32,
    /// Total bytes the device will hand out before failing allocations.
    pub memory_budget: u64,
    pub buffer_alignment: u64,
    pub image_alignment: u64,
}

impl HeadlessConfig {
    fn with_types(flags: &[MemoryPropertyFlags]) -> Self {
        Self {
            memory_types: flags
                .iter()
                .map(|&property_flags| MemoryType {
                    property_flags,
                    heap_index: u32::from(!property_flags.contains(MemoryPropertyFlags::DEVICE_LOCAL)),
                })
                .collect(),
            separate_transfer_queue: false,
            surface_extent: Extent2d::new(1280, 720),
            swapchain_image_count: 3,
            memory_budget: 1 << 30,
            buffer_alignment: 256,
            image_alignment: 1024,
        }
    }

    /// Discrete GPU: device-local VRAM, system RAM, and a small BAR heap.
    #[must_use]
    pub fn discrete() -> Self {
        Self::with_types(&[
            MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
            MemoryPropertyFlags::DEVICE_LOCAL
                | MemoryPropertyFlags::HOST_VISIBLE
                | MemoryPropertyFlags::HOST_COHERENT,
        ])
    }

    /// Integrated GPU: every type is host visible.
    #[must_use]
    pub fn unified() -> Self {
        Self::with_types(&[
            MemoryPropertyFlags::DEVICE_LOCAL
                | MemoryPropertyFlags::HOST_VISIBLE
                | MemoryPropertyFlags::HOST_COHERENT,
            MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
        ])
    }

    /// No device-local memory at all.
    #[must_use]
    pub fn host_only() -> Self {
        Self::with_types(&[MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT])
    }

    #[must_use]
    pub fn with_separate_transfer_queue(mut self, separate: bool) -> Self {
        self.separate_transfer_queue = separate;
        self
    }

    #[must_use]
    pub fn with_surface_extent(mut self, extent: Extent2d) -> Self {
        self.surface_extent = extent;
        self
    }

    #[must_use]
    pub fn with_memory_budget(mut self, budget: u64) -> Self {
        self.memory_budget = budget;
        self
    }
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self::discrete()
    }
}

// ============================================================================
// Resource State
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Ownership {
    owner: Option<u32>,
    released_to: Option<u32>,
}

impl Ownership {
    fn check_read(&self, family: u32, what: &str) -> Result<()> {
        if let Some(dst) = self.released_to {
            return Err(FloeError::QueueOwnership(format!(
                "{what} read on family {family} after release to family {dst} without an acquire"
            )));
        }
        match self.owner {
            Some(owner) if owner != family => Err(FloeError::QueueOwnership(format!(
                "{what} written on family {owner} read on family {family}"
            ))),
            _ => Ok(()),
        }
    }

    fn written(&mut self, family: Option<u32>) {
        self.owner = family;
        self.released_to = None;
    }

    /// Applies a barrier's queue transfer. Returns `true` when the barrier
    /// completed an acquire on `family`.
    fn transfer(&mut self, family: u32, transfer: QueueTransfer, what: &str) -> Result<bool> {
        if transfer.src_family == transfer.dst_family {
            return Ok(false);
        }
        if family == transfer.src_family {
            if let Some(owner) = self.owner.filter(|&owner| owner != family) {
                return Err(FloeError::QueueOwnership(format!(
                    "{what} released by family {family} but owned by family {owner}"
                )));
            }
            self.released_to = Some(transfer.dst_family);
            Ok(false)
        } else if family == transfer.dst_family {
            if self.released_to != Some(family) {
                return Err(FloeError::QueueOwnership(format!(
                    "{what} acquired by family {family} without a matching release"
                )));
            }
            self.owner = Some(family);
            self.released_to = None;
            Ok(true)
        } else {
            Err(FloeError::QueueOwnership(format!(
                "{what} ownership barrier recorded on unrelated family {family}"
            )))
        }
    }
}

#[derive(Debug)]
struct Allocation {
    size: u64,
    type_index: u32,
    bytes: Vec<u8>,
    mapped: bool,
    dedicated: Option<ImageHandle>,
}

#[derive(Debug)]
struct BufferEntry {
    size: u64,
    usage: BufferUsages,
    binding: Option<(MemoryHandle, u64)>,
    address: u64,
    ownership: Ownership,
}

#[derive(Debug)]
struct ImageEntry {
    format: Format,
    extent: Extent2d,
    usage: ImageUsages,
    binding: Option<(MemoryHandle, u64)>,
    layout: ImageLayout,
    ownership: Ownership,
}

impl ImageEntry {
    fn byte_size(&self) -> u64 {
        u64::from(self.extent.width)
            * u64::from(self.extent.height)
            * u64::from(self.format.bytes_per_pixel())
    }
}

#[derive(Debug)]
struct SwapchainEntry {
    images: Vec<ImageHandle>,
    extent: Extent2d,
    next: u32,
}

/// One executed `DrawIndexedIndirectCount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedDraw {
    pub pipeline: PipelineHandle,
    pub draws: Vec<DrawIndexedIndirect>,
}

/// One executed queue submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub queue_family: u32,
    pub command_count: usize,
    pub wait: Option<SemaphoreHandle>,
    pub signal: Option<SemaphoreHandle>,
    pub fence: Option<FenceHandle>,
}

/// Everything commands and kernels can touch.
#[derive(Debug, Default)]
struct DeviceState {
    memories: FxHashMap<u32, Allocation>,
    buffers: FxHashMap<u32, BufferEntry>,
    images: FxHashMap<u32, ImageEntry>,
    views: FxHashMap<u32, ImageHandle>,
    descriptors: FxHashMap<(u32, u32), DescriptorResource>,
    draws: Vec<IssuedDraw>,
    allocated: u64,
}

fn out_of_range(what: &str, offset: u64, len: u64, size: u64) -> FloeError {
    FloeError::Device(format!(
        "{what} range {offset}..{} exceeds size {size}",
        offset.saturating_add(len)
    ))
}

impl DeviceState {
    fn memory(&self, memory: MemoryHandle) -> Result<&Allocation> {
        self.memories
            .get(&memory.0)
            .ok_or_else(|| FloeError::Device(format!("unknown memory {}", memory.0)))
    }

    fn buffer(&self, buffer: BufferHandle) -> Result<&BufferEntry> {
        self.buffers
            .get(&buffer.0)
            .ok_or_else(|| FloeError::Device(format!("unknown buffer {}", buffer.0)))
    }

    fn buffer_mut(&mut self, buffer: BufferHandle) -> Result<&mut BufferEntry> {
        self.buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| FloeError::Device(format!("unknown buffer {}", buffer.0)))
    }

    fn image(&self, image: ImageHandle) -> Result<&ImageEntry> {
        self.images
            .get(&image.0)
            .ok_or_else(|| FloeError::Device(format!("unknown image {}", image.0)))
    }

    fn image_mut(&mut self, image: ImageHandle) -> Result<&mut ImageEntry> {
        self.images
            .get_mut(&image.0)
            .ok_or_else(|| FloeError::Device(format!("unknown image {}", image.0)))
    }

    fn read_memory(&self, memory: MemoryHandle, offset: u64, len: u64) -> Result<Vec<u8>> {
        let alloc = self.memory(memory)?;
        if offset + len > alloc.size {
            return Err(out_of_range("memory read", offset, len, alloc.size));
        }
        let mut out = vec![0u8; len as usize];
        let start = (offset as usize).min(alloc.bytes.len());
        let end = ((offset + len) as usize).min(alloc.bytes.len());
        out[..end - start].copy_from_slice(&alloc.bytes[start..end]);
        Ok(out)
    }

    fn write_memory(&mut self, memory: MemoryHandle, offset: u64, data: &[u8]) -> Result<()> {
        let alloc = self
            .memories
            .get_mut(&memory.0)
            .ok_or_else(|| FloeError::Device(format!("unknown memory {}", memory.0)))?;
        let end = offset + data.len() as u64;
        if end > alloc.size {
            return Err(out_of_range("memory write", offset, data.len() as u64, alloc.size));
        }
        if alloc.bytes.len() < end as usize {
            alloc.bytes.resize(end as usize, 0);
        }
        alloc.bytes[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    /// Resolves a buffer range to its backing memory and absolute offset.
    fn buffer_range(&self, buffer: BufferHandle, offset: u64, len: u64) -> Result<(MemoryHandle, u64)> {
        let entry = self.buffer(buffer)?;
        if offset + len > entry.size {
            return Err(out_of_range("buffer", offset, len, entry.size));
        }
        let (memory, base) = entry
            .binding
            .ok_or_else(|| FloeError::Device(format!("buffer {} has no memory bound", buffer.0)))?;
        Ok((memory, base + offset))
    }

    fn read_buffer(&self, family: u32, buffer: BufferHandle, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.buffer(buffer)?
            .ownership
            .check_read(family, &format!("buffer {}", buffer.0))?;
        let (memory, at) = self.buffer_range(buffer, offset, len)?;
        self.read_memory(memory, at, len)
    }

    fn write_buffer(&mut self, family: u32, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let (memory, at) = self.buffer_range(buffer, offset, data.len() as u64)?;
        self.write_memory(memory, at, data)?;
        self.buffer_mut(buffer)?.ownership.written(Some(family));
        Ok(())
    }

    fn execute_copy_to_image(
        &mut self,
        family: u32,
        src: BufferHandle,
        dst: ImageHandle,
        buffer_offset: u64,
        extent: Extent2d,
    ) -> Result<()> {
        let image = self.image(dst)?;
        if !image.usage.contains(ImageUsages::TRANSFER_DST) {
            return Err(FloeError::Device(format!(
                "image {} was not created with TRANSFER_DST usage",
                dst.0
            )));
        }
        if image.layout != ImageLayout::TransferDst {
            return Err(FloeError::Device(format!(
                "copy into image {} in layout {:?}, expected TransferDst",
                dst.0, image.layout
            )));
        }
        if image.extent != extent {
            return Err(FloeError::Device(format!(
                "copy extent {extent:?} does not match image {} extent {:?}",
                dst.0, image.extent
            )));
        }
        let size = image.byte_size();
        let (memory, at) = image
            .binding
            .ok_or_else(|| FloeError::Device(format!("image {} has no memory bound", dst.0)))?;
        let texels = self.read_buffer(family, src, buffer_offset, size)?;
        self.write_memory(memory, at, &texels)?;
        self.image_mut(dst)?.ownership.written(Some(family));
        Ok(())
    }

    fn execute_image_barrier(&mut self, family: u32, barrier: &super::ImageBarrier) -> Result<()> {
        let entry = self.image_mut(barrier.image)?;
        if barrier.old_layout != ImageLayout::Undefined && barrier.old_layout != entry.layout {
            return Err(FloeError::Device(format!(
                "image {} transitioned from {:?} but is in {:?}",
                barrier.image.0, barrier.old_layout, entry.layout
            )));
        }
        match barrier.queue_transfer {
            Some(transfer) if transfer.src_family != transfer.dst_family => {
                // The layout change happens once, between release and acquire.
                if entry
                    .ownership
                    .transfer(family, transfer, &format!("image {}", barrier.image.0))?
                {
                    entry.layout = barrier.new_layout;
                }
            }
            _ => entry.layout = barrier.new_layout,
        }
        Ok(())
    }

    fn execute_draw(
        &mut self,
        family: u32,
        bound: &BoundState,
        indirect: (BufferHandle, u64),
        count: (BufferHandle, u64),
        max_draw_count: u32,
        stride: u32,
    ) -> Result<()> {
        let pipeline = bound
            .graphics
            .ok_or_else(|| FloeError::Device("draw without a bound graphics pipeline".into()))?;
        for (buffer, what) in [(bound.vertex, "vertex"), (bound.index, "index")] {
            let buffer = buffer.ok_or_else(|| FloeError::Device(format!("draw without a bound {what} buffer")))?;
            self.buffer(buffer)?
                .ownership
                .check_read(family, &format!("{what} buffer {}", buffer.0))?;
        }
        for resource in self.descriptors.values() {
            if let DescriptorResource::SampledImage { view, .. } = resource {
                if let Some(image) = self.views.get(&view.0) {
                    self.image(*image)?
                        .ownership
                        .check_read(family, &format!("sampled image {}", image.0))?;
                }
            }
        }

        let raw = self.read_buffer(family, count.0, count.1, 4)?;
        let draw_count = bytemuck::pod_read_unaligned::<u32>(&raw).min(max_draw_count);
        let stride = u64::from(stride);
        let bytes = self.read_buffer(family, indirect.0, indirect.1, u64::from(draw_count) * stride)?;
        let draws = bytes
            .chunks_exact(stride as usize)
            .map(|chunk| {
                bytemuck::pod_read_unaligned::<DrawIndexedIndirect>(
                    &chunk[..std::mem::size_of::<DrawIndexedIndirect>()],
                )
            })
            .collect();
        self.draws.push(IssuedDraw { pipeline, draws });
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BoundState {
    compute: Option<PipelineHandle>,
    graphics: Option<PipelineHandle>,
    vertex: Option<BufferHandle>,
    index: Option<BufferHandle>,
}

// ============================================================================
// Kernel Context
// ============================================================================

/// Descriptor-level access handed to a compute kernel during dispatch.
pub struct KernelContext<'a> {
    state: &'a mut DeviceState,
    family: u32,
}

impl KernelContext<'_> {
    fn binding(&self, binding: u32) -> Result<(BufferHandle, u64, u64)> {
        match self.state.descriptors.get(&(binding, 0)) {
            Some(DescriptorResource::Buffer { buffer, offset, size }) => Ok((*buffer, *offset, *size)),
            _ => Err(FloeError::Device(format!("binding {binding} has no buffer bound"))),
        }
    }

    /// Bytes of the buffer bound at `binding`.
    pub fn read_binding(&self, binding: u32) -> Result<Vec<u8>> {
        let (buffer, offset, size) = self.binding(binding)?;
        self.state.read_buffer(self.family, buffer, offset, size)
    }

    /// Elements of type `T` starting `byte_offset` into the buffer at `binding`.
    pub fn read_binding_as<T: bytemuck::Pod>(&self, binding: u32, byte_offset: usize) -> Result<Vec<T>> {
        let bytes = self.read_binding(binding)?;
        let tail = bytes.get(byte_offset..).unwrap_or_default();
        Ok(tail
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Write `data` at `offset` inside the buffer bound at `binding`.
    pub fn write_binding(&mut self, binding: u32, offset: u64, data: &[u8]) -> Result<()> {
        let (buffer, base, size) = self.binding(binding)?;
        if offset + data.len() as u64 > size {
            return Err(out_of_range("binding write", offset, data.len() as u64, size));
        }
        self.state.write_buffer(self.family, buffer, base + offset, data)
    }
}

// ============================================================================
// Device
// ============================================================================

/// Software implementation of [`GpuDevice`].
pub struct HeadlessDevice {
    config: HeadlessConfig,
    state: DeviceState,
    kernels: FxHashMap<PipelineHandle, ComputeKernel>,
    graphics_pipelines: FxHashSet<PipelineHandle>,
    samplers: FxHashMap<u32, SamplerDesc>,
    semaphores: FxHashMap<u32, bool>,
    fences: FxHashMap<u32, bool>,
    swapchains: FxHashMap<u32, SwapchainEntry>,
    surface_extent: Extent2d,
    forced_acquire_failures: u32,
    forced_present_failures: u32,
    submissions: Vec<SubmissionRecord>,
    presented: u64,
    next_id: u32,
    next_address: u64,
}

impl HeadlessDevice {
    #[must_use]
    pub fn new(config: HeadlessConfig) -> Self {
        log::info!(
            "Headless device: {} memory types, {} queue families, surface {}x{}",
            config.memory_types.len(),
            if config.separate_transfer_queue { 2 } else { 1 },
            config.surface_extent.width,
            config.surface_extent.height
        );
        Self {
            surface_extent: config.surface_extent,
            config,
            state: DeviceState::default(),
            kernels: FxHashMap::default(),
            graphics_pipelines: FxHashSet::default(),
            samplers: FxHashMap::default(),
            semaphores: FxHashMap::default(),
            fences: FxHashMap::default(),
            swapchains: FxHashMap::default(),
            forced_acquire_failures: 0,
            forced_present_failures: 0,
            submissions: Vec::new(),
            presented: 0,
            next_id: 1,
            next_address: 0x1_0000,
        }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn all_types(&self) -> u32 {
        (1u32 << self.config.memory_types.len()) - 1
    }

    // ========================================================================
    // Pipelines
    // ========================================================================

    /// Register a host kernel as a compute pipeline.
    pub fn register_compute_kernel(
        &mut self,
        kernel: impl Fn(&mut KernelContext<'_>, [u32; 3]) -> Result<()> + 'static,
    ) -> PipelineHandle {
        let handle = PipelineHandle(self.next_id());
        self.kernels.insert(handle, Box::new(kernel));
        handle
    }

    /// Register an opaque graphics pipeline; draws through it are logged.
    pub fn register_graphics_pipeline(&mut self) -> PipelineHandle {
        let handle = PipelineHandle(self.next_id());
        self.graphics_pipelines.insert(handle);
        handle
    }

    // ========================================================================
    // Test Hooks
    // ========================================================================

    pub fn set_surface_extent(&mut self, extent: Extent2d) {
        self.surface_extent = extent;
    }

    /// Make the next `count` acquires report an out-of-date swapchain.
    pub fn force_out_of_date_acquires(&mut self, count: u32) {
        self.forced_acquire_failures = count;
    }

    /// Make the next `count` presents report an out-of-date swapchain.
    pub fn force_out_of_date_presents(&mut self, count: u32) {
        self.forced_present_failures = count;
    }

    #[must_use]
    pub fn submissions(&self) -> &[SubmissionRecord] {
        &self.submissions
    }

    #[must_use]
    pub fn issued_draws(&self) -> &[IssuedDraw] {
        &self.state.draws
    }

    pub fn clear_logs(&mut self) {
        self.submissions.clear();
        self.state.draws.clear();
    }

    #[must_use]
    pub fn presented_count(&self) -> u64 {
        self.presented
    }

    /// Bytes currently allocated across all memory types.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.state.allocated
    }

    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.state.memories.len()
    }

    /// Memory type index backing `buffer`.
    #[must_use]
    pub fn buffer_memory_type(&self, buffer: BufferHandle) -> Option<u32> {
        let (memory, _) = self.state.buffers.get(&buffer.0)?.binding?;
        self.state.memories.get(&memory.0).map(|alloc| alloc.type_index)
    }

    /// Raw contents of a buffer, bypassing ownership checks.
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Result<Vec<u8>> {
        let size = self.state.buffer(buffer)?.size;
        let (memory, at) = self.state.buffer_range(buffer, 0, size)?;
        self.state.read_memory(memory, at, size)
    }

    /// `count` elements of `T` at `offset` inside `buffer`.
    pub fn read_buffer_as<T: bytemuck::Pod>(&self, buffer: BufferHandle, offset: u64, count: usize) -> Result<Vec<T>> {
        let len = (count * std::mem::size_of::<T>()) as u64;
        let (memory, at) = self.state.buffer_range(buffer, offset, len)?;
        Ok(self
            .state
            .read_memory(memory, at, len)?
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    pub fn image_contents(&self, image: ImageHandle) -> Result<Vec<u8>> {
        let entry = self.state.image(image)?;
        let (memory, at) = entry
            .binding
            .ok_or_else(|| FloeError::Device(format!("image {} has no memory bound", image.0)))?;
        self.state.read_memory(memory, at, entry.byte_size())
    }

    /// Description a live sampler was created with.
    #[must_use]
    pub fn sampler_desc(&self, sampler: SamplerHandle) -> Option<SamplerDesc> {
        self.samplers.get(&sampler.0).copied()
    }

    #[must_use]
    pub fn image_layout(&self, image: ImageHandle) -> Option<ImageLayout> {
        self.state.images.get(&image.0).map(|entry| entry.layout)
    }

    #[must_use]
    pub fn image_extent(&self, image: ImageHandle) -> Option<Extent2d> {
        self.state.images.get(&image.0).map(|entry| entry.extent)
    }

    /// Memory and offset an image is bound at.
    #[must_use]
    pub fn image_binding(&self, image: ImageHandle) -> Option<(MemoryHandle, u64)> {
        self.state.images.get(&image.0).and_then(|entry| entry.binding)
    }

    #[must_use]
    pub fn image_exists(&self, image: ImageHandle) -> bool {
        self.state.images.contains_key(&image.0)
    }

    #[must_use]
    pub fn descriptor(&self, binding: u32, array_element: u32) -> Option<DescriptorResource> {
        self.state.descriptors.get(&(binding, array_element)).copied()
    }

    #[must_use]
    pub fn is_fence_signaled(&self, fence: FenceHandle) -> bool {
        self.fences.get(&fence.0).copied().unwrap_or(false)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    fn check_family(&self, family: u32) -> Result<()> {
        let families = self.queue_families();
        if family == families.graphics || family == families.transfer {
            Ok(())
        } else {
            Err(FloeError::Device(format!("no queue family {family}")))
        }
    }

    fn consume_semaphore(&mut self, semaphore: SemaphoreHandle) -> Result<()> {
        match self.semaphores.get_mut(&semaphore.0) {
            Some(signaled) if *signaled => {
                *signaled = false;
                Ok(())
            }
            Some(_) => Err(FloeError::SemaphoreNeverSignaled(semaphore.0)),
            None => Err(FloeError::Device(format!("unknown semaphore {}", semaphore.0))),
        }
    }

    fn signal_semaphore(&mut self, semaphore: SemaphoreHandle) -> Result<()> {
        let signaled = self
            .semaphores
            .get_mut(&semaphore.0)
            .ok_or_else(|| FloeError::Device(format!("unknown semaphore {}", semaphore.0)))?;
        if *signaled {
            return Err(FloeError::Device(format!(
                "semaphore {} signaled twice without a wait",
                semaphore.0
            )));
        }
        *signaled = true;
        Ok(())
    }

    fn execute(&mut self, family: u32, command: &Command, bound: &mut BoundState) -> Result<()> {
        match *command {
            Command::CopyBuffer { src, dst, region } => {
                let data = self.state.read_buffer(family, src, region.src_offset, region.size)?;
                self.state.write_buffer(family, dst, region.dst_offset, &data)
            }
            Command::CopyBufferToImage { src, dst, region } => {
                self.state
                    .execute_copy_to_image(family, src, dst, region.buffer_offset, region.extent)
            }
            Command::FillBuffer {
                buffer,
                offset,
                size,
                value,
            } => {
                if size % 4 != 0 {
                    return Err(FloeError::Device(format!("fill size {size} is not a multiple of 4")));
                }
                let data: Vec<u8> = std::iter::repeat_n(value.to_le_bytes(), (size / 4) as usize)
                    .flatten()
                    .collect();
                self.state.write_buffer(family, buffer, offset, &data)
            }
            Command::BufferBarrier(barrier) => {
                let what = format!("buffer {}", barrier.buffer.0);
                // Validates the range even when no ownership moves.
                self.state.buffer_range(barrier.buffer, barrier.offset, barrier.size)?;
                if let Some(transfer) = barrier.queue_transfer {
                    self.state
                        .buffer_mut(barrier.buffer)?
                        .ownership
                        .transfer(family, transfer, &what)?;
                }
                Ok(())
            }
            Command::ImageBarrier(ref barrier) => self.state.execute_image_barrier(family, barrier),
            Command::BindComputePipeline(pipeline) => {
                bound.compute = Some(pipeline);
                Ok(())
            }
            Command::Dispatch { x, y, z } => {
                let pipeline = bound
                    .compute
                    .ok_or_else(|| FloeError::Device("dispatch without a bound compute pipeline".into()))?;
                let kernel = self
                    .kernels
                    .get(&pipeline)
                    .ok_or_else(|| FloeError::Device(format!("pipeline {} is not a compute kernel", pipeline.0)))?;
                let mut ctx = KernelContext {
                    state: &mut self.state,
                    family,
                };
                kernel(&mut ctx, [x, y, z])
            }
            Command::BindGraphicsPipeline(pipeline) => {
                if !self.graphics_pipelines.contains(&pipeline) {
                    return Err(FloeError::Device(format!(
                        "pipeline {} is not a graphics pipeline",
                        pipeline.0
                    )));
                }
                bound.graphics = Some(pipeline);
                Ok(())
            }
            Command::BindVertexBuffer(buffer) => {
                bound.vertex = Some(buffer);
                Ok(())
            }
            Command::BindIndexBuffer(buffer) => {
                bound.index = Some(buffer);
                Ok(())
            }
            Command::DrawIndexedIndirectCount {
                buffer,
                offset,
                count_buffer,
                count_offset,
                max_draw_count,
                stride,
            } => self.state.execute_draw(
                family,
                bound,
                (buffer, offset),
                (count_buffer, count_offset),
                max_draw_count,
                stride,
            ),
        }
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(HeadlessConfig::default())
    }
}

impl GpuDevice for HeadlessDevice {
    fn memory_types(&self) -> &[MemoryType] {
        &self.config.memory_types
    }

    fn queue_families(&self) -> QueueFamilies {
        QueueFamilies {
            graphics: GRAPHICS_FAMILY,
            transfer: if self.config.separate_transfer_queue {
                TRANSFER_FAMILY
            } else {
                GRAPHICS_FAMILY
            },
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
        let id = self.next_id();
        let address = self.next_address;
        self.next_address += desc.size.next_multiple_of(0x1_0000) + 0x1_0000;
        self.state.buffers.insert(
            id,
            BufferEntry {
                size: desc.size,
                usage: desc.usage,
                binding: None,
                address,
                ownership: Ownership::default(),
            },
        );
        Ok(BufferHandle(id))
    }

    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> Result<MemoryRequirements> {
        let entry = self.state.buffer(buffer)?;
        Ok(MemoryRequirements {
            size: entry.size.next_multiple_of(4),
            alignment: self.config.buffer_alignment,
            type_bits: self.all_types(),
        })
    }

    fn allocate_memory(
        &mut self,
        size: u64,
        memory_type_index: u32,
        dedicated: Option<ImageHandle>,
    ) -> Result<MemoryHandle> {
        if memory_type_index as usize >= self.config.memory_types.len() {
            return Err(FloeError::Device(format!("no memory type {memory_type_index}")));
        }
        if self.state.allocated + size > self.config.memory_budget {
            return Err(FloeError::OutOfDeviceMemory { requested: size });
        }
        let id = self.next_id();
        self.state.allocated += size;
        self.state.memories.insert(
            id,
            Allocation {
                size,
                type_index: memory_type_index,
                bytes: Vec::new(),
                mapped: false,
                dedicated,
            },
        );
        Ok(MemoryHandle(id))
    }

    fn bind_buffer_memory(&mut self, buffer: BufferHandle, memory: MemoryHandle, offset: u64) -> Result<()> {
        let alloc = self.state.memory(memory)?;
        let (alloc_size, dedicated) = (alloc.size, alloc.dedicated);
        let requirements = self.buffer_memory_requirements(buffer)?;
        if dedicated.is_some() {
            return Err(FloeError::Device(format!("memory {} is dedicated to an image", memory.0)));
        }
        if offset % requirements.alignment != 0 || offset + requirements.size > alloc_size {
            return Err(out_of_range("buffer binding", offset, requirements.size, alloc_size));
        }
        self.state.buffer_mut(buffer)?.binding = Some((memory, offset));
        Ok(())
    }

    fn buffer_device_address(&self, buffer: BufferHandle) -> Result<u64> {
        let entry = self.state.buffer(buffer)?;
        if !entry.usage.contains(BufferUsages::DEVICE_ADDRESS) {
            return Err(FloeError::Device(format!(
                "buffer {} was not created with DEVICE_ADDRESS usage",
                buffer.0
            )));
        }
        Ok(entry.address)
    }

    fn map_memory(&mut self, memory: MemoryHandle) -> Result<()> {
        let alloc = self
            .state
            .memories
            .get_mut(&memory.0)
            .ok_or_else(|| FloeError::Device(format!("unknown memory {}", memory.0)))?;
        let flags = self.config.memory_types[alloc.type_index as usize].property_flags;
        if !flags.contains(MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(FloeError::Device(format!(
                "memory {} (type {}) is not host visible",
                memory.0, alloc.type_index
            )));
        }
        alloc.bytes.resize(alloc.size as usize, 0);
        alloc.mapped = true;
        Ok(())
    }

    fn mapped_bytes(&self, buffer: BufferHandle, offset: u64, len: u64) -> Result<&[u8]> {
        let (memory, at) = self.state.buffer_range(buffer, offset, len)?;
        let alloc = self.state.memory(memory)?;
        if !alloc.mapped {
            return Err(FloeError::Device(format!("memory {} is not mapped", memory.0)));
        }
        Ok(&alloc.bytes[at as usize..(at + len) as usize])
    }

    fn mapped_bytes_mut(&mut self, buffer: BufferHandle, offset: u64, len: u64) -> Result<&mut [u8]> {
        let (memory, at) = self.state.buffer_range(buffer, offset, len)?;
        self.state.buffer_mut(buffer)?.ownership.written(None);
        let alloc = self
            .state
            .memories
            .get_mut(&memory.0)
            .ok_or_else(|| FloeError::Device(format!("unknown memory {}", memory.0)))?;
        if !alloc.mapped {
            return Err(FloeError::Device(format!("memory {} is not mapped", memory.0)));
        }
        Ok(&mut alloc.bytes[at as usize..(at + len) as usize])
    }

    // ------------------------------------------------------------------------
    // Images
    // ------------------------------------------------------------------------

    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<ImageHandle> {
        if desc.extent.is_empty() {
            return Err(FloeError::Device(format!("image '{}' has an empty extent", desc.label)));
        }
        let id = self.next_id();
        self.state.images.insert(
            id,
            ImageEntry {
                format: desc.format,
                extent: desc.extent,
                usage: desc.usage,
                binding: None,
                layout: ImageLayout::Undefined,
                ownership: Ownership::default(),
            },
        );
        Ok(ImageHandle(id))
    }

    fn image_memory_requirements(&self, image: ImageHandle) -> Result<MemoryRequirements> {
        let entry = self.state.image(image)?;
        let alignment = self.config.image_alignment;
        Ok(MemoryRequirements {
            size: entry.byte_size().next_multiple_of(alignment),
            alignment,
            type_bits: self.all_types(),
        })
    }

    fn bind_image_memory(&mut self, image: ImageHandle, memory: MemoryHandle, offset: u64) -> Result<()> {
        let requirements = self.image_memory_requirements(image)?;
        let alloc = self.state.memory(memory)?;
        if alloc.dedicated.is_some_and(|owner| owner != image) {
            return Err(FloeError::Device(format!(
                "memory {} is dedicated to another image",
                memory.0
            )));
        }
        if offset % requirements.alignment != 0 || offset + requirements.size > alloc.size {
            return Err(out_of_range("image binding", offset, requirements.size, alloc.size));
        }
        let entry = self.state.image_mut(image)?;
        if entry.binding.is_some() {
            return Err(FloeError::Device(format!("image {} is already bound", image.0)));
        }
        entry.binding = Some((memory, offset));
        Ok(())
    }

    fn create_image_view(&mut self, image: ImageHandle) -> Result<ImageViewHandle> {
        self.state.image(image)?;
        let id = self.next_id();
        self.state.views.insert(id, image);
        Ok(ImageViewHandle(id))
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle> {
        let id = self.next_id();
        self.samplers.insert(id, *desc);
        Ok(SamplerHandle(id))
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.state.buffers.remove(&buffer.0);
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        self.state.images.remove(&image.0);
    }

    fn destroy_image_view(&mut self, view: ImageViewHandle) {
        self.state.views.remove(&view.0);
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn free_memory(&mut self, memory: MemoryHandle) {
        if let Some(alloc) = self.state.memories.remove(&memory.0) {
            self.state.allocated -= alloc.size;
        }
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
            Some(true) => Ok(()),
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
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Work
    // ------------------------------------------------------------------------

    fn submit(&mut self, queue_family: u32, submit: &SubmitInfo<'_>) -> Result<()> {
        self.check_family(queue_family)?;
        if let Some(fence) = submit.fence {
            match self.fences.get(&fence.0) {
                Some(false) => {}
                Some(true) => {
                    return Err(FloeError::Device(format!(
                        "fence {} submitted while still signaled",
                        fence.0
                    )));
                }
                None => return Err(FloeError::Device(format!("unknown fence {}", fence.0))),
            }
        }
        if let Some((semaphore, _)) = submit.wait {
            self.consume_semaphore(semaphore)?;
        }

        let mut command_count = 0;
        for buffer in submit.command_buffers {
            if buffer.queue_family() != queue_family {
                return Err(FloeError::Device(format!(
                    "command buffer for family {} submitted to family {queue_family}",
                    buffer.queue_family()
                )));
            }
            let mut bound = BoundState::default();
            for command in buffer.commands() {
                self.execute(queue_family, command, &mut bound)?;
            }
            command_count += buffer.len();
        }

        if let Some(semaphore) = submit.signal {
            self.signal_semaphore(semaphore)?;
        }
        if let Some(fence) = submit.fence {
            self.fences.insert(fence.0, true);
        }
        log::trace!("Submission on family {queue_family}: {command_count} commands");
        self.submissions.push(SubmissionRecord {
            queue_family,
            command_count,
            wait: submit.wait.map(|(semaphore, _)| semaphore),
            signal: submit.signal,
            fence: submit.fence,
        });
        Ok(())
    }

    fn update_descriptors(&mut self, writes: &[DescriptorWrite]) -> Result<()> {
        for write in writes {
            match write.resource {
                DescriptorResource::Buffer { buffer, offset, size } => {
                    self.state.buffer_range(buffer, offset, size)?;
                }
                DescriptorResource::SampledImage { view, sampler } => {
                    if !self.state.views.contains_key(&view.0) || !self.samplers.contains_key(&sampler.0) {
                        return Err(FloeError::Device(format!(
                            "descriptor {}[{}] names a destroyed view or sampler",
                            write.binding, write.array_element
                        )));
                    }
                }
            }
            self.state
                .descriptors
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
        if extent.is_empty() {
            return Err(FloeError::Device("swapchain extent is empty".into()));
        }
        let mut images = Vec::with_capacity(self.config.swapchain_image_count as usize);
        for _ in 0..self.config.swapchain_image_count {
            images.push(self.create_image(&ImageDesc {
                label: "swapchain image",
                format,
                extent,
                usage: ImageUsages::COLOR_ATTACHMENT,
            })?);
        }
        let id = self.next_id();
        self.swapchains.insert(
            id,
            SwapchainEntry {
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
            .map(|entry| entry.images.as_slice())
            .ok_or_else(|| FloeError::Device(format!("unknown swapchain {}", swapchain.0)))
    }

    fn acquire_next_image(&mut self, swapchain: SwapchainHandle, signal: SemaphoreHandle) -> Result<u32> {
        if self.forced_acquire_failures > 0 {
            self.forced_acquire_failures -= 1;
            return Err(FloeError::SwapchainOutOfDate);
        }
        let surface = self.surface_extent;
        let entry = self
            .swapchains
            .get_mut(&swapchain.0)
            .ok_or_else(|| FloeError::Device(format!("unknown swapchain {}", swapchain.0)))?;
        if entry.extent != surface {
            return Err(FloeError::SwapchainOutOfDate);
        }
        let index = entry.next;
        entry.next = (index + 1) % entry.images.len() as u32;
        self.signal_semaphore(signal)?;
        Ok(index)
    }

    fn present(
        &mut self,
        swapchain: SwapchainHandle,
        wait: SemaphoreHandle,
        image_index: u32,
    ) -> Result<PresentStatus> {
        self.consume_semaphore(wait)?;
        if self.forced_present_failures > 0 {
            self.forced_present_failures -= 1;
            return Err(FloeError::SwapchainOutOfDate);
        }
        let entry = self
            .swapchains
            .get(&swapchain.0)
            .ok_or_else(|| FloeError::Device(format!("unknown swapchain {}", swapchain.0)))?;
        let image = *entry
            .images
            .get(image_index as usize)
            .ok_or_else(|| FloeError::Device(format!("no swapchain image {image_index}")))?;
        let layout = self.state.image(image)?.layout;
        if layout != ImageLayout::PresentSrc {
            return Err(FloeError::Device(format!(
                "presented image {image_index} is in layout {layout:?}, expected PresentSrc"
            )));
        }
        if entry.extent != self.surface_extent {
            return Err(FloeError::SwapchainOutOfDate);
        }
        self.presented += 1;
        Ok(PresentStatus::Optimal)
    }

    fn destroy_swapchain(&mut self, swapchain: SwapchainHandle) {
        if let Some(entry) = self.swapchains.remove(&swapchain.0) {
            for image in entry.images {
                self.state.images.remove(&image.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::hal::{AccessFlags, BufferBarrier, BufferCopy, CommandBuffer, PipelineStages};

    fn mapped_buffer(device: &mut HeadlessDevice, size: u64, type_index: u32) -> BufferHandle {
        let buffer = device
            .create_buffer(&BufferDesc {
                label: "test",
                size,
                usage: BufferUsages::TRANSFER_SRC | BufferUsages::TRANSFER_DST,
            })
            .unwrap();
        let requirements = device.buffer_memory_requirements(buffer).unwrap();
        let memory = device.allocate_memory(requirements.size, type_index, None).unwrap();
        device.bind_buffer_memory(buffer, memory, 0).unwrap();
        if type_index == 1 {
            device.map_memory(memory).unwrap();
        }
        buffer
    }

    #[test]
    fn waiting_on_unsignaled_fence_is_an_error() {
        let mut device = HeadlessDevice::default();
        let fence = device.create_fence(false).unwrap();
        assert!(matches!(
            device.wait_for_fence(fence),
            Err(FloeError::FenceNeverSignaled(_))
        ));
    }

    #[test]
    fn cross_family_read_without_acquire_is_rejected() {
        let mut device = HeadlessDevice::new(HeadlessConfig::discrete().with_separate_transfer_queue(true));
        let staging = mapped_buffer(&mut device, 64, 1);
        let target = mapped_buffer(&mut device, 64, 0);
        let sink = mapped_buffer(&mut device, 64, 0);

        let mut upload = CommandBuffer::new(TRANSFER_FAMILY);
        upload.copy_buffer(staging, target, BufferCopy { src_offset: 0, dst_offset: 0, size: 64 });
        device
            .submit(TRANSFER_FAMILY, &SubmitInfo { command_buffers: &[&upload], wait: None, signal: None, fence: None })
            .unwrap();

        let mut consume = CommandBuffer::new(GRAPHICS_FAMILY);
        consume.copy_buffer(target, sink, BufferCopy { src_offset: 0, dst_offset: 0, size: 64 });
        let result = device.submit(
            GRAPHICS_FAMILY,
            &SubmitInfo { command_buffers: &[&consume], wait: None, signal: None, fence: None },
        );
        assert!(matches!(result, Err(FloeError::QueueOwnership(_))));
    }

    #[test]
    fn release_acquire_pair_moves_ownership() {
        let mut device = HeadlessDevice::new(HeadlessConfig::discrete().with_separate_transfer_queue(true));
        let staging = mapped_buffer(&mut device, 64, 1);
        let target = mapped_buffer(&mut device, 64, 0);
        let sink = mapped_buffer(&mut device, 64, 0);
        let handoff = BufferBarrier {
            buffer: target,
            offset: 0,
            size: 64,
            src_stage: PipelineStages::TRANSFER,
            dst_stage: PipelineStages::TRANSFER,
            src_access: AccessFlags::TRANSFER_WRITE,
            dst_access: AccessFlags::TRANSFER_READ,
            queue_transfer: Some(QueueTransfer { src_family: TRANSFER_FAMILY, dst_family: GRAPHICS_FAMILY }),
        };

        let mut upload = CommandBuffer::new(TRANSFER_FAMILY);
        upload.copy_buffer(staging, target, BufferCopy { src_offset: 0, dst_offset: 0, size: 64 });
        upload.buffer_barrier(handoff);
        let mut consume = CommandBuffer::new(GRAPHICS_FAMILY);
        consume.buffer_barrier(handoff);
        consume.copy_buffer(target, sink, BufferCopy { src_offset: 0, dst_offset: 0, size: 64 });

        device
            .submit(TRANSFER_FAMILY, &SubmitInfo { command_buffers: &[&upload], wait: None, signal: None, fence: None })
            .unwrap();
        device
            .submit(GRAPHICS_FAMILY, &SubmitInfo { command_buffers: &[&consume], wait: None, signal: None, fence: None })
            .unwrap();
    }
}
