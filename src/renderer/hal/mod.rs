//! Device Abstraction Layer
//!
//! The core never talks to a graphics API directly. [`GpuDevice`] is the
//! explicit, queue-aware surface it records and submits against:
//!
//! ```text
//!  ┌───────────────┐  create / bind / map   ┌──────────────────────┐
//!  │  floe core    │ ─────────────────────► │  impl GpuDevice      │
//!  │ (allocator,   │  CommandBuffer +       │  HeadlessDevice      │
//!  │  transfer,    │  SubmitInfo            │  WgpuDevice (feature)│
//!  │  frame)       │ ─────────────────────► │                      │
//!  └───────────────┘                        └──────────────────────┘
//! ```
//!
//! Handles are plain `u32` newtypes so they can be stored in host arenas
//! and device buffers without conversion.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::errors::Result;

pub mod command;
pub mod headless;
#[cfg(feature = "wgpu-backend")]
pub mod wgpu_device;

pub use command::{
    BufferBarrier, BufferCopy, BufferImageCopy, Command, CommandBuffer, DrawIndexedIndirect,
    ImageBarrier, QueueTransfer,
};
pub use headless::{HeadlessConfig, HeadlessDevice, IssuedDraw, KernelContext, SubmissionRecord};
#[cfg(feature = "wgpu-backend")]
pub use wgpu_device::WgpuDevice;

// ============================================================================
// Handles
// ============================================================================

macro_rules! define_handles {
    ($($(#[$meta:meta])* $name:ident;)*) => {$(
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Zeroable, Pod)]
        pub struct $name(pub u32);

        impl $name {
            /// Raw index value.
            #[inline]
            #[must_use]
            pub fn raw(self) -> u32 {
                self.0
            }
        }
    )*};
}

define_handles! {
    /// A device buffer.
    BufferHandle;
    /// A device image.
    ImageHandle;
    /// A view over an image.
    ImageViewHandle;
    /// A texture sampler.
    SamplerHandle;
    /// A device memory allocation.
    MemoryHandle;
    /// A binary semaphore ordering queue-to-queue work.
    SemaphoreHandle;
    /// A fence signalled when a submission retires.
    FenceHandle;
    /// A presentable image chain.
    SwapchainHandle;
    /// An opaque pipeline object supplied by the pipeline-construction layer.
    PipelineHandle;
}

// ============================================================================
// Flags
// ============================================================================

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct MemoryPropertyFlags: u32 {
        const DEVICE_LOCAL  = 1 << 0;
        const HOST_VISIBLE  = 1 << 1;
        const HOST_COHERENT = 1 << 2;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsages: u32 {
        const TRANSFER_SRC   = 1 << 0;
        const TRANSFER_DST   = 1 << 1;
        const UNIFORM        = 1 << 2;
        const STORAGE        = 1 << 3;
        const INDEX          = 1 << 4;
        const VERTEX         = 1 << 5;
        const INDIRECT       = 1 << 6;
        const DEVICE_ADDRESS = 1 << 7;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ImageUsages: u32 {
        const TRANSFER_DST             = 1 << 0;
        const SAMPLED                  = 1 << 1;
        const COLOR_ATTACHMENT         = 1 << 2;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 3;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE             = 1 << 0;
        const DRAW_INDIRECT           = 1 << 1;
        const VERTEX_SHADER           = 1 << 2;
        const FRAGMENT_SHADER         = 1 << 3;
        const EARLY_FRAGMENT_TESTS    = 1 << 4;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 5;
        const COMPUTE_SHADER          = 1 << 6;
        const TRANSFER                = 1 << 7;
        const BOTTOM_OF_PIPE          = 1 << 8;
        const ALL_COMMANDS            = 1 << 9;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const INDIRECT_COMMAND_READ          = 1 << 0;
        const INDEX_READ                     = 1 << 1;
        const UNIFORM_READ                   = 1 << 2;
        const SHADER_READ                    = 1 << 3;
        const SHADER_WRITE                   = 1 << 4;
        const COLOR_ATTACHMENT_WRITE         = 1 << 5;
        const DEPTH_STENCIL_ATTACHMENT_WRITE = 1 << 6;
        const TRANSFER_READ                  = 1 << 7;
        const TRANSFER_WRITE                 = 1 << 8;
        const HOST_WRITE                     = 1 << 9;
        const MEMORY_READ                    = 1 << 10;
    }
}

// ============================================================================
// Descriptions
// ============================================================================

/// One entry of the device's memory type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    /// Bit `i` set when memory type `i` may back the resource.
    pub type_bits: u32,
}

/// Queue family indices used for rendering and uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    /// Whether uploads run on a queue family distinct from rendering.
    #[inline]
    #[must_use]
    pub fn is_split(&self) -> bool {
        self.graphics != self.transfer
    }

    /// Ownership transfer from the transfer family to the graphics family,
    /// or `None` when both are the same family.
    #[inline]
    #[must_use]
    pub fn upload_handoff(&self) -> Option<QueueTransfer> {
        self.is_split().then_some(QueueTransfer {
            src_family: self.transfer,
            dst_family: self.graphics,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Extent2d {
    pub width: u32,
    pub height: u32,
}

impl Extent2d {
    #[inline]
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Texel formats the core creates images with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8UnormSrgb,
    Depth32Float,
}

impl Format {
    #[inline]
    #[must_use]
    pub fn bytes_per_pixel(self) -> u32 {
        4
    }

    #[inline]
    #[must_use]
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    #[default]
    Undefined,
    TransferDst,
    ShaderReadOnly,
    ColorAttachment,
    DepthAttachment,
    PresentSrc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: BufferUsages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc<'a> {
    pub label: &'a str,
    pub format: Format,
    pub extent: Extent2d,
    pub usage: ImageUsages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    /// Samples outside `[0, 1]` return [`SamplerDesc::border`].
    ClampToBorder,
}

/// Colour returned by `ClampToBorder` lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BorderColor {
    TransparentBlack,
    OpaqueBlack,
    #[default]
    OpaqueWhite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub address_mode: AddressMode,
    /// Only read when `address_mode` is `ClampToBorder`.
    pub border: BorderColor,
    pub linear: bool,
}

impl SamplerDesc {
    /// Linear sampler clamping to `border` outside the image.
    #[must_use]
    pub fn clamp_to_border(border: BorderColor) -> Self {
        Self {
            address_mode: AddressMode::ClampToBorder,
            border,
            linear: true,
        }
    }
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            address_mode: AddressMode::Repeat,
            border: BorderColor::OpaqueWhite,
            linear: true,
        }
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// Bindings of the global bindless descriptor set.
pub mod bindings {
    /// Current frame's draw-info buffer.
    pub const DRAW_INFO: u32 = 0;
    /// Sampled texture array, indexed by texture id.
    pub const TEXTURES: u32 = 1;
    /// Mesh handle directory.
    pub const MESH_HANDLES: u32 = 2;
    /// Indirect draw commands (count header + commands).
    pub const INDIRECT: u32 = 3;
    /// Cull pass parameters.
    pub const CULL_PARAMS: u32 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    },
    SampledImage {
        view: ImageViewHandle,
        sampler: SamplerHandle,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub array_element: u32,
    pub resource: DescriptorResource,
}

// ============================================================================
// Submission & Presentation
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct SubmitInfo<'a> {
    pub command_buffers: &'a [&'a CommandBuffer],
    pub wait: Option<(SemaphoreHandle, PipelineStages)>,
    pub signal: Option<SemaphoreHandle>,
    pub fence: Option<FenceHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    Suboptimal,
}

// ============================================================================
// Device Trait
// ============================================================================

/// An explicit graphics device.
///
/// Failing native calls surface as [`crate::errors::FloeError::Device`];
/// swapchain invalidation surfaces as
/// [`crate::errors::FloeError::SwapchainOutOfDate`].
pub trait GpuDevice {
    // --- Introspection ---
    fn memory_types(&self) -> &[MemoryType];
    fn queue_families(&self) -> QueueFamilies;
    fn surface_extent(&self) -> Extent2d;

    // --- Buffers & Memory ---
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle>;
    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> Result<MemoryRequirements>;
    /// Allocate `size` bytes from memory type `memory_type_index`.
    /// `dedicated` names the single image the allocation is made for.
    fn allocate_memory(
        &mut self,
        size: u64,
        memory_type_index: u32,
        dedicated: Option<ImageHandle>,
    ) -> Result<MemoryHandle>;
    fn bind_buffer_memory(&mut self, buffer: BufferHandle, memory: MemoryHandle, offset: u64) -> Result<()>;
    fn buffer_device_address(&self, buffer: BufferHandle) -> Result<u64>;
    /// Persistently map a host-visible allocation.
    fn map_memory(&mut self, memory: MemoryHandle) -> Result<()>;
    /// Host view of `len` bytes at `offset` inside a mapped buffer.
    fn mapped_bytes(&self, buffer: BufferHandle, offset: u64, len: u64) -> Result<&[u8]>;
    fn mapped_bytes_mut(&mut self, buffer: BufferHandle, offset: u64, len: u64) -> Result<&mut [u8]>;

    // --- Images ---
    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<ImageHandle>;
    fn image_memory_requirements(&self, image: ImageHandle) -> Result<MemoryRequirements>;
    fn bind_image_memory(&mut self, image: ImageHandle, memory: MemoryHandle, offset: u64) -> Result<()>;
    fn create_image_view(&mut self, image: ImageHandle) -> Result<ImageViewHandle>;
    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle>;

    // --- Teardown ---
    fn destroy_buffer(&mut self, buffer: BufferHandle);
    fn destroy_image(&mut self, image: ImageHandle);
    fn destroy_image_view(&mut self, view: ImageViewHandle);
    fn destroy_sampler(&mut self, sampler: SamplerHandle);
    fn free_memory(&mut self, memory: MemoryHandle);

    // --- Synchronisation ---
    fn create_semaphore(&mut self) -> Result<SemaphoreHandle>;
    fn create_fence(&mut self, signaled: bool) -> Result<FenceHandle>;
    fn wait_for_fence(&mut self, fence: FenceHandle) -> Result<()>;
    fn reset_fence(&mut self, fence: FenceHandle) -> Result<()>;
    fn wait_idle(&mut self) -> Result<()>;

    // --- Work ---
    fn submit(&mut self, queue_family: u32, submit: &SubmitInfo<'_>) -> Result<()>;
    fn update_descriptors(&mut self, writes: &[DescriptorWrite]) -> Result<()>;

    // --- Presentation ---
    fn create_swapchain(
        &mut self,
        format: Format,
        extent: Extent2d,
        old: Option<SwapchainHandle>,
    ) -> Result<SwapchainHandle>;
    fn swapchain_images(&self, swapchain: SwapchainHandle) -> Result<&[ImageHandle]>;
    /// Index of the next presentable image; `signal` is signalled when it
    /// becomes available.
    fn acquire_next_image(&mut self, swapchain: SwapchainHandle, signal: SemaphoreHandle) -> Result<u32>;
    fn present(
        &mut self,
        swapchain: SwapchainHandle,
        wait: SemaphoreHandle,
        image_index: u32,
    ) -> Result<PresentStatus>;
    fn destroy_swapchain(&mut self, swapchain: SwapchainHandle);
}
