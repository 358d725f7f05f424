//! Textures
//!
//! Textures are addressed by a dense [`TextureId`] that doubles as the
//! element index in the bindless texture array. Id 0 is reserved for the
//! null texture, so the first created texture gets id 1.
//!
//! Image memory comes from one of two places:
//! - the shared image [`DeviceArena`] (default), where images are placed
//!   back to back in a single allocation
//! - a dedicated allocation per image (`DEDICATED_ALLOCATION`)
//!
//! Window-relative textures track the surface extent and are rebuilt by
//! [`TextureRegistry::recreate_window_relative`].

use std::path::Path;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::errors::{FloeError, Result};
use crate::renderer::core::{DeviceAllocator, DeviceArena, DeviceSpan};
use crate::renderer::hal::{
    bindings, AccessFlags, CommandBuffer, DescriptorResource, DescriptorWrite, Extent2d, Format,
    GpuDevice, ImageBarrier, ImageDesc, ImageHandle, ImageLayout, ImageUsages, ImageViewHandle,
    MemoryHandle, PipelineStages, SamplerDesc, SamplerHandle,
};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct TextureUsage: u32 {
        const SHADER_READ       = 1 << 0;
        const RENDER_ATTACHMENT = 1 << 1;
        const TRANSFER_DST      = 1 << 2;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct TextureFlags: u32 {
        /// Give the image its own memory allocation.
        const DEDICATED_ALLOCATION = 1 << 0;
        /// Extent follows the presentation surface.
        const WINDOW_RELATIVE      = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureKind {
    #[default]
    Color,
    Depth,
}

/// Dense texture id; also the bindless array element.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Zeroable, Pod)]
pub struct TextureId(pub u32);

impl TextureId {
    pub const NULL: Self = Self(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub format: Format,
    /// Ignored for window-relative textures.
    pub extent: Extent2d,
    pub kind: TextureKind,
    pub usage: TextureUsage,
    pub flags: TextureFlags,
    pub sampler: SamplerDesc,
}

impl TextureDescriptor {
    /// A sampled texture filled by an upload.
    #[must_use]
    pub fn sampled(format: Format, extent: Extent2d) -> Self {
        Self {
            format,
            extent,
            kind: TextureKind::Color,
            usage: TextureUsage::SHADER_READ | TextureUsage::TRANSFER_DST,
            flags: TextureFlags::empty(),
            sampler: SamplerDesc::default(),
        }
    }

    /// A render target that follows the window size.
    #[must_use]
    pub fn window_target(format: Format) -> Self {
        Self {
            format,
            extent: Extent2d::default(),
            kind: if format.is_depth() {
                TextureKind::Depth
            } else {
                TextureKind::Color
            },
            usage: TextureUsage::RENDER_ATTACHMENT,
            flags: TextureFlags::WINDOW_RELATIVE,
            sampler: SamplerDesc::default(),
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: TextureFlags) -> Self {
        self.flags |= flags;
        self
    }

    #[must_use]
    pub fn with_usage(mut self, usage: TextureUsage) -> Self {
        self.usage |= usage;
        self
    }

    #[must_use]
    pub fn image_usages(&self) -> ImageUsages {
        let mut usages = ImageUsages::empty();
        if self.usage.contains(TextureUsage::SHADER_READ) {
            usages |= ImageUsages::SAMPLED;
        }
        if self.usage.contains(TextureUsage::TRANSFER_DST) {
            usages |= ImageUsages::TRANSFER_DST;
        }
        if self.usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            usages |= match self.kind {
                TextureKind::Color => ImageUsages::COLOR_ATTACHMENT,
                TextureKind::Depth => ImageUsages::DEPTH_STENCIL_ATTACHMENT,
            };
        }
        usages
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImagePlacement {
    Dedicated(MemoryHandle),
    Arena(DeviceSpan),
}

#[derive(Debug, Clone)]
pub struct Texture {
    image: ImageHandle,
    view: ImageViewHandle,
    sampler: Option<SamplerHandle>,
    descriptor: TextureDescriptor,
    extent: Extent2d,
    placement: ImagePlacement,
}

impl Texture {
    #[inline]
    #[must_use]
    pub fn image(&self) -> ImageHandle {
        self.image
    }

    #[inline]
    #[must_use]
    pub fn view(&self) -> ImageViewHandle {
        self.view
    }

    #[inline]
    #[must_use]
    pub fn sampler(&self) -> Option<SamplerHandle> {
        self.sampler
    }

    #[inline]
    #[must_use]
    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    #[inline]
    #[must_use]
    pub fn format(&self) -> Format {
        self.descriptor.format
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> TextureKind {
        self.descriptor.kind
    }

    #[inline]
    #[must_use]
    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.descriptor
    }

    #[inline]
    #[must_use]
    pub fn is_window_relative(&self) -> bool {
        self.descriptor.flags.contains(TextureFlags::WINDOW_RELATIVE)
    }

    #[inline]
    #[must_use]
    pub fn is_dedicated(&self) -> bool {
        matches!(self.placement, ImagePlacement::Dedicated(_))
    }

    /// Bytes of tightly packed pixel data an upload must supply.
    #[must_use]
    pub fn upload_size(&self) -> usize {
        self.extent.width as usize * self.extent.height as usize * self.format().bytes_per_pixel() as usize
    }
}

// ============================================================================
// Layout Helpers
// ============================================================================

/// Layout a render attachment of `kind` is kept in.
#[must_use]
pub fn attachment_layout(kind: TextureKind) -> ImageLayout {
    match kind {
        TextureKind::Color => ImageLayout::ColorAttachment,
        TextureKind::Depth => ImageLayout::DepthAttachment,
    }
}

/// Access mask and stage that use an image in `layout`.
#[must_use]
pub fn layout_access(layout: ImageLayout, kind: TextureKind) -> (AccessFlags, PipelineStages) {
    match layout {
        ImageLayout::Undefined | ImageLayout::PresentSrc => (AccessFlags::empty(), PipelineStages::BOTTOM_OF_PIPE),
        ImageLayout::TransferDst => (AccessFlags::TRANSFER_WRITE, PipelineStages::TRANSFER),
        ImageLayout::ShaderReadOnly => (AccessFlags::SHADER_READ, PipelineStages::FRAGMENT_SHADER),
        ImageLayout::ColorAttachment | ImageLayout::DepthAttachment => match kind {
            TextureKind::Color => (
                AccessFlags::COLOR_ATTACHMENT_WRITE,
                PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            ),
            TextureKind::Depth => (
                AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                PipelineStages::EARLY_FRAGMENT_TESTS,
            ),
        },
    }
}

/// Barrier moving `image` from `old` to `new`.
#[must_use]
pub fn layout_barrier(image: ImageHandle, kind: TextureKind, old: ImageLayout, new: ImageLayout) -> ImageBarrier {
    let (src_access, src_stage) = layout_access(old, kind);
    let (dst_access, dst_stage) = layout_access(new, kind);
    ImageBarrier {
        image,
        old_layout: old,
        new_layout: new,
        src_stage: if old == ImageLayout::Undefined {
            PipelineStages::TOP_OF_PIPE
        } else {
            src_stage
        },
        dst_stage,
        src_access,
        dst_access,
        queue_transfer: None,
    }
}

/// Record layout transitions for every image in `images`.
pub fn set_image_layouts(
    cmd: &mut CommandBuffer,
    images: impl IntoIterator<Item = (ImageHandle, TextureKind)>,
    old: ImageLayout,
    new: ImageLayout,
) {
    for (image, kind) in images {
        cmd.image_barrier(layout_barrier(image, kind, old, new));
    }
}

/// Decode an image file to tightly packed RGBA8.
pub fn decode_rgba8(path: impl AsRef<Path>) -> Result<(Extent2d, Vec<u8>)> {
    let decoded = image::open(path)?.into_rgba8();
    let (width, height) = decoded.dimensions();
    Ok((Extent2d::new(width, height), decoded.into_raw()))
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug)]
pub struct TextureRegistry {
    textures: Vec<Texture>,
    max_textures: u32,
    pending_descriptors: Vec<TextureId>,
    pending_attachments: Vec<TextureId>,
}

impl TextureRegistry {
    #[must_use]
    pub fn new(max_textures: u32) -> Self {
        Self {
            textures: Vec::new(),
            max_textures,
            pending_descriptors: Vec::new(),
            pending_attachments: Vec::new(),
        }
    }

    fn place_image<D: GpuDevice>(
        device: &mut D,
        allocator: &DeviceAllocator,
        arena: &mut DeviceArena,
        image: ImageHandle,
        dedicated: bool,
        previous: Option<DeviceSpan>,
    ) -> Result<ImagePlacement> {
        if dedicated {
            return Ok(ImagePlacement::Dedicated(
                allocator.allocate_image_dedicated(device, image)?,
            ));
        }
        if let Some(slot) = previous {
            if arena.bind_image_in(device, image, slot)? {
                return Ok(ImagePlacement::Arena(slot));
            }
        }
        Ok(ImagePlacement::Arena(arena.bind_image(device, image)?))
    }

    fn queue_updates(&mut self, id: TextureId, usage: TextureUsage) {
        if usage.contains(TextureUsage::SHADER_READ) {
            self.pending_descriptors.push(id);
        }
        if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            self.pending_attachments.push(id);
        }
    }

    /// Create the image, place its memory, and create its view and sampler.
    pub fn create<D: GpuDevice>(
        &mut self,
        device: &mut D,
        allocator: &DeviceAllocator,
        arena: &mut DeviceArena,
        desc: &TextureDescriptor,
    ) -> Result<TextureId> {
        let id = TextureId(self.textures.len() as u32 + 1);
        if id.0 >= self.max_textures {
            return Err(FloeError::CapacityExceeded {
                what: "texture",
                limit: u64::from(self.max_textures),
            });
        }

        let extent = if desc.flags.contains(TextureFlags::WINDOW_RELATIVE) {
            device.surface_extent()
        } else {
            desc.extent
        };
        let image = device.create_image(&ImageDesc {
            label: "texture",
            format: desc.format,
            extent,
            usage: desc.image_usages(),
        })?;
        let placement = Self::place_image(
            device,
            allocator,
            arena,
            image,
            desc.flags.contains(TextureFlags::DEDICATED_ALLOCATION),
            None,
        )?;
        let view = device.create_image_view(image)?;
        let sampler = if desc.usage.contains(TextureUsage::SHADER_READ) {
            Some(device.create_sampler(&desc.sampler)?)
        } else {
            None
        };

        self.textures.push(Texture {
            image,
            view,
            sampler,
            descriptor: *desc,
            extent,
            placement,
        });
        self.queue_updates(id, desc.usage);

        log::info!(
            "Created texture {}: {}x{} {:?} ({})",
            id.0,
            extent.width,
            extent.height,
            desc.format,
            if matches!(placement, ImagePlacement::Dedicated(_)) { "dedicated" } else { "arena" }
        );
        Ok(id)
    }

    /// Rebuild every window-relative texture at `extent`.
    ///
    /// Dedicated textures get a fresh dedicated allocation. Arena textures
    /// reuse their previous slot when the new image fits, otherwise they are
    /// placed at the arena cursor. Returns the number of textures rebuilt.
    pub fn recreate_window_relative<D: GpuDevice>(
        &mut self,
        device: &mut D,
        allocator: &DeviceAllocator,
        arena: &mut DeviceArena,
        extent: Extent2d,
    ) -> Result<usize> {
        let mut rebuilt = 0;
        for (index, texture) in self.textures.iter_mut().enumerate() {
            if !texture.is_window_relative() {
                continue;
            }

            device.destroy_image_view(texture.view);
            device.destroy_image(texture.image);
            let previous = match texture.placement {
                ImagePlacement::Dedicated(memory) => {
                    device.free_memory(memory);
                    None
                }
                ImagePlacement::Arena(slot) => Some(slot),
            };

            let desc = texture.descriptor;
            let image = device.create_image(&ImageDesc {
                label: "texture",
                format: desc.format,
                extent,
                usage: desc.image_usages(),
            })?;
            texture.placement = Self::place_image(
                device,
                allocator,
                arena,
                image,
                desc.flags.contains(TextureFlags::DEDICATED_ALLOCATION),
                previous,
            )?;
            texture.image = image;
            texture.view = device.create_image_view(image)?;
            texture.extent = extent;

            let id = TextureId(index as u32 + 1);
            if desc.usage.contains(TextureUsage::SHADER_READ) {
                self.pending_descriptors.push(id);
            }
            if desc.usage.contains(TextureUsage::RENDER_ATTACHMENT) {
                self.pending_attachments.push(id);
            }
            rebuilt += 1;
        }
        if rebuilt > 0 {
            log::info!(
                "Recreated {rebuilt} window-relative textures at {}x{}",
                extent.width,
                extent.height
            );
        }
        Ok(rebuilt)
    }

    /// Drain pending bindless descriptor writes.
    pub fn take_descriptor_writes(&mut self) -> Vec<DescriptorWrite> {
        let textures = &self.textures;
        self.pending_descriptors
            .drain(..)
            .filter_map(|id| {
                let texture = &textures[id.0 as usize - 1];
                texture.sampler.map(|sampler| DescriptorWrite {
                    binding: bindings::TEXTURES,
                    array_element: id.0,
                    resource: DescriptorResource::SampledImage {
                        view: texture.view,
                        sampler,
                    },
                })
            })
            .collect()
    }

    /// Drain render attachments still waiting for their initial layout.
    pub fn take_pending_attachments(&mut self) -> Vec<(ImageHandle, TextureKind)> {
        let textures = &self.textures;
        self.pending_attachments
            .drain(..)
            .map(|id| {
                let texture = &textures[id.0 as usize - 1];
                (texture.image, texture.kind())
            })
            .collect()
    }

    #[must_use]
    pub fn has_pending_attachments(&self) -> bool {
        !self.pending_attachments.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: TextureId) -> Option<&Texture> {
        (id.0 as usize).checked_sub(1).and_then(|index| self.textures.get(index))
    }

    pub fn require(&self, id: TextureId) -> Result<&Texture> {
        self.get(id).ok_or(FloeError::UnknownResource {
            kind: "texture",
            id: id.0,
        })
    }

    /// Live textures, excluding the null texture.
    #[must_use]
    pub fn len(&self) -> usize {
        self.textures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TextureId, &Texture)> {
        self.textures
            .iter()
            .enumerate()
            .map(|(index, texture)| (TextureId(index as u32 + 1), texture))
    }
}
