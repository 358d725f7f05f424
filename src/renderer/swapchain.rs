//! Swapchain
//!
//! Presentable images and their views. The per-image handle lists live in a
//! small host arena owned by the swapchain, which is reset and refilled on
//! every rebuild.

use crate::errors::Result;
use crate::memory::{ArenaSpan, HostArena, PAGE_SIZE};
use crate::renderer::hal::{Extent2d, Format, GpuDevice, ImageHandle, ImageViewHandle, SwapchainHandle};

const SWAPCHAIN_ARENA_RESERVE: usize = 16 * PAGE_SIZE;

#[derive(Debug)]
pub struct Swapchain {
    handle: SwapchainHandle,
    format: Format,
    extent: Extent2d,
    arena: HostArena,
    images: ArenaSpan<ImageHandle>,
    views: ArenaSpan<ImageViewHandle>,
    generation: u64,
}

impl Swapchain {
    /// Create a swapchain at the device's current surface extent.
    pub fn new<D: GpuDevice>(device: &mut D, format: Format) -> Result<Self> {
        let extent = device.surface_extent();
        let handle = device.create_swapchain(format, extent, None)?;
        let arena = HostArena::new(SWAPCHAIN_ARENA_RESERVE, PAGE_SIZE);
        let (images, views) = Self::populate(device, &arena, handle)?;
        log::info!(
            "Created swapchain: {} images at {}x{} ({format:?})",
            images.len(),
            extent.width,
            extent.height
        );
        Ok(Self {
            handle,
            format,
            extent,
            arena,
            images,
            views,
            generation: 0,
        })
    }

    fn populate<D: GpuDevice>(
        device: &mut D,
        arena: &HostArena,
        handle: SwapchainHandle,
    ) -> Result<(ArenaSpan<ImageHandle>, ArenaSpan<ImageViewHandle>)> {
        let images = arena.push_slice(device.swapchain_images(handle)?)?;
        let views = arena.push::<ImageViewHandle>(images.len())?;
        for index in 0..images.len() {
            let view = device.create_image_view(arena.get(images, index))?;
            arena.with_mut(views, |slots| slots[index] = view);
        }
        Ok((images, views))
    }

    /// Replace the swapchain with one at the current surface extent.
    ///
    /// The old swapchain is handed to the device as the predecessor, then its
    /// views and the chain itself are destroyed. The caller must make sure
    /// the device is idle.
    pub fn rebuild<D: GpuDevice>(&mut self, device: &mut D) -> Result<()> {
        let extent = device.surface_extent();
        let handle = device.create_swapchain(self.format, extent, Some(self.handle))?;

        for view in self.arena.to_vec(self.views) {
            device.destroy_image_view(view);
        }
        device.destroy_swapchain(self.handle);
        self.arena.reset();

        let (images, views) = Self::populate(device, &self.arena, handle)?;
        self.handle = handle;
        self.extent = extent;
        self.images = images;
        self.views = views;
        self.generation += 1;

        log::info!(
            "Rebuilt swapchain: {} images at {}x{}",
            images.len(),
            extent.width,
            extent.height
        );
        Ok(())
    }

    pub fn destroy<D: GpuDevice>(self, device: &mut D) {
        for view in self.arena.to_vec(self.views) {
            device.destroy_image_view(view);
        }
        device.destroy_swapchain(self.handle);
    }

    #[inline]
    #[must_use]
    pub fn handle(&self) -> SwapchainHandle {
        self.handle
    }

    #[inline]
    #[must_use]
    pub fn format(&self) -> Format {
        self.format
    }

    #[inline]
    #[must_use]
    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    #[inline]
    #[must_use]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn image(&self, index: usize) -> ImageHandle {
        self.arena.get(self.images, index)
    }

    #[must_use]
    pub fn view(&self, index: usize) -> ImageViewHandle {
        self.arena.get(self.views, index)
    }

    #[must_use]
    pub fn images(&self) -> Vec<ImageHandle> {
        self.arena.to_vec(self.images)
    }

    /// Number of rebuilds since creation.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
