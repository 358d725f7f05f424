//! Frame Orchestration
//!
//! One call to [`Renderer::run_frame`] walks the frame states in order:
//!
//! ```text
//!  WaitPrevious ─► Acquire ─► Stage ─► Submit ─► Present ─► Rotate
//!                    │  ▲                          │
//!                    ▼  │ retry                    ▼
//!                   Resize ◄──────────── out of date / suboptimal
//! ```
//!
//! A single fence guards the frame submission. It is created signalled, waited
//! at `WaitPrevious`, and reset only once an image has been acquired, so a
//! rebuild triggered by a failed acquire never leaves it unsignalled.

use crate::errors::{FloeError, Result};
use crate::renderer::core::Buffer;
use crate::renderer::cull::{group_count, INDIRECT_COMMANDS_OFFSET, INDIRECT_COUNT_OFFSET, INDIRECT_STRIDE};
use crate::renderer::hal::{
    AccessFlags, BufferBarrier, Command, CommandBuffer, Extent2d, FenceHandle, GpuDevice, ImageBarrier,
    ImageHandle, ImageLayout, ImageViewHandle, PipelineHandle, PipelineStages, PresentStatus,
    SemaphoreHandle, SubmitInfo,
};
use crate::renderer::resources::mesh::MeshStorage;
use crate::renderer::transfer::FlushStats;
use crate::renderer::Renderer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrameState {
    #[default]
    Idle,
    WaitPrevious,
    Acquire,
    Stage,
    Submit,
    Present,
    Rotate,
    Resize,
}

/// Synchronisation objects shared by every frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    pub image_available: SemaphoreHandle,
    pub render_finished: SemaphoreHandle,
    pub in_flight: FenceHandle,
}

impl FrameSync {
    pub fn new<D: GpuDevice>(device: &mut D) -> Result<Self> {
        Ok(Self {
            image_available: device.create_semaphore()?,
            render_finished: device.create_semaphore()?,
            in_flight: device.create_fence(true)?,
        })
    }
}

/// Summary of one completed frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub image_index: u32,
    /// Swapchain rebuilds triggered by this frame.
    pub rebuilds: u32,
    pub draws: u32,
    pub cull_groups: u32,
    pub flush: FlushStats,
}

/// Compiled pipelines the frame binds, supplied by the pipeline layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendererPipelines {
    pub cull: PipelineHandle,
    pub draw: PipelineHandle,
}

// ============================================================================
// Render Recipes
// ============================================================================

/// Everything a recipe may reference while recording the draw part of a frame.
#[derive(Debug, Clone, Copy)]
pub struct RecipeContext<'a> {
    pub image: ImageHandle,
    pub view: ImageViewHandle,
    pub extent: Extent2d,
    pub image_index: u32,
    pub pipelines: &'a RendererPipelines,
    pub meshes: &'a MeshStorage,
    pub indirect: &'a Buffer,
    pub max_draws: u32,
}

impl RecipeContext<'_> {
    /// Bind the shared mesh buffers.
    pub fn bind_mesh_buffers(&self, cmd: &mut CommandBuffer) {
        cmd.push(Command::BindVertexBuffer(self.meshes.vertex_buffer().handle));
        cmd.push(Command::BindIndexBuffer(self.meshes.index_buffer().handle));
    }

    /// Issue the culled scene as one indirect draw.
    pub fn draw_scene(&self, cmd: &mut CommandBuffer) {
        cmd.push(Command::DrawIndexedIndirectCount {
            buffer: self.indirect.handle,
            offset: INDIRECT_COMMANDS_OFFSET,
            count_buffer: self.indirect.handle,
            count_offset: INDIRECT_COUNT_OFFSET,
            max_draw_count: self.max_draws,
            stride: INDIRECT_STRIDE,
        });
    }

    /// Transition the target image between layouts.
    pub fn transition_target(&self, cmd: &mut CommandBuffer, old: ImageLayout, new: ImageLayout) {
        let (src_stage, src_access) = match old {
            ImageLayout::ColorAttachment => (PipelineStages::COLOR_ATTACHMENT_OUTPUT, AccessFlags::COLOR_ATTACHMENT_WRITE),
            _ => (PipelineStages::TOP_OF_PIPE, AccessFlags::empty()),
        };
        let (dst_stage, dst_access) = match new {
            ImageLayout::ColorAttachment => (PipelineStages::COLOR_ATTACHMENT_OUTPUT, AccessFlags::COLOR_ATTACHMENT_WRITE),
            _ => (PipelineStages::BOTTOM_OF_PIPE, AccessFlags::empty()),
        };
        cmd.image_barrier(ImageBarrier {
            image: self.image,
            old_layout: old,
            new_layout: new,
            src_stage,
            dst_stage,
            src_access,
            dst_access,
            queue_transfer: None,
        });
    }
}

/// Records the application's rendering passes into a frame.
///
/// Called after the cull pass; the recipe must leave the target image in
/// [`ImageLayout::PresentSrc`].
pub trait RenderRecipe {
    fn record(&self, cmd: &mut CommandBuffer, ctx: &RecipeContext<'_>);
}

/// Draws the culled scene straight into the swapchain image.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndirectDrawRecipe;

impl RenderRecipe for IndirectDrawRecipe {
    fn record(&self, cmd: &mut CommandBuffer, ctx: &RecipeContext<'_>) {
        ctx.transition_target(cmd, ImageLayout::Undefined, ImageLayout::ColorAttachment);
        cmd.push(Command::BindGraphicsPipeline(ctx.pipelines.draw));
        ctx.bind_mesh_buffers(cmd);
        ctx.draw_scene(cmd);
        ctx.transition_target(cmd, ImageLayout::ColorAttachment, ImageLayout::PresentSrc);
    }
}

// ============================================================================
// Frame Loop
// ============================================================================

impl<D: GpuDevice> Renderer<D> {
    fn enter(&mut self, state: FrameState) {
        log::trace!("frame {}: {:?} -> {:?}", self.frame_count, self.state, state);
        self.state = state;
    }

    /// Run one full frame.
    pub fn run_frame(&mut self) -> Result<FrameReport> {
        let mut report = FrameReport::default();

        self.enter(FrameState::WaitPrevious);
        self.device.wait_for_fence(self.sync.in_flight)?;
        self.cull_params_buffer
            .write(&mut self.device, 0, std::slice::from_ref(&self.cull_params))?;

        self.enter(FrameState::Acquire);
        let image_index = loop {
            match self
                .device
                .acquire_next_image(self.swapchain.handle(), self.sync.image_available)
            {
                Ok(index) => break index,
                Err(err) if err.is_out_of_date() => {
                    if report.rebuilds >= self.settings.max_swapchain_rebuilds {
                        return Err(FloeError::SwapchainRebuildExhausted {
                            attempts: report.rebuilds,
                        });
                    }
                    report.rebuilds += 1;
                    self.on_resize()?;
                    self.enter(FrameState::Acquire);
                }
                Err(err) => return Err(err),
            }
        };
        report.image_index = image_index;

        self.enter(FrameState::Stage);
        report.flush = match self.stage() {
            Ok(flush) => flush,
            Err(err) => {
                self.return_image(image_index)?;
                self.enter(FrameState::Idle);
                return Err(err);
            }
        };

        self.enter(FrameState::Submit);
        report.draws = self.draw_infos.count();
        report.cull_groups = self.record_frame(image_index);
        let graphics = self.device.queue_families().graphics;
        self.device.reset_fence(self.sync.in_flight)?;
        self.device.submit(
            graphics,
            &SubmitInfo {
                command_buffers: &[&self.frame_commands[image_index as usize]],
                wait: Some((self.sync.image_available, PipelineStages::COLOR_ATTACHMENT_OUTPUT)),
                signal: Some(self.sync.render_finished),
                fence: Some(self.sync.in_flight),
            },
        )?;

        self.enter(FrameState::Present);
        match self
            .device
            .present(self.swapchain.handle(), self.sync.render_finished, image_index)
        {
            Ok(PresentStatus::Optimal) => {}
            Ok(PresentStatus::Suboptimal) => {
                report.rebuilds += 1;
                self.on_resize()?;
            }
            Err(err) if err.is_out_of_date() => {
                report.rebuilds += 1;
                self.on_resize()?;
            }
            Err(err) => return Err(err),
        }

        self.enter(FrameState::Rotate);
        self.draw_infos.rotate(&mut self.device)?;
        self.uniforms.rotate();
        self.frame_count += 1;
        self.enter(FrameState::Idle);
        Ok(report)
    }

    fn stage(&mut self) -> Result<FlushStats> {
        let mut writes = self.textures.take_descriptor_writes();
        writes.push(self.draw_infos.descriptor_write());
        self.device.update_descriptors(&writes)?;
        self.transfer
            .flush(&mut self.device, &self.scratch, &mut self.meshes, &mut self.textures)
    }

    /// Hand an acquired image back to the presentation engine unrendered.
    ///
    /// A layout-only submission consumes the acquire semaphore and re-signals
    /// the frame fence, so the next frame starts from the same state as after
    /// a completed one.
    fn return_image(&mut self, image_index: u32) -> Result<()> {
        let index = image_index as usize;
        let cmd = &mut self.frame_commands[index];
        cmd.reset();
        cmd.image_barrier(ImageBarrier {
            image: self.swapchain.image(index),
            old_layout: ImageLayout::Undefined,
            new_layout: ImageLayout::PresentSrc,
            src_stage: PipelineStages::TOP_OF_PIPE,
            dst_stage: PipelineStages::BOTTOM_OF_PIPE,
            src_access: AccessFlags::empty(),
            dst_access: AccessFlags::empty(),
            queue_transfer: None,
        });

        let graphics = self.device.queue_families().graphics;
        self.device.reset_fence(self.sync.in_flight)?;
        self.device.submit(
            graphics,
            &SubmitInfo {
                command_buffers: &[&self.frame_commands[index]],
                wait: Some((self.sync.image_available, PipelineStages::ALL_COMMANDS)),
                signal: Some(self.sync.render_finished),
                fence: Some(self.sync.in_flight),
            },
        )?;
        match self
            .device
            .present(self.swapchain.handle(), self.sync.render_finished, image_index)
        {
            Ok(PresentStatus::Optimal) => Ok(()),
            Ok(PresentStatus::Suboptimal) => self.on_resize(),
            Err(err) if err.is_out_of_date() => self.on_resize(),
            Err(err) => Err(err),
        }
    }

    /// Rebuild everything that depends on the surface extent.
    pub fn on_resize(&mut self) -> Result<()> {
        let resumed = self.state;
        self.enter(FrameState::Resize);
        self.device.wait_idle()?;

        let extent = self.device.surface_extent();
        self.textures.recreate_window_relative(
            &mut self.device,
            &self.allocator,
            &mut self.image_arena,
            extent,
        )?;
        self.swapchain.rebuild(&mut self.device)?;

        let graphics = self.device.queue_families().graphics;
        self.frame_commands = (0..self.swapchain.image_count())
            .map(|_| CommandBuffer::new(graphics))
            .collect();

        self.state = resumed;
        Ok(())
    }

    /// Record the frame's command stream for `image_index`. Returns the
    /// number of cull workgroups dispatched.
    fn record_frame(&mut self, image_index: u32) -> u32 {
        let index = image_index as usize;
        let mut cmd = std::mem::take(&mut self.frame_commands[index]);
        cmd.reset();

        self.uniforms.record_copy(&mut cmd);

        let indirect = BufferBarrier {
            buffer: self.indirect.handle,
            offset: 0,
            size: self.indirect.capacity,
            src_stage: PipelineStages::DRAW_INDIRECT,
            dst_stage: PipelineStages::TRANSFER,
            src_access: AccessFlags::empty(),
            dst_access: AccessFlags::TRANSFER_WRITE,
            queue_transfer: None,
        };
        cmd.buffer_barrier(indirect);
        cmd.fill_buffer(self.indirect.handle, INDIRECT_COUNT_OFFSET, 4, 0);
        cmd.buffer_barrier(BufferBarrier {
            src_stage: PipelineStages::TRANSFER,
            dst_stage: PipelineStages::COMPUTE_SHADER,
            src_access: AccessFlags::TRANSFER_WRITE,
            dst_access: AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
            ..indirect
        });

        let groups = group_count(self.draw_infos.count(), self.settings.cull_workgroup_size);
        if groups > 0 {
            cmd.dispatch(self.pipelines.cull, groups, 1, 1);
        }
        cmd.buffer_barrier(BufferBarrier {
            src_stage: PipelineStages::COMPUTE_SHADER,
            dst_stage: PipelineStages::DRAW_INDIRECT,
            src_access: AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
            dst_access: AccessFlags::INDIRECT_COMMAND_READ,
            ..indirect
        });

        let ctx = RecipeContext {
            image: self.swapchain.image(index),
            view: self.swapchain.view(index),
            extent: self.swapchain.extent(),
            image_index,
            pipelines: &self.pipelines,
            meshes: &self.meshes,
            indirect: &self.indirect,
            max_draws: self.settings.max_draws,
        };
        self.recipe.record(&mut cmd, &ctx);

        self.frame_commands[index] = cmd;
        groups
    }
}
