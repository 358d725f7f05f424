//! Transfer Engine
//!
//! Batches pending mesh and texture uploads into one synchronous flush.
//!
//! ```text
//!  queue_mesh / queue_texture          flush
//!  ──────────────────────────►  ┌──────────────────────────────────┐
//!   header read eagerly         │ stage into the staging arena     │
//!   body read deferred          │ copy into mesh buffers / images  │
//!                               │ release ─► acquire (split queues)│
//!                               │ submit, wait fence, reset        │
//!                               └──────────────────────────────────┘
//! ```
//!
//! When the device has a dedicated transfer family, copies are recorded on
//! the transfer command buffer followed by release barriers, and matching
//! acquire barriers are recorded on the graphics command buffer. The
//! transfer submission signals a semaphore the graphics submission waits on.
//! With a single family everything is recorded once on the graphics buffer
//! and the ownership pair collapses to a plain barrier.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use crate::errors::{FloeError, Result};
use crate::memory::ScratchPool;
use crate::renderer::core::{DeviceAllocator, DeviceArena, DeviceSpan, MemoryClass};
use crate::renderer::hal::{
    AccessFlags, BufferBarrier, BufferCopy, BufferHandle, BufferImageCopy, BufferUsages,
    CommandBuffer, FenceHandle, GpuDevice, ImageBarrier, ImageLayout, PipelineStages,
    QueueFamilies, SemaphoreHandle, SubmitInfo,
};
use crate::renderer::resources::mesh::{MeshHandle, MeshHeader, MeshId, MeshStorage, HANDLE_SIZE, INDEX_SIZE, VERTEX_SIZE};
use crate::renderer::resources::texture::{
    attachment_layout, layout_barrier, set_image_layouts, TextureId, TextureKind, TextureRegistry,
};

/// One queued mesh upload. The header is already parsed; the body is read
/// straight into staging memory at flush time.
#[derive(Debug)]
pub struct MeshTransferRequest {
    pub id: MeshId,
    pub path: PathBuf,
    pub header: MeshHeader,
    reader: BufReader<File>,
}

/// One queued texture upload, filled in by the caller before the flush.
#[derive(Debug, Clone, Default)]
pub struct TextureTransferRequest {
    pub texture: TextureId,
    /// Tightly packed texels matching the texture's extent and format.
    pub pixels: Vec<u8>,
}

/// What a flush moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub meshes: u32,
    pub textures: u32,
    pub vertices: u32,
    pub indices: u32,
    /// Attachments moved to their initial layout.
    pub attachments: u32,
    pub staged_bytes: u64,
}

impl FlushStats {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct TransferEngine {
    staging: DeviceArena,
    families: QueueFamilies,
    meshes: Vec<MeshTransferRequest>,
    textures: Vec<TextureTransferRequest>,
    pending_vertices: u64,
    pending_indices: u64,
    transfer_cmd: CommandBuffer,
    graphics_cmd: CommandBuffer,
    transfer_done: SemaphoreHandle,
    fence: FenceHandle,
}

impl TransferEngine {
    pub fn new<D: GpuDevice>(device: &mut D, allocator: &DeviceAllocator, staging_size: u64) -> Result<Self> {
        let staging = DeviceArena::allocate(
            allocator,
            device,
            "upload staging",
            staging_size,
            BufferUsages::TRANSFER_SRC,
            MemoryClass::HostVisible,
        )?;
        let families = device.queue_families();
        Ok(Self {
            staging,
            families,
            meshes: Vec::new(),
            textures: Vec::new(),
            pending_vertices: 0,
            pending_indices: 0,
            transfer_cmd: CommandBuffer::new(families.transfer),
            graphics_cmd: CommandBuffer::new(families.graphics),
            transfer_done: device.create_semaphore()?,
            fence: device.create_fence(false)?,
        })
    }

    // ========================================================================
    // Queueing
    // ========================================================================

    /// Open `path`, read its header and queue the body for the next flush.
    ///
    /// The returned id is final: it is the index the mesh's handle will
    /// occupy once the flush lands.
    pub fn queue_mesh(&mut self, path: impl AsRef<Path>, storage: &MeshStorage) -> Result<MeshId> {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);
        let header = MeshHeader::read_from(&mut reader).map_err(|err| mesh_read_error(path, "header", err))?;

        storage.check_room(
            self.pending_vertices + u64::from(header.vertex_count),
            self.pending_indices + u64::from(header.index_count),
            self.meshes.len() as u64 + 1,
        )?;

        let id = MeshId(storage.handle_count() + self.meshes.len() as u32);
        self.pending_vertices += u64::from(header.vertex_count);
        self.pending_indices += u64::from(header.index_count);
        self.meshes.push(MeshTransferRequest {
            id,
            path: path.to_path_buf(),
            header,
            reader,
        });
        Ok(id)
    }

    /// Reserve a texture upload slot for the caller to fill.
    pub fn queue_texture(&mut self) -> &mut TextureTransferRequest {
        self.textures.push(TextureTransferRequest::default());
        let last = self.textures.len() - 1;
        &mut self.textures[last]
    }

    #[inline]
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.meshes.is_empty() || !self.textures.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn pending_meshes(&self) -> &[MeshTransferRequest] {
        &self.meshes
    }

    #[inline]
    #[must_use]
    pub fn pending_textures(&self) -> &[TextureTransferRequest] {
        &self.textures
    }

    /// Vertices and indices queued but not yet flushed.
    #[inline]
    #[must_use]
    pub fn pending_counts(&self) -> (u64, u64) {
        (self.pending_vertices, self.pending_indices)
    }

    #[inline]
    #[must_use]
    pub fn staging(&self) -> &DeviceArena {
        &self.staging
    }

    #[inline]
    #[must_use]
    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    // ========================================================================
    // Recording Helpers
    // ========================================================================

    fn upload_cmd(&mut self) -> &mut CommandBuffer {
        if self.families.is_split() {
            &mut self.transfer_cmd
        } else {
            &mut self.graphics_cmd
        }
    }

    /// Make `buffer[offset..offset + size]` visible to graphics-queue consumers.
    fn hand_off_buffer(
        &mut self,
        buffer: BufferHandle,
        span: DeviceSpan,
        dst_stage: PipelineStages,
        dst_access: AccessFlags,
    ) {
        if span.size == 0 {
            return;
        }
        let barrier = BufferBarrier {
            buffer,
            offset: span.offset,
            size: span.size,
            src_stage: PipelineStages::TRANSFER,
            dst_stage,
            src_access: AccessFlags::TRANSFER_WRITE,
            dst_access,
            queue_transfer: self.families.upload_handoff(),
        };
        if barrier.queue_transfer.is_some() {
            self.transfer_cmd.buffer_barrier(BufferBarrier {
                dst_stage: PipelineStages::BOTTOM_OF_PIPE,
                dst_access: AccessFlags::empty(),
                ..barrier
            });
            self.graphics_cmd.buffer_barrier(BufferBarrier {
                src_stage: PipelineStages::TOP_OF_PIPE,
                src_access: AccessFlags::empty(),
                ..barrier
            });
        } else {
            self.graphics_cmd.buffer_barrier(barrier);
        }
    }

    fn hand_off_image(&mut self, barrier: ImageBarrier) {
        let barrier = ImageBarrier {
            queue_transfer: self.families.upload_handoff(),
            ..barrier
        };
        if barrier.queue_transfer.is_some() {
            self.transfer_cmd.image_barrier(ImageBarrier {
                dst_stage: PipelineStages::BOTTOM_OF_PIPE,
                dst_access: AccessFlags::empty(),
                ..barrier
            });
            self.graphics_cmd.image_barrier(ImageBarrier {
                src_stage: PipelineStages::TOP_OF_PIPE,
                src_access: AccessFlags::empty(),
                ..barrier
            });
        } else {
            self.graphics_cmd.image_barrier(barrier);
        }
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Upload everything queued and block until the device has consumed it.
    ///
    /// Attachments created since the last flush are moved to their initial
    /// layout in the same graphics submission.
    pub fn flush<D: GpuDevice>(
        &mut self,
        device: &mut D,
        scratch: &ScratchPool,
        storage: &mut MeshStorage,
        textures: &mut TextureRegistry,
    ) -> Result<FlushStats> {
        if !self.has_pending() && !textures.has_pending_attachments() {
            return Ok(FlushStats::default());
        }

        let mut stats = FlushStats::default();
        let recorded = self
            .record_meshes(device, scratch, storage, &mut stats)
            .and_then(|()| self.record_textures(device, textures, &mut stats));
        if let Err(err) = recorded {
            log::error!("Transfer flush failed, discarding queued uploads: {err}");
            let orphaned = self.meshes.len() as u32;
            self.discard();
            self.retire_mesh_ids(device, storage, orphaned)?;
            return Err(err);
        }

        let attachments = textures.take_pending_attachments();
        for kind in [TextureKind::Color, TextureKind::Depth] {
            set_image_layouts(
                &mut self.graphics_cmd,
                attachments.iter().copied().filter(|&(_, k)| k == kind),
                ImageLayout::Undefined,
                attachment_layout(kind),
            );
        }
        stats.attachments = attachments.len() as u32;

        self.submit_and_wait(device)?;

        storage.commit(stats.vertices, stats.indices, stats.meshes);
        stats.staged_bytes = self.staging.cursor();
        self.discard();

        log::debug!(
            "Transfer flush: {} meshes ({} vertices, {} indices), {} textures, {} attachments, {} staged bytes",
            stats.meshes,
            stats.vertices,
            stats.indices,
            stats.textures,
            stats.attachments,
            stats.staged_bytes
        );
        Ok(stats)
    }

    fn record_meshes<D: GpuDevice>(
        &mut self,
        device: &mut D,
        scratch: &ScratchPool,
        storage: &MeshStorage,
        stats: &mut FlushStats,
    ) -> Result<()> {
        if self.meshes.is_empty() {
            return Ok(());
        }

        let vertex_bytes = self.pending_vertices * VERTEX_SIZE;
        let index_bytes = self.pending_indices * INDEX_SIZE;
        let handle_bytes = self.meshes.len() as u64 * HANDLE_SIZE;
        let vertex_region = self.staging.offset(vertex_bytes, 16)?;
        let index_region = self.staging.offset(index_bytes, 4)?;
        let handle_region = self.staging.offset(handle_bytes, 16)?;

        let arena = scratch.scratch();
        let handles = arena.push::<MeshHandle>(self.meshes.len())?;
        let (mut vertex_cursor, mut index_cursor) = (0u64, 0u64);
        for (slot, request) in self.meshes.iter_mut().enumerate() {
            let vertices = DeviceSpan {
                offset: vertex_region.offset + vertex_cursor,
                size: request.header.vertex_bytes(),
            };
            let indices = DeviceSpan {
                offset: index_region.offset + index_cursor,
                size: request.header.index_bytes(),
            };
            request
                .reader
                .read_exact(self.staging.host_bytes_mut(device, vertices)?)
                .map_err(|err| mesh_read_error(&request.path, "vertex data", err))?;
            request
                .reader
                .read_exact(self.staging.host_bytes_mut(device, indices)?)
                .map_err(|err| mesh_read_error(&request.path, "index data", err))?;

            let handle = MeshHandle {
                vertex_offset: (u64::from(storage.vertex_count()) + vertex_cursor / VERTEX_SIZE) as i32,
                vertex_count: request.header.vertex_count,
                first_index: storage.index_count() + (index_cursor / INDEX_SIZE) as u32,
                index_count: request.header.index_count,
            };
            arena.with_mut(handles, |out| out[slot] = handle);

            vertex_cursor += vertices.size;
            index_cursor += indices.size;
        }
        arena.with(handles, |out| self.staging.write(device, handle_region, out))?;

        let staging = self.staging.buffer().handle;
        let copies = [
            (
                storage.vertex_buffer().handle,
                vertex_region,
                u64::from(storage.vertex_count()) * VERTEX_SIZE,
                PipelineStages::VERTEX_SHADER,
                AccessFlags::SHADER_READ,
            ),
            (
                storage.index_buffer().handle,
                index_region,
                u64::from(storage.index_count()) * INDEX_SIZE,
                PipelineStages::VERTEX_SHADER,
                AccessFlags::INDEX_READ,
            ),
            (
                storage.handle_buffer().handle,
                handle_region,
                u64::from(storage.handle_count()) * HANDLE_SIZE,
                PipelineStages::COMPUTE_SHADER,
                AccessFlags::SHADER_READ,
            ),
        ];
        for (dst, region, dst_offset, _, _) in copies {
            if region.size == 0 {
                continue;
            }
            self.upload_cmd().copy_buffer(
                staging,
                dst,
                BufferCopy {
                    src_offset: region.offset,
                    dst_offset,
                    size: region.size,
                },
            );
        }
        for (dst, region, dst_offset, stage, access) in copies {
            self.hand_off_buffer(
                dst,
                DeviceSpan {
                    offset: dst_offset,
                    size: region.size,
                },
                stage,
                access,
            );
        }

        stats.meshes = self.meshes.len() as u32;
        stats.vertices = self.pending_vertices as u32;
        stats.indices = self.pending_indices as u32;
        Ok(())
    }

    fn record_textures<D: GpuDevice>(
        &mut self,
        device: &mut D,
        textures: &TextureRegistry,
        stats: &mut FlushStats,
    ) -> Result<()> {
        let requests = std::mem::take(&mut self.textures);
        for request in &requests {
            let texture = textures.require(request.texture)?;
            let expected = texture.upload_size();
            if request.pixels.len() != expected {
                return Err(FloeError::TextureDataMismatch {
                    id: request.texture.0,
                    expected,
                    actual: request.pixels.len(),
                });
            }

            let region = self.staging.offset(expected as u64, 16)?;
            self.staging.write(device, region, &request.pixels)?;

            let (image, kind) = (texture.image(), texture.kind());
            let staging = self.staging.buffer().handle;
            let cmd = self.upload_cmd();
            cmd.image_barrier(layout_barrier(image, kind, ImageLayout::Undefined, ImageLayout::TransferDst));
            cmd.copy_buffer_to_image(
                staging,
                image,
                BufferImageCopy {
                    buffer_offset: region.offset,
                    extent: texture.extent(),
                },
            );
            self.hand_off_image(layout_barrier(
                image,
                kind,
                ImageLayout::TransferDst,
                ImageLayout::ShaderReadOnly,
            ));
            stats.textures += 1;
        }
        self.textures = requests;
        Ok(())
    }

    /// Drop every queued request and rewind staging and both command buffers.
    fn discard(&mut self) {
        self.meshes.clear();
        self.textures.clear();
        self.pending_vertices = 0;
        self.pending_indices = 0;
        self.staging.reset();
        self.transfer_cmd.reset();
        self.graphics_cmd.reset();
    }

    /// Keep the ids of a discarded batch reserved as empty handles.
    ///
    /// Callers already hold those ids, so the slots are zeroed on the device
    /// and counted as resident; the cull pass skips handles with no indices.
    fn retire_mesh_ids<D: GpuDevice>(&mut self, device: &mut D, storage: &mut MeshStorage, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let span = DeviceSpan {
            offset: u64::from(storage.handle_count()) * HANDLE_SIZE,
            size: u64::from(count) * HANDLE_SIZE,
        };
        let handles = storage.handle_buffer().handle;
        self.graphics_cmd.fill_buffer(handles, span.offset, span.size, 0);
        self.graphics_cmd.buffer_barrier(BufferBarrier {
            buffer: handles,
            offset: span.offset,
            size: span.size,
            src_stage: PipelineStages::TRANSFER,
            dst_stage: PipelineStages::COMPUTE_SHADER,
            src_access: AccessFlags::TRANSFER_WRITE,
            dst_access: AccessFlags::SHADER_READ,
            queue_transfer: None,
        });
        let submitted = device
            .submit(
                self.families.graphics,
                &SubmitInfo {
                    command_buffers: &[&self.graphics_cmd],
                    wait: None,
                    signal: None,
                    fence: Some(self.fence),
                },
            )
            .and_then(|()| device.wait_for_fence(self.fence))
            .and_then(|()| device.reset_fence(self.fence));
        self.graphics_cmd.reset();
        submitted?;

        storage.commit(0, 0, count);
        log::warn!("Reserved {count} mesh ids from a discarded upload batch as empty meshes");
        Ok(())
    }

    fn submit_and_wait<D: GpuDevice>(&mut self, device: &mut D) -> Result<()> {
        if self.families.is_split() {
            device.submit(
                self.families.transfer,
                &SubmitInfo {
                    command_buffers: &[&self.transfer_cmd],
                    wait: None,
                    signal: Some(self.transfer_done),
                    fence: None,
                },
            )?;
            device.submit(
                self.families.graphics,
                &SubmitInfo {
                    command_buffers: &[&self.graphics_cmd],
                    wait: Some((self.transfer_done, PipelineStages::ALL_COMMANDS)),
                    signal: None,
                    fence: Some(self.fence),
                },
            )?;
        } else {
            device.submit(
                self.families.graphics,
                &SubmitInfo {
                    command_buffers: &[&self.graphics_cmd],
                    wait: None,
                    signal: None,
                    fence: Some(self.fence),
                },
            )?;
        }
        device.wait_for_fence(self.fence)?;
        device.reset_fence(self.fence)
    }
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("staging", &self.staging)
            .field("families", &self.families)
            .field("pending_meshes", &self.meshes.len())
            .field("pending_textures", &self.textures.len())
            .field("pending_vertices", &self.pending_vertices)
            .field("pending_indices", &self.pending_indices)
            .finish_non_exhaustive()
    }
}

fn mesh_read_error(path: &Path, what: &str, err: std::io::Error) -> FloeError {
    if err.kind() == ErrorKind::UnexpectedEof {
        FloeError::MeshFormat {
            path: path.display().to_string(),
            reason: format!("truncated {what}"),
        }
    } else {
        FloeError::Io(err)
    }
}
