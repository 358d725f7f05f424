//! Visibility Culling
//!
//! The cull pass turns the frame's draw records into indirect draw commands.
//! One invocation per record: records whose mesh is resident and whose
//! origin survives the clip test append a [`DrawIndexedIndirect`] and bump
//! the shared count.
//!
//! Indirect buffer layout:
//!
//! ```text
//!  [ count: u32 ][ DrawIndexedIndirect; max_draws ]
//!    offset 0      offset 4, stride 20
//! ```
//!
//! [`cull_draws`] is the host reference of the pass; [`headless_kernel`]
//! wraps it as a compute kernel for the headless device.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::errors::{FloeError, Result};
use crate::renderer::draw::{DrawInfo, DRAW_INFO_SIZE, DRAW_LIST_HEADER_SIZE};
use crate::renderer::hal::{bindings, DrawIndexedIndirect, KernelContext};
use crate::renderer::resources::mesh::MeshHandle;

pub const INDIRECT_COUNT_OFFSET: u64 = 0;
pub const INDIRECT_COMMANDS_OFFSET: u64 = 4;
pub const INDIRECT_STRIDE: u32 = std::mem::size_of::<DrawIndexedIndirect>() as u32;

/// Bytes of an indirect buffer holding `max_draws` commands.
#[inline]
#[must_use]
pub fn indirect_buffer_size(max_draws: u32) -> u64 {
    INDIRECT_COMMANDS_OFFSET + u64::from(max_draws) * u64::from(INDIRECT_STRIDE)
}

/// Uniform block read by the cull pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Zeroable, Pod)]
pub struct CullParams {
    pub view_proj: Mat4,
    /// Zero disables the clip test; every resident mesh is drawn.
    pub enabled: u32,
    /// Clip-space slack added to the clip bounds around each object's
    /// projected origin, before the perspective divide.
    pub bounding_radius: f32,
    pub _pad: [u32; 2],
}

impl CullParams {
    #[must_use]
    pub fn new(view_proj: Mat4, bounding_radius: f32) -> Self {
        Self {
            view_proj,
            enabled: 1,
            bounding_radius,
            _pad: [0; 2],
        }
    }

    /// Parameters that draw everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            view_proj: Mat4::IDENTITY,
            enabled: 0,
            bounding_radius: 0.0,
            _pad: [0; 2],
        }
    }

    #[must_use]
    pub fn is_visible(&self, transform: &Mat4) -> bool {
        if self.enabled == 0 {
            return true;
        }
        let clip = self.view_proj * transform.w_axis.truncate().extend(1.0);
        inside_clip_volume(clip, self.bounding_radius)
    }
}

impl Default for CullParams {
    fn default() -> Self {
        Self::disabled()
    }
}

fn inside_clip_volume(clip: Vec4, slack: f32) -> bool {
    let limit = clip.w + slack;
    clip.x.abs() <= limit && clip.y.abs() <= limit && clip.z >= -slack && clip.z <= limit
}

/// Append an indirect command to `out` for every visible, resident draw.
///
/// `first_instance` carries the draw record index so the vertex stage can
/// fetch its transform.
pub fn cull_draws(
    params: &CullParams,
    draws: &[DrawInfo],
    handles: &[MeshHandle],
    out: &mut Vec<DrawIndexedIndirect>,
) {
    for (index, draw) in draws.iter().enumerate() {
        let Some(handle) = handles.get(draw.mesh_id as usize) else {
            continue;
        };
        if handle.index_count == 0 || !params.is_visible(&draw.transform) {
            continue;
        }
        out.push(DrawIndexedIndirect {
            index_count: handle.index_count,
            instance_count: 1,
            first_index: handle.first_index,
            vertex_offset: handle.vertex_offset,
            first_instance: index as u32,
        });
    }
}

/// Workgroups needed to cover `draw_count` records.
#[inline]
#[must_use]
pub fn group_count(draw_count: u32, workgroup_size: u32) -> u32 {
    draw_count.div_ceil(workgroup_size)
}

/// The cull pass as a headless compute kernel.
///
/// Only invocations inside the dispatched grid run, so an undersized
/// dispatch drops the tail of the draw list exactly like the device would.
pub fn headless_kernel(workgroup_size: u32) -> impl Fn(&mut KernelContext<'_>, [u32; 3]) -> Result<()> + 'static {
    move |ctx: &mut KernelContext<'_>, [x, y, z]: [u32; 3]| {
        let draw_bytes = ctx.read_binding(bindings::DRAW_INFO)?;
        let header = draw_bytes
            .get(..4)
            .ok_or_else(|| FloeError::Device("draw-info binding is smaller than its header".into()))?;
        let count = bytemuck::pod_read_unaligned::<u32>(header);
        let invocations = u64::from(x) * u64::from(y) * u64::from(z) * u64::from(workgroup_size);
        let active = u64::from(count).min(invocations) as usize;

        let draws: Vec<DrawInfo> = draw_bytes
            .get(DRAW_LIST_HEADER_SIZE as usize..)
            .unwrap_or_default()
            .chunks_exact(DRAW_INFO_SIZE as usize)
            .take(active)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        let handles = ctx.read_binding_as::<MeshHandle>(bindings::MESH_HANDLES, 0)?;
        let params = ctx
            .read_binding_as::<CullParams>(bindings::CULL_PARAMS, 0)?
            .first()
            .copied()
            .ok_or_else(|| FloeError::Device("cull params binding is empty".into()))?;

        let mut commands = Vec::new();
        cull_draws(&params, &draws, &handles, &mut commands);
        if commands.is_empty() {
            return Ok(());
        }

        let existing = ctx
            .read_binding_as::<u32>(bindings::INDIRECT, INDIRECT_COUNT_OFFSET as usize)?
            .first()
            .copied()
            .unwrap_or(0);
        ctx.write_binding(
            bindings::INDIRECT,
            INDIRECT_COMMANDS_OFFSET + u64::from(existing) * u64::from(INDIRECT_STRIDE),
            bytemuck::cast_slice(&commands),
        )?;
        let total = existing + commands.len() as u32;
        ctx.write_binding(bindings::INDIRECT, INDIRECT_COUNT_OFFSET, &total.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::resources::mesh::MeshId;
    use glam::Vec3;

    fn handle(vertex_offset: i32, first_index: u32, index_count: u32) -> MeshHandle {
        MeshHandle {
            vertex_offset,
            vertex_count: 4,
            first_index,
            index_count,
        }
    }

    #[test]
    fn disabled_culling_draws_every_resident_mesh() {
        let handles = [handle(0, 0, 12), handle(8, 12, 6)];
        let draws = [
            DrawInfo::new(MeshId(1), Mat4::IDENTITY),
            DrawInfo::new(MeshId(7), Mat4::IDENTITY),
            DrawInfo::new(MeshId(0), Mat4::IDENTITY),
        ];
        let mut out = Vec::new();
        cull_draws(&CullParams::disabled(), &draws, &handles, &mut out);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].first_index, 12);
        assert_eq!(out[0].vertex_offset, 8);
        assert_eq!(out[0].first_instance, 0);
        assert_eq!(out[1].index_count, 12);
        assert_eq!(out[1].first_instance, 2);
    }

    #[test]
    fn objects_outside_the_frustum_are_dropped() {
        let params = CullParams::new(Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.0, 10.0), 0.1);
        assert!(params.is_visible(&Mat4::from_translation(Vec3::new(0.5, 0.0, -5.0))));
        assert!(!params.is_visible(&Mat4::from_translation(Vec3::new(3.0, 0.0, -5.0))));
        assert!(!params.is_visible(&Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0))));
    }

    #[test]
    fn empty_handles_are_skipped() {
        let mut out = Vec::new();
        cull_draws(
            &CullParams::disabled(),
            &[DrawInfo::new(MeshId(0), Mat4::IDENTITY)],
            &[MeshHandle::default()],
            &mut out,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn group_count_rounds_up() {
        assert_eq!(group_count(0, 64), 0);
        assert_eq!(group_count(1, 64), 1);
        assert_eq!(group_count(65, 64), 2);
    }
}
