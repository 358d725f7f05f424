//! Frame Orchestrator Tests
//!
//! Tests for:
//! - Frame loop: fence handling, draw-list rotation, swapchain image cycling
//! - Presentation recovery: out-of-date acquire/present, bounded rebuilds, resize
//! - Cull pass: indirect commands built from mesh handles, frustum rejection
//! - Uniform staging: device addresses, per-slot lifetime, staging copies
//! - Texture loading from image files

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use glam::{Mat4, Vec3};

use floe::errors::FloeError;
use floe::memory::{ArenaSettings, PAGE_SIZE};
use floe::renderer::cull::{headless_kernel, CullParams};
use floe::renderer::draw::DrawInfo;
use floe::renderer::hal::{
    DescriptorResource, Extent2d, Format, GpuDevice, HeadlessConfig, HeadlessDevice, ImageLayout,
};
use floe::renderer::hal::bindings;
use floe::renderer::resources::{write_mesh_file, MeshId, TextureDescriptor, Vertex};
use floe::renderer::{FrameState, Renderer, RendererPipelines, RendererSettings};

static NEXT_FILE: AtomicU32 = AtomicU32::new(0);

fn temp_path(stem: &str, ext: &str) -> PathBuf {
    let n = NEXT_FILE.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("floe_frame_{}_{stem}_{n}.{ext}", std::process::id()))
}

fn mesh_file(vertex_count: u32, index_count: u32) -> PathBuf {
    let path = temp_path("mesh", "mesh");
    let verts = vec![Vertex::default(); vertex_count as usize];
    let indices: Vec<u32> = (0..index_count).map(|i| i % vertex_count).collect();
    write_mesh_file(&path, &verts, &indices).unwrap();
    path
}

fn small_settings() -> RendererSettings {
    RendererSettings {
        max_meshes: 16,
        max_textures: 16,
        max_draws: 64,
        vertex_buffer_size: 1 << 16,
        index_buffer_size: 1 << 16,
        staging_size: 1 << 20,
        image_arena_size: 1 << 22,
        uniform_size: 1 << 12,
        scratch: ArenaSettings {
            reserve_size: 1 << 20,
            commit_size: PAGE_SIZE,
        },
        ..Default::default()
    }
}

const SURFACE: Extent2d = Extent2d::new(64, 48);

fn renderer_with(settings: RendererSettings) -> Renderer<HeadlessDevice> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut device = HeadlessDevice::new(HeadlessConfig::discrete().with_surface_extent(SURFACE));
    let pipelines = RendererPipelines {
        cull: device.register_compute_kernel(headless_kernel(settings.cull_workgroup_size)),
        draw: device.register_graphics_pipeline(),
    };
    Renderer::new(device, settings, pipelines).unwrap()
}

fn renderer() -> Renderer<HeadlessDevice> {
    renderer_with(small_settings())
}

/// A renderer holding a cube (8 vertices, 12 indices) and a quad (4, 6).
fn renderer_with_meshes() -> (Renderer<HeadlessDevice>, MeshId, MeshId) {
    let mut renderer = renderer();
    let cube = renderer.create_mesh(mesh_file(8, 12)).unwrap();
    let quad = renderer.create_mesh(mesh_file(4, 6)).unwrap();
    (renderer, cube, quad)
}

// ============================================================================
// Frame Loop
// ============================================================================

#[test]
fn first_frame_presents_and_leaves_fence_signaled() {
    let mut renderer = renderer();
    let report = renderer.run_frame().unwrap();

    assert_eq!(report.image_index, 0);
    assert_eq!(report.rebuilds, 0);
    assert_eq!(report.draws, 0);
    assert_eq!(report.cull_groups, 0);
    assert_eq!(renderer.frame_count(), 1);
    assert_eq!(renderer.state(), FrameState::Idle);
    assert_eq!(renderer.device().presented_count(), 1);
    assert!(renderer.device().is_fence_signaled(renderer.sync().in_flight));
}

#[test]
fn swapchain_images_cycle_across_frames() {
    let mut renderer = renderer();
    let indices: Vec<u32> = (0..4).map(|_| renderer.run_frame().unwrap().image_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 0]);
}

#[test]
fn draw_lists_rotate_and_reset() {
    let (mut renderer, cube, quad) = renderer_with_meshes();
    for mesh in [cube, quad, cube] {
        renderer.submit_draw(&DrawInfo::new(mesh, Mat4::IDENTITY)).unwrap();
    }
    assert_eq!(renderer.draw_infos().active_index(), 0);

    let report = renderer.run_frame().unwrap();
    assert_eq!(report.draws, 3);
    assert_eq!(report.flush.meshes, 2);

    let draw_infos = renderer.draw_infos();
    assert_eq!(draw_infos.active_index(), 1);
    assert_eq!(draw_infos.count(), 0);
    assert_eq!(draw_infos.count_of(0), 3);
    let header = renderer
        .device()
        .read_buffer_as::<u32>(draw_infos.active_buffer().handle, 0, 1)
        .unwrap();
    assert_eq!(header[0], 0, "active list header should be cleared after rotation");

    assert_eq!(renderer.submit_draw(&DrawInfo::new(quad, Mat4::IDENTITY)).unwrap(), 0);
    let report = renderer.run_frame().unwrap();
    assert_eq!(report.draws, 1);
    assert_eq!(report.flush.meshes, 0);
    assert_eq!(renderer.draw_infos().active_index(), 0);
}

#[test]
fn draw_info_binding_follows_the_active_list() {
    let mut renderer = renderer();
    renderer.run_frame().unwrap();
    renderer.run_frame().unwrap();

    // Two frames in, the second list was bound for frame 1.
    let bound = renderer.device().descriptor(bindings::DRAW_INFO, 0);
    let expected = renderer.draw_infos().buffer(1).handle;
    assert!(
        matches!(bound, Some(DescriptorResource::Buffer { buffer, .. }) if buffer == expected),
        "draw-info binding {bound:?} is not list 1"
    );
}

#[test]
#[should_panic(expected = "draw capacity exceeded")]
fn draw_capacity_overrun_panics() {
    let settings = RendererSettings {
        max_draws: 4,
        ..small_settings()
    };
    let mut renderer = renderer_with(settings);
    for _ in 0..5 {
        let _ = renderer.submit_draw(&DrawInfo::default());
    }
}

#[test]
fn failed_upload_does_not_wedge_the_frame_loop() {
    let (mut renderer, cube, _) = renderer_with_meshes();
    renderer.run_frame().unwrap();

    let path = temp_path("truncated", "mesh");
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&8u32.to_le_bytes());
    bytes.extend_from_slice(&12u32.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 40]);
    std::fs::write(&path, bytes).unwrap();
    let broken = renderer.create_mesh(&path).unwrap();

    let err = renderer.run_frame().unwrap_err();
    assert!(matches!(err, FloeError::MeshFormat { .. }), "Expected MeshFormat, got {err:?}");
    assert_eq!(renderer.state(), FrameState::Idle);
    assert!(renderer.device().is_fence_signaled(renderer.sync().in_flight));

    // Later frames run, and the broken mesh simply draws nothing.
    renderer.submit_draw(&DrawInfo::new(broken, Mat4::IDENTITY)).unwrap();
    renderer.submit_draw(&DrawInfo::new(cube, Mat4::IDENTITY)).unwrap();
    renderer.run_frame().unwrap();
    renderer.run_frame().unwrap();

    let issued = renderer.device().issued_draws();
    let last_with_draws = &issued[issued.len() - 2];
    assert_eq!(last_with_draws.draws.len(), 1);
    assert_eq!(last_with_draws.draws[0].index_count, 12);
}

// ============================================================================
// Presentation Recovery
// ============================================================================

#[test]
fn out_of_date_acquire_rebuilds_and_retries() {
    let mut renderer = renderer();
    let generation = renderer.swapchain().generation();
    renderer.device_mut().force_out_of_date_acquires(2);

    let report = renderer.run_frame().unwrap();
    assert_eq!(report.rebuilds, 2);
    assert_eq!(renderer.swapchain().generation(), generation + 2);
    assert_eq!(renderer.device().presented_count(), 1);
}

#[test]
fn acquire_rebuilds_are_bounded() {
    let mut renderer = renderer();
    renderer.device_mut().force_out_of_date_acquires(4);

    let err = renderer.run_frame().unwrap_err();
    assert!(
        matches!(err, FloeError::SwapchainRebuildExhausted { attempts: 3 }),
        "Expected SwapchainRebuildExhausted after 3 attempts, got {err:?}"
    );

    // The fence was never reset, so the next frame can proceed.
    assert!(renderer.device().is_fence_signaled(renderer.sync().in_flight));
    let report = renderer.run_frame().unwrap();
    assert_eq!(report.rebuilds, 0);
}

#[test]
fn out_of_date_present_triggers_rebuild() {
    let mut renderer = renderer();
    let generation = renderer.swapchain().generation();
    renderer.device_mut().force_out_of_date_presents(1);

    let report = renderer.run_frame().unwrap();
    assert_eq!(report.rebuilds, 1);
    assert_eq!(renderer.swapchain().generation(), generation + 1);
    assert_eq!(renderer.device().presented_count(), 0);

    // The following frame presents normally on the rebuilt chain.
    let report = renderer.run_frame().unwrap();
    assert_eq!(report.rebuilds, 0);
    assert_eq!(renderer.device().presented_count(), 1);
}

#[test]
fn resize_rebuilds_window_relative_textures_only() {
    let mut renderer = renderer();
    let target = renderer
        .create_texture(&TextureDescriptor::window_target(Format::Rgba8Unorm))
        .unwrap();
    let depth = renderer
        .create_texture(&TextureDescriptor::window_target(Format::Depth32Float).with_flags(
            floe::renderer::resources::TextureFlags::DEDICATED_ALLOCATION,
        ))
        .unwrap();
    let sampled = renderer
        .create_texture(&TextureDescriptor::sampled(Format::Rgba8Unorm, Extent2d::new(8, 8)))
        .unwrap();
    renderer.run_frame().unwrap();

    let sampled_image = renderer.textures().require(sampled).unwrap().image();
    assert_eq!(renderer.textures().require(target).unwrap().extent(), SURFACE);

    let resized = Extent2d::new(128, 96);
    renderer.device_mut().set_surface_extent(resized);
    let report = renderer.run_frame().unwrap();
    assert_eq!(report.rebuilds, 1);
    assert_eq!(report.flush.attachments, 2);

    let textures = renderer.textures();
    for id in [target, depth] {
        let texture = textures.require(id).unwrap();
        assert_eq!(texture.extent(), resized);
        assert_eq!(renderer.device().image_extent(texture.image()), Some(resized));
    }
    let depth_image = textures.require(depth).unwrap().image();
    assert_eq!(
        renderer.device().image_layout(depth_image),
        Some(ImageLayout::DepthAttachment)
    );
    assert_eq!(renderer.swapchain().extent(), resized);

    let sampled_texture = textures.require(sampled).unwrap();
    assert_eq!(sampled_texture.extent(), Extent2d::new(8, 8));
    assert_eq!(sampled_texture.image(), sampled_image);
    assert!(renderer.device().image_exists(sampled_image));
}

#[test]
fn shrinking_reuses_the_arena_slot() {
    let mut renderer = renderer();
    let target = renderer
        .create_texture(&TextureDescriptor::window_target(Format::Rgba8Unorm))
        .unwrap();
    let before = renderer
        .device()
        .image_binding(renderer.textures().require(target).unwrap().image())
        .map(|(_, offset)| offset);
    let cursor = renderer.image_arena().cursor();

    renderer.device_mut().set_surface_extent(Extent2d::new(32, 24));
    renderer.on_resize().unwrap();

    let after = renderer
        .device()
        .image_binding(renderer.textures().require(target).unwrap().image())
        .map(|(_, offset)| offset);
    assert_eq!(before, after);
    assert_eq!(renderer.image_arena().cursor(), cursor);
}

// ============================================================================
// Cull Pass
// ============================================================================

#[test]
fn cull_pass_emits_commands_from_mesh_handles() {
    let (mut renderer, cube, quad) = renderer_with_meshes();
    renderer.submit_draw(&DrawInfo::new(cube, Mat4::IDENTITY)).unwrap();
    renderer.submit_draw(&DrawInfo::new(quad, Mat4::IDENTITY)).unwrap();

    let report = renderer.run_frame().unwrap();
    assert_eq!(report.cull_groups, 1);

    let issued = renderer.device().issued_draws();
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].pipeline, renderer.pipelines().draw);
    let draws = &issued[0].draws;
    assert_eq!(draws.len(), 2);
    assert_eq!((draws[0].index_count, draws[0].first_index, draws[0].vertex_offset), (12, 0, 0));
    assert_eq!((draws[1].index_count, draws[1].first_index, draws[1].vertex_offset), (6, 12, 8));
    assert_eq!(draws[1].first_instance, 1);
    assert!(draws.iter().all(|draw| draw.instance_count == 1));
}

#[test]
fn indirect_count_is_reset_every_frame() {
    let (mut renderer, cube, _) = renderer_with_meshes();
    for _ in 0..3 {
        renderer.submit_draw(&DrawInfo::new(cube, Mat4::IDENTITY)).unwrap();
        renderer.run_frame().unwrap();
    }
    let issued = renderer.device().issued_draws();
    assert_eq!(issued.len(), 3);
    assert!(issued.iter().all(|frame| frame.draws.len() == 1), "counts accumulated: {issued:?}");
}

#[test]
fn frustum_rejects_objects_outside_the_view() {
    let (mut renderer, cube, quad) = renderer_with_meshes();
    renderer.set_cull_params(CullParams::new(
        Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.0, 10.0),
        0.1,
    ));
    renderer
        .submit_draw(&DrawInfo::new(cube, Mat4::from_translation(Vec3::new(0.5, 0.0, -5.0))))
        .unwrap();
    renderer
        .submit_draw(&DrawInfo::new(quad, Mat4::from_translation(Vec3::new(3.0, 0.0, -5.0))))
        .unwrap();

    renderer.run_frame().unwrap();
    let draws = &renderer.device().issued_draws()[0].draws;
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].index_count, 12);
    assert_eq!(draws[0].first_instance, 0);

    // Disabling culling draws both again.
    renderer.set_cull_params(CullParams::disabled());
    renderer
        .submit_draw(&DrawInfo::new(quad, Mat4::from_translation(Vec3::new(3.0, 0.0, -5.0))))
        .unwrap();
    renderer.run_frame().unwrap();
    assert_eq!(renderer.device().issued_draws()[1].draws.len(), 1);
}

#[test]
fn draws_for_unknown_meshes_are_skipped() {
    let (mut renderer, cube, _) = renderer_with_meshes();
    renderer.submit_draw(&DrawInfo::new(MeshId(9), Mat4::IDENTITY)).unwrap();
    renderer.submit_draw(&DrawInfo::new(cube, Mat4::IDENTITY)).unwrap();

    renderer.run_frame().unwrap();
    let draws = &renderer.device().issued_draws()[0].draws;
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].first_instance, 1);
}

// ============================================================================
// Uniforms
// ============================================================================

#[test]
fn uniform_allocations_map_to_device_addresses() {
    let mut renderer = renderer();
    let base = renderer.uniforms().device_buffer().address;

    let a = renderer.alloc_uniform(40).unwrap();
    let b = renderer.alloc_uniform(16).unwrap();
    assert_eq!(a.span.offset, 0);
    assert_eq!(b.span.offset, 48);
    assert_eq!(a.device_address, base);
    assert_eq!(b.device_address, base + 48);
    assert_eq!(renderer.uniforms().used(), 64);
}

#[test]
fn uniform_data_reaches_the_device_buffer() {
    let mut renderer = renderer();
    let block = renderer.alloc_uniform(16).unwrap();
    renderer.write_uniform(&block, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
    renderer.run_frame().unwrap();

    let device_buffer = renderer.uniforms().device_buffer().handle;
    let values = renderer.device().read_buffer_as::<f32>(device_buffer, 0, 4).unwrap();
    assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(renderer.uniforms().slot(), 1);
    assert_eq!(renderer.uniforms().used(), 0);
}

#[test]
#[should_panic(expected = "rotated out")]
fn stale_uniform_allocation_panics() {
    let mut renderer = renderer();
    let block = renderer.alloc_uniform(16).unwrap();
    renderer.run_frame().unwrap();
    let _ = renderer.write_uniform(&block, &[0u32; 4]);
}

#[test]
fn uniform_staging_overflow_is_an_error() {
    let mut renderer = renderer();
    renderer.alloc_uniform(4000).unwrap();
    let err = renderer.alloc_uniform(200).unwrap_err();
    assert!(
        matches!(err, FloeError::DeviceArenaExhausted { .. }),
        "Expected DeviceArenaExhausted, got {err:?}"
    );
}

// ============================================================================
// Texture Files
// ============================================================================

#[test]
fn texture_from_png_file() {
    let mut renderer = renderer();
    let path = temp_path("checker", "png");
    let mut img = image::RgbaImage::new(4, 2);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        *pixel = image::Rgba([x as u8 * 60, y as u8 * 100, 7, 255]);
    }
    img.save(&path).unwrap();

    let id = renderer.texture_from_file(&path).unwrap();
    let texture = renderer.textures().require(id).unwrap();
    assert_eq!(texture.extent(), Extent2d::new(4, 2));
    assert_eq!(texture.format(), Format::Rgba8UnormSrgb);

    renderer.run_frame().unwrap();
    let image = renderer.textures().require(id).unwrap().image();
    let device = renderer.device();
    assert_eq!(device.image_layout(image), Some(ImageLayout::ShaderReadOnly));
    assert_eq!(device.image_contents(image).unwrap(), img.into_raw());
    assert!(
        matches!(device.descriptor(bindings::TEXTURES, id.0), Some(DescriptorResource::SampledImage { .. })),
        "texture {} has no bindless descriptor",
        id.0
    );
}

#[test]
fn unreadable_image_file_is_a_decode_error() {
    let mut renderer = renderer();
    let path = temp_path("garbage", "png");
    std::fs::write(&path, b"not a png").unwrap();

    let err = renderer.texture_from_file(&path).unwrap_err();
    assert!(matches!(err, FloeError::ImageDecode(_)), "Expected ImageDecode, got {err:?}");
    assert!(renderer.textures().is_empty());
}

// ============================================================================
// Bookkeeping
// ============================================================================

#[test]
fn mesh_count_includes_queued_meshes() {
    let (mut renderer, _, _) = renderer_with_meshes();
    assert_eq!(renderer.mesh_count(), 2);
    assert_eq!(renderer.meshes().handle_count(), 0);

    renderer.run_frame().unwrap();
    assert_eq!(renderer.mesh_count(), 2);
    assert_eq!(renderer.meshes().handle_count(), 2);

    renderer.create_mesh(mesh_file(3, 3)).unwrap();
    assert_eq!(renderer.mesh_count(), 3);
}

#[test]
fn settings_surface_the_surface_extent() {
    let renderer = renderer();
    assert_eq!(renderer.device().surface_extent(), SURFACE);
    assert_eq!(renderer.swapchain().extent(), SURFACE);
    assert_eq!(renderer.settings().max_draws, 64);
}
