// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Object lifetimes through a [Context] on the headless backend.
//!
//! The headless GPU only advances when a test retires its work, so every "the GPU is still busy"
//! window below is exact.

use fences_and_frames::keys::{
    BufferDescription, Format, GraphicsPipelineDescription, CullMode, PrimitiveTopology,
    RenderTargetDescription, ResourceView, ShaderBinary, ShaderStage, ShaderViewDescription,
    TextureDescription,
};
use fences_and_frames::{
    Context, ContextConfig, HeadlessBackend, QueueType, ResourceState,
};
use std::sync::Arc;
use std::time::Duration;

fn config() -> ContextConfig {
    ContextConfig {
        fence_wait_timeout: Duration::from_millis(50),
        ..Default::default()
    }
}

fn setup(config: ContextConfig) -> (Arc<HeadlessBackend>, Context<HeadlessBackend>) {
    let backend = Arc::new(HeadlessBackend::new());
    let context = Context::new(backend.clone(), config).expect("valid config");
    (backend, context)
}

fn pipeline_description() -> GraphicsPipelineDescription {
    GraphicsPipelineDescription {
        shaders: vec![
            ShaderBinary {
                stage: ShaderStage::Vertex,
                bytes: Arc::from(&b"vs_main"[..]),
            },
            ShaderBinary {
                stage: ShaderStage::Pixel,
                bytes: Arc::from(&b"ps_main"[..]),
            },
        ],
        vertex_stride: 32,
        render_targets: vec![Format::Rgba8Unorm],
        depth_target: Some(Format::Depth32Float),
        topology: PrimitiveTopology::Triangles,
        cull: CullMode::Back,
        num_shader_arguments: 2,
        has_root_constants: false,
    }
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn resources_come_back_only_after_the_gpu_retires_them() {
    let (backend, context) = setup(config());
    let description = TextureDescription::new_2d(Format::Rgba8Unorm, 256, 256);
    let texture = context.acquire_texture(&description);

    let list = context.begin_commands(QueueType::Direct);
    context.transition(list, texture, ResourceState::RenderTarget);
    let epoch = context.submit(&[list]);
    assert_eq!(epoch, 1);
    context.free_resource(description, texture);

    // the GPU may still be rendering into it
    let other = context.acquire_texture(&description);
    assert_ne!(other, texture);
    assert_eq!(context.current_gpu_epoch(), 0);

    backend.retire_all();
    assert_eq!(context.acquire_texture(&description), texture);
    assert_eq!(context.poll_gpu_epoch(), 1);
    assert_eq!(backend.resources_created(), 2);
    // the state survives the round trip through the cache
    assert_eq!(
        context.resource_state(texture),
        Some(ResourceState::RenderTarget)
    );
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn different_shapes_never_share_objects() {
    let (backend, context) = setup(config());
    let small = BufferDescription {
        size: 256,
        stride: 16,
        allow_uav: false,
    };
    let large = BufferDescription {
        size: 4096,
        ..small
    };
    let buffer = context.acquire_buffer(&small);
    context.free_resource(small, buffer);
    assert_ne!(context.acquire_buffer(&large), buffer);
    assert_eq!(context.acquire_buffer(&small), buffer);
    assert_eq!(backend.resources_created(), 2);
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn shader_views_keep_their_descriptors() {
    let (backend, context) = setup(config());
    let texture = context.acquire_texture(&TextureDescription::new_2d(Format::R32Float, 64, 64));
    let description = ShaderViewDescription {
        srvs: vec![ResourceView::whole(texture); 3],
        ..Default::default()
    };
    let view = context.acquire_shader_view(&description);
    assert_eq!(view.descriptors.num_elements, 3);
    assert_eq!(backend.shader_view_range(view.handle), view.descriptors);

    // nothing was submitted since, so the view is immediately reusable
    context.free_shader_view(description.clone(), view);
    assert_eq!(context.acquire_shader_view(&description), view);
    assert_eq!(backend.shader_views_created(), 1);

    let second = context.acquire_shader_view(&description);
    assert_ne!(second.descriptors.page, view.descriptors.page);
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn pipelines_are_cached_by_structure() {
    let (backend, context) = setup(config());
    let description = pipeline_description();
    let pipeline = context.acquire_graphics_pipeline(&description);
    context.free_pipeline(description.clone(), pipeline);

    let mut rebuilt = pipeline_description();
    rebuilt.shaders[1].bytes = Arc::from(b"ps_main".to_vec());
    assert_eq!(context.acquire_graphics_pipeline(&rebuilt), pipeline);

    rebuilt.cull = CullMode::None;
    assert_ne!(context.acquire_graphics_pipeline(&rebuilt), pipeline);
    assert_eq!(backend.pipelines_created(), 2);
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn idle_keys_are_culled() {
    let (backend, context) = setup(ContextConfig {
        cull_interval_frames: 1,
        cull_max_age: 1,
        ..config()
    });
    let description = RenderTargetDescription::new(Format::Rgba16Float, 128, 128);
    let target = context.acquire_render_target(&description);
    context.free_resource(description, target);
    // the upload ring's buffer is live too
    assert_eq!(backend.live_resources(), 2);

    context.present();
    assert_eq!(context.num_cached(), 1);
    context.present();
    assert_eq!(context.num_cached(), 0);
    assert!(!backend.is_live(target));
    assert_eq!(backend.live_resources(), 1);
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn backbuffer_follows_the_swapchain() {
    let (backend, context) = setup(config());
    let backbuffer = context.acquire_backbuffer().expect("swapchain is fresh");
    assert_eq!(
        context.resource_state(backbuffer),
        Some(ResourceState::Present)
    );
    backend.lose_swapchain();
    assert_eq!(context.acquire_backbuffer(), None);
    context.on_resize(800, 600);
    assert_eq!(backend.size(), (800, 600));
    assert_eq!(context.acquire_backbuffer(), Some(backbuffer));
}

#[test]
#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test::wasm_bindgen_test)]
fn teardown_releases_every_backend_object() {
    let backend = Arc::new(HeadlessBackend::new());
    {
        let context = Context::new(backend.clone(), config()).expect("valid config");
        let texture_description = TextureDescription::new_2d(Format::Bgra8Unorm, 32, 32);
        let texture = context.acquire_texture(&texture_description);
        let view_description = ShaderViewDescription {
            srvs: vec![ResourceView::whole(texture)],
            ..Default::default()
        };
        let view = context.acquire_shader_view(&view_description);
        let pipeline_description = pipeline_description();
        let first = context.acquire_graphics_pipeline(&pipeline_description);
        let second = context.acquire_graphics_pipeline(&pipeline_description);

        let list = context.begin_commands(QueueType::Direct);
        context.transition(list, texture, ResourceState::ShaderResource);
        context.submit(&[list]);

        context.free_shader_view(view_description, view);
        context.free_resource(texture_description, texture);
        context.free_pipeline(pipeline_description.clone(), first);
        context.free_pipeline(pipeline_description, second);
        assert_eq!(context.num_buried(), 1);

        // a list still recording at teardown
        let abandoned = context.begin_commands(QueueType::Copy);
        context.transition(abandoned, texture, ResourceState::CopyDest);
        assert!(backend.live_events() > 0);
    }
    assert_eq!(backend.live_resources(), 0);
    assert_eq!(backend.live_shader_views(), 0);
    assert_eq!(backend.live_pipelines(), 0);
    assert_eq!(backend.live_events(), 0);
    assert_eq!(backend.lists_discarded(), 1);
    assert_eq!(backend.pending_gpu_ops(), 0);
}
