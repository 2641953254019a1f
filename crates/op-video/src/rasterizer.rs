//! Rasterizer front end
//!
//! Reacts to PICA register writes by updating the host pipeline state
//! mirror, batches triangles and turns each batch into one host draw call.

use std::sync::Arc;

use bitflags::bitflags;
use op_core::config::GpuConfig;
use op_core::error::{EmulatorError, VideoError};
use op_memory::GuestMemory;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{
    BlendFuncs, ColorMask, CullState, DepthState, FrontFace, GraphicsBackend, HardwareVertex, SamplerHandle,
    SamplerState, StencilState, Viewport,
};
use crate::color::rgba8_to_f32;
use crate::pica::regs::{index, NUM_TEV_STAGES, NUM_TEXTURE_UNITS};
use crate::pica::{CullMode, DepthFormat, Regs, TextureConfig, WrapMode};
use crate::shader::{PipelineConfig, ShaderCache, UniformBlock};
use crate::state::{PipelineState, StateTracker};
use crate::surface_cache::{BoundFramebuffer, SurfaceCache};
use crate::vertex::OutputVertex;

type Result<T> = std::result::Result<T, EmulatorError>;

bitflags! {
    /// Pieces of host state touched by register writes since the last draw
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DirtyFlags: u32 {
        const CULL = 1 << 0;
        const BLEND_ENABLE = 1 << 1;
        const BLEND_FUNCS = 1 << 2;
        const BLEND_COLOR = 1 << 3;
        const ALPHA_TEST = 1 << 4;
        const STENCIL = 1 << 5;
        const DEPTH = 1 << 6;
        const LOGIC_OP = 1 << 7;
        /// The fragment shader variant must be looked up again
        const SHADER = 1 << 8;
        const CONST_COLOR = 1 << 9;
        const COMBINER_COLOR = 1 << 10;
    }
}

/// Map a register index to the state it controls
pub fn dirty_flags_for_register(id: u32) -> DirtyFlags {
    match id {
        index::CULL_MODE => DirtyFlags::CULL,
        index::COLOR_OPERATION => DirtyFlags::BLEND_ENABLE,
        index::ALPHA_BLENDING => DirtyFlags::BLEND_FUNCS,
        index::BLEND_CONST => DirtyFlags::BLEND_COLOR,
        index::ALPHA_TEST => DirtyFlags::ALPHA_TEST | DirtyFlags::SHADER,
        index::STENCIL_FUNC | index::STENCIL_OP => DirtyFlags::STENCIL,
        // Stencil testing depends on the depth buffer having a stencil channel
        index::DEPTH_FORMAT => DirtyFlags::STENCIL,
        index::DEPTH_COLOR_MASK => DirtyFlags::DEPTH,
        index::LOGIC_OP => DirtyFlags::LOGIC_OP,
        index::TEV_COMBINER_BUFFER_INPUT => DirtyFlags::SHADER,
        index::TEV_COMBINER_BUFFER_COLOR => DirtyFlags::COMBINER_COLOR,
        _ => match tev_stage_register(id) {
            Some((_, index::TEV_CONST_COLOR)) => DirtyFlags::CONST_COLOR,
            Some((_, index::TEV_SOURCES | index::TEV_MODIFIERS | index::TEV_OPS | index::TEV_SCALES)) => {
                DirtyFlags::SHADER
            }
            _ => DirtyFlags::empty(),
        },
    }
}

/// Stage and offset of a register inside a TEV stage block
fn tev_stage_register(id: u32) -> Option<(usize, u32)> {
    index::TEV_STAGES
        .iter()
        .enumerate()
        .find(|(_, &base)| (base..base + 5).contains(&id))
        .map(|(stage, &base)| (stage, id - base))
}

/// Sampler object owned by one texture unit and the parameters it was last given
#[derive(Debug, Clone, Copy)]
struct SamplerSlot {
    handle: SamplerHandle,
    state: SamplerState,
}

/// Hardware rasterizer driving a [`GraphicsBackend`]
pub struct Rasterizer<B: GraphicsBackend + ?Sized> {
    backend: Box<B>,
    memory: Arc<dyn GuestMemory>,
    tracker: StateTracker,
    uniforms: UniformBlock,
    surfaces: SurfaceCache,
    shaders: ShaderCache,
    samplers: [Option<SamplerSlot>; NUM_TEXTURE_UNITS],
    vertex_batch: Vec<HardwareVertex>,
    framebuffer: BoundFramebuffer,
    dirty: DirtyFlags,
    use_hw_renderer: bool,
    hw_enabled: bool,
    initialized: bool,
}

impl<B: GraphicsBackend + ?Sized> Rasterizer<B> {
    pub fn new(backend: Box<B>, memory: Arc<dyn GuestMemory>, config: &GpuConfig) -> Self {
        Self {
            backend,
            memory,
            tracker: StateTracker::new(),
            uniforms: UniformBlock::new(),
            surfaces: SurfaceCache::new(),
            shaders: ShaderCache::new(),
            samplers: [None; NUM_TEXTURE_UNITS],
            vertex_batch: Vec::with_capacity(config.vertex_batch_reserve),
            framebuffer: BoundFramebuffer::default(),
            dirty: DirtyFlags::empty(),
            use_hw_renderer: config.use_hw_renderer,
            hw_enabled: config.use_hw_renderer,
            initialized: false,
        }
    }

    /// Use `shaders` for variant lookup, e.g. one that dumps generated sources
    pub fn with_shader_cache(mut self, shaders: ShaderCache) -> Self {
        self.shaders = shaders;
        self
    }

    /// Initialize the backend, create per-unit samplers and sync all state from `regs`
    pub fn init(&mut self, regs: &Regs) -> Result<()> {
        if !self.use_hw_renderer {
            info!("Hardware renderer disabled");
            return Ok(());
        }

        self.backend.init()?;
        for unit in 0..NUM_TEXTURE_UNITS {
            let handle = self.backend.create_sampler()?;
            self.samplers[unit] = Some(SamplerSlot {
                handle,
                state: SamplerState::default(),
            });
            self.tracker.current_mut().texture_units[unit].sampler = Some(handle);
        }
        self.initialized = true;
        info!("Rasterizer initialized");

        self.reset(regs);
        Ok(())
    }

    /// Whether draws currently reach the host
    pub fn is_hw_enabled(&self) -> bool {
        self.use_hw_renderer && self.hw_enabled && self.initialized
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn surface_cache(&self) -> &SurfaceCache {
        &self.surfaces
    }

    pub fn shader_cache(&self) -> &ShaderCache {
        &self.shaders
    }

    /// Wanted host state
    pub fn pipeline_state(&self) -> &PipelineState {
        self.tracker.current()
    }

    pub fn uniforms(&self) -> &UniformBlock {
        &self.uniforms
    }

    /// State touched since the last draw
    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    /// Number of vertices waiting for the next draw
    pub fn pending_vertices(&self) -> usize {
        self.vertex_batch.len()
    }

    /// Resync every piece of tracked state and drop all cached surfaces
    pub fn reset(&mut self, regs: &Regs) {
        if !self.use_hw_renderer || !self.initialized {
            return;
        }
        debug!("Rasterizer reset");
        self.hw_enabled = true;

        self.sync_cull_mode(regs);
        self.sync_blend_enabled(regs);
        self.sync_blend_funcs(regs);
        self.sync_blend_color(regs);
        self.sync_logic_op(regs);
        self.sync_stencil_test(regs);
        self.sync_depth_test(regs);

        if let Err(e) = self.set_shader(regs) {
            self.handle_error("set shader", e);
        }

        self.surfaces.invalidate_all(&mut *self.backend);
        self.forget_released();
        self.tracker.invalidate();
        self.uniforms.mark_dirty();
        self.dirty = DirtyFlags::empty();
    }

    /// Append one triangle to the batch
    pub fn add_triangle(&mut self, v0: &OutputVertex, v1: &OutputVertex, v2: &OutputVertex) {
        if !self.is_hw_enabled() {
            return;
        }
        self.vertex_batch.extend([v0, v1, v2].map(HardwareVertex::from));
    }

    /// Sync dirty state and draw the whole batch
    pub fn draw_triangles(&mut self, regs: &Regs) {
        if !self.is_hw_enabled() {
            self.vertex_batch.clear();
            return;
        }

        let result = self.try_draw_triangles(regs);
        self.vertex_batch.clear();
        if let Err(e) = result {
            self.handle_error("draw", e);
        }
    }

    fn try_draw_triangles(&mut self, regs: &Regs) -> Result<()> {
        trace!("Drawing {} vertices ({:?} dirty)", self.vertex_batch.len(), self.dirty);

        self.sync_framebuffer(regs)?;
        self.sync_draw_state(regs)?;

        if self.dirty.contains(DirtyFlags::SHADER) {
            self.set_shader(regs)?;
        }
        self.dirty = DirtyFlags::empty();

        self.tracker.apply(&mut *self.backend)?;
        self.uniforms.upload(&mut *self.backend);

        if !self.vertex_batch.is_empty() {
            self.backend.upload_vertices(&self.vertex_batch);
            self.backend.draw_triangles(0, self.vertex_batch.len() as u32)?;
        }

        // The host copies are now newer than guest memory
        let attachments = self.tracker.current().framebuffer;
        if let Some(addr) = self.framebuffer.color {
            if self.surfaces.surface(addr).map(|s| s.texture) == attachments.color {
                self.surfaces.mark_dirty(addr);
            }
        }
        if let Some(addr) = self.framebuffer.depth {
            if self.surfaces.surface(addr).map(|s| s.texture) == attachments.depth {
                self.surfaces.mark_dirty(addr);
            }
        }
        Ok(())
    }

    /// React to a write of register `id`. Returns the state that was touched.
    pub fn notify_register_changed(&mut self, regs: &Regs, id: u32) -> DirtyFlags {
        if !self.is_hw_enabled() {
            return DirtyFlags::empty();
        }

        let flags = dirty_flags_for_register(id);
        if flags.contains(DirtyFlags::CULL) {
            self.sync_cull_mode(regs);
        }
        if flags.contains(DirtyFlags::BLEND_ENABLE) {
            self.sync_blend_enabled(regs);
        }
        if flags.contains(DirtyFlags::BLEND_FUNCS) {
            self.sync_blend_funcs(regs);
        }
        if flags.contains(DirtyFlags::BLEND_COLOR) {
            self.sync_blend_color(regs);
        }
        if flags.contains(DirtyFlags::ALPHA_TEST) {
            self.sync_alpha_test(regs);
        }
        if flags.contains(DirtyFlags::STENCIL) {
            self.sync_stencil_test(regs);
        }
        if flags.contains(DirtyFlags::DEPTH) {
            self.sync_depth_test(regs);
        }
        if flags.contains(DirtyFlags::LOGIC_OP) {
            self.sync_logic_op(regs);
        }
        if flags.contains(DirtyFlags::CONST_COLOR) {
            if let Some((stage, _)) = tev_stage_register(id) {
                self.sync_tev_const_color(regs, stage);
            }
        }
        if flags.contains(DirtyFlags::COMBINER_COLOR) {
            self.sync_combiner_color(regs);
        }

        self.dirty |= flags;
        flags
    }

    /// The guest is about to read `[addr, addr + size)`
    pub fn notify_pre_read(&mut self, addr: u32, size: u32) {
        if !self.is_hw_enabled() {
            return;
        }
        let result = self.surfaces.flush_in_range(&mut *self.backend, &*self.memory, addr, size);
        if let Err(e) = result {
            self.handle_error("flush before read", e);
        }
    }

    /// The guest wrote `[addr, addr + size)`
    pub fn notify_flush(&mut self, addr: u32, size: u32) {
        if !self.is_hw_enabled() {
            return;
        }
        self.surfaces
            .invalidate_in_range(&mut *self.backend, &*self.memory, addr, size, false);
        self.forget_released();
    }

    /// Write every dirty surface back to guest memory
    pub fn flush_all_surfaces(&mut self) {
        if !self.is_hw_enabled() {
            return;
        }
        let result = self.surfaces.flush_all(&mut *self.backend, &*self.memory);
        if let Err(e) = result {
            self.handle_error("flush all surfaces", e);
        }
    }

    /// Release every host object
    pub fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }
        if self.hw_enabled {
            self.flush_all_surfaces();
        }
        self.surfaces.invalidate_all(&mut *self.backend);
        self.forget_released();
        self.shaders.clear(&mut *self.backend);
        self.backend.shutdown();
        self.initialized = false;
        info!("Rasterizer shut down");
    }

    fn handle_error(&mut self, what: &str, err: EmulatorError) {
        match err {
            EmulatorError::Video(VideoError::UnsupportedFormat(format)) => {
                warn!("{}: unsupported format {}", what, format);
            }
            EmulatorError::Video(e @ VideoError::SurfaceTooLarge { .. }) => {
                warn!("{}: {}", what, e);
            }
            EmulatorError::Memory(e) => {
                warn!("{}: {}", what, e);
            }
            other => {
                error!("{} failed: {}; hardware rendering disabled until reset", what, other);
                self.hw_enabled = false;
            }
        }
    }

    fn forget_released(&mut self) {
        for texture in self.surfaces.take_released() {
            self.tracker.forget_texture(texture);
        }
    }

    fn sync_framebuffer(&mut self, regs: &Regs) -> Result<()> {
        let state = self.tracker.current_mut();
        let result =
            self.surfaces
                .load_and_bind_framebuffer(&mut *self.backend, &*self.memory, state, &regs.framebuffer());
        self.forget_released();
        self.framebuffer = result?;
        Ok(())
    }

    fn sync_draw_state(&mut self, regs: &Regs) -> Result<()> {
        let (x, y) = regs.viewport_corner();
        self.tracker.current_mut().viewport = Viewport {
            x,
            y,
            width: regs.viewport_size_x() as i32 * 2,
            height: regs.viewport_size_y() as i32 * 2,
        };

        for (unit, texture) in regs.textures().iter().enumerate() {
            if !texture.enabled {
                self.tracker.current_mut().texture_units[unit].texture = None;
                continue;
            }

            self.sync_sampler(unit, &texture.config);
            let state = self.tracker.current_mut();
            let result = self
                .surfaces
                .load_and_bind_texture(&mut *self.backend, &*self.memory, state, unit, texture);
            self.forget_released();
            match result {
                Ok(_) => {}
                Err(EmulatorError::Video(VideoError::UnsupportedFormat(format))) => {
                    warn!("Texture unit {}: unsupported format {}", unit, format);
                    self.tracker.current_mut().texture_units[unit].texture = None;
                }
                Err(EmulatorError::Video(e @ VideoError::SurfaceTooLarge { .. })) => {
                    warn!("Texture unit {}: {}", unit, e);
                    self.tracker.current_mut().texture_units[unit].texture = None;
                }
                Err(EmulatorError::Memory(e)) => {
                    warn!("Texture unit {}: {}", unit, e);
                    self.tracker.current_mut().texture_units[unit].texture = None;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn sync_sampler(&mut self, unit: usize, config: &TextureConfig) {
        let Some(slot) = &mut self.samplers[unit] else {
            return;
        };

        let mut wanted = SamplerState {
            mag_filter: config.mag_filter,
            min_filter: config.min_filter,
            wrap_s: config.wrap_s,
            wrap_t: config.wrap_t,
            border_color: slot.state.border_color,
        };
        if wanted.wrap_s == WrapMode::ClampToBorder || wanted.wrap_t == WrapMode::ClampToBorder {
            wanted.border_color = config.border_color;
        }

        if wanted != slot.state {
            slot.state = wanted;
            self.backend.set_sampler_state(slot.handle, &wanted);
        }
    }

    fn set_shader(&mut self, regs: &Regs) -> Result<()> {
        let config = PipelineConfig::from_regs(regs);
        let program = self.shaders.get_or_create(&mut *self.backend, &config)?.program;
        self.tracker.current_mut().program = Some(program);

        self.sync_alpha_test(regs);
        self.sync_combiner_color(regs);
        for stage in 0..NUM_TEV_STAGES {
            self.sync_tev_const_color(regs, stage);
        }
        Ok(())
    }

    fn sync_cull_mode(&mut self, regs: &Regs) {
        let cull = &mut self.tracker.current_mut().cull;
        match regs.cull_mode() {
            CullMode::KeepAll => cull.enabled = false,
            CullMode::KeepClockWise => {
                *cull = CullState {
                    enabled: true,
                    front_face: FrontFace::Clockwise,
                }
            }
            CullMode::KeepCounterClockWise => {
                *cull = CullState {
                    enabled: true,
                    front_face: FrontFace::CounterClockwise,
                }
            }
        }
    }

    fn sync_blend_enabled(&mut self, regs: &Regs) {
        self.tracker.current_mut().blend_enabled = regs.alphablend_enabled();
    }

    fn sync_blend_funcs(&mut self, regs: &Regs) {
        let blending = regs.alpha_blending();
        self.tracker.current_mut().blend_funcs = BlendFuncs {
            equation_rgb: blending.equation_rgb,
            equation_a: blending.equation_a,
            src_rgb: blending.factor_source_rgb,
            dst_rgb: blending.factor_dest_rgb,
            src_a: blending.factor_source_a,
            dst_a: blending.factor_dest_a,
        };
    }

    fn sync_blend_color(&mut self, regs: &Regs) {
        self.tracker.current_mut().blend_color = regs.blend_const();
    }

    fn sync_alpha_test(&mut self, regs: &Regs) {
        self.uniforms.set_alphatest_ref(regs.alpha_test().reference as i32);
    }

    fn sync_logic_op(&mut self, regs: &Regs) {
        self.tracker.current_mut().logic_op = regs.logic_op();
    }

    fn sync_stencil_test(&mut self, regs: &Regs) {
        let test = regs.stencil_test();
        let has_stencil = regs.framebuffer().depth_format == Some(DepthFormat::D24S8);
        self.tracker.current_mut().stencil = StencilState {
            test_enabled: test.enable && has_stencil,
            func: test.func,
            reference: test.reference_value,
            compare_mask: test.input_mask,
            write_mask: test.write_mask,
            action_stencil_fail: test.action_stencil_fail,
            action_depth_fail: test.action_depth_fail,
            action_depth_pass: test.action_depth_pass,
        };
    }

    fn sync_depth_test(&mut self, regs: &Regs) {
        let mask = regs.depth_color_mask();
        let state = self.tracker.current_mut();
        state.depth = DepthState {
            test_enabled: mask.depth_test_enable,
            func: mask.depth_test_func,
            write_enabled: mask.depth_write_enable,
        };
        state.color_mask = ColorMask {
            red: mask.red_enable,
            green: mask.green_enable,
            blue: mask.blue_enable,
            alpha: mask.alpha_enable,
        };
    }

    fn sync_combiner_color(&mut self, regs: &Regs) {
        self.uniforms
            .set_combiner_buffer_color(rgba8_to_f32(regs.tev_combiner_buffer_color()));
    }

    fn sync_tev_const_color(&mut self, regs: &Regs, stage: usize) {
        self.uniforms
            .set_const_color(stage, rgba8_to_f32(regs.tev_stage(stage).const_color));
    }
}

impl<B: GraphicsBackend + ?Sized> Drop for Rasterizer<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::{HostCall, NullBackend};
    use crate::pica::{f32_to_float24, BlendFactor, CompareFunc};
    use op_memory::{MemoryManager, MemoryRegion, RegionFlags};

    const COLOR_ADDR: u32 = 0x1_0000;
    const DEPTH_ADDR: u32 = 0x2_0000;
    const TEXTURE_ADDR: u32 = 0x4_0000;

    fn memory() -> Arc<MemoryManager> {
        MemoryManager::with_regions(vec![MemoryRegion::new("vram", 0, 0x10_0000, RegionFlags::RW_GPU)])
    }

    /// 64x32 RGBA8 color buffer with a D24S8 depth buffer
    fn framebuffer_regs() -> Regs {
        let mut regs = Regs::new();
        regs.set(index::COLOR_BUFFER_ADDRESS, COLOR_ADDR / 8);
        regs.set(index::DEPTH_BUFFER_ADDRESS, DEPTH_ADDR / 8);
        regs.set(index::FRAMEBUFFER_DIMENSIONS, 64 | (31 << 12));
        regs.set(index::COLOR_FORMAT, 0);
        regs.set(index::DEPTH_FORMAT, 3);
        regs.set(index::VIEWPORT_SIZE_X, f32_to_float24(32.0));
        regs.set(index::VIEWPORT_SIZE_Y, f32_to_float24(16.0));
        regs
    }

    fn rasterizer(regs: &Regs) -> (Rasterizer<NullBackend>, Arc<MemoryManager>) {
        let mem = memory();
        let mut rasterizer = Rasterizer::new(Box::new(NullBackend::new()), mem.clone(), &GpuConfig::default());
        rasterizer.init(regs).unwrap();
        (rasterizer, mem)
    }

    fn triangle() -> [OutputVertex; 3] {
        let v = |x: f32, y: f32| OutputVertex {
            pos: [x, y, 0.0, 1.0],
            color: [1.0; 4],
            ..Default::default()
        };
        [v(-1.0, -1.0), v(1.0, -1.0), v(0.0, 1.0)]
    }

    fn draw_one(rasterizer: &mut Rasterizer<NullBackend>, regs: &Regs) {
        let [a, b, c] = triangle();
        rasterizer.add_triangle(&a, &b, &c);
        rasterizer.draw_triangles(regs);
    }

    #[test]
    fn test_register_mapping() {
        assert_eq!(dirty_flags_for_register(index::CULL_MODE), DirtyFlags::CULL);
        assert_eq!(
            dirty_flags_for_register(index::ALPHA_TEST),
            DirtyFlags::ALPHA_TEST | DirtyFlags::SHADER
        );
        assert_eq!(dirty_flags_for_register(index::TEV_STAGES[3]), DirtyFlags::SHADER);
        assert_eq!(
            dirty_flags_for_register(index::TEV_STAGES[5] + index::TEV_CONST_COLOR),
            DirtyFlags::CONST_COLOR
        );
        assert_eq!(dirty_flags_for_register(index::TEV_STAGES[2] + index::TEV_SCALES), DirtyFlags::SHADER);
        assert_eq!(dirty_flags_for_register(index::TEV_COMBINER_BUFFER_COLOR), DirtyFlags::COMBINER_COLOR);
        assert_eq!(dirty_flags_for_register(index::DEPTH_FORMAT), DirtyFlags::STENCIL);
        assert_eq!(dirty_flags_for_register(0x1FF), DirtyFlags::empty());
    }

    #[test]
    fn test_cull_write_only_resyncs_cull() {
        let mut regs = framebuffer_regs();
        let (mut rasterizer, _mem) = rasterizer(&regs);
        draw_one(&mut rasterizer, &regs);
        rasterizer.backend_mut().clear_calls();

        regs.set(index::CULL_MODE, CullMode::KeepClockWise.raw());
        let flags = rasterizer.notify_register_changed(&regs, index::CULL_MODE);
        assert_eq!(flags, DirtyFlags::CULL);
        // Notifications only touch the mirror
        assert!(rasterizer.backend().calls().is_empty());

        draw_one(&mut rasterizer, &regs);
        let calls = rasterizer.backend().calls();
        assert!(calls.contains(&HostCall::SetCullState(CullState {
            enabled: true,
            front_face: FrontFace::Clockwise,
        })));
        assert!(!calls.iter().any(|c| matches!(
            c,
            HostCall::SetBlendEnabled(_)
                | HostCall::SetBlendFuncs(_)
                | HostCall::SetBlendColor(_)
                | HostCall::SetDepthState(_)
                | HostCall::SetStencilState(_)
                | HostCall::SetColorMask(_)
                | HostCall::UseProgram(_)
                | HostCall::SetFramebuffer(_)
        )));
    }

    #[test]
    fn test_draw_sequence() {
        let regs = framebuffer_regs();
        let (mut rasterizer, _mem) = rasterizer(&regs);
        let [a, b, c] = triangle();
        let before = rasterizer.backend().calls().len();
        rasterizer.add_triangle(&a, &b, &c);
        rasterizer.add_triangle(&c, &b, &a);
        // Batching does not reach the host
        assert_eq!(rasterizer.backend().calls().len(), before);
        assert_eq!(rasterizer.pending_vertices(), 6);

        rasterizer.draw_triangles(&regs);
        assert_eq!(rasterizer.pending_vertices(), 0);
        assert_eq!(rasterizer.backend().draw_calls(), 1);
        assert_eq!(rasterizer.backend().vertices().len(), 6);
        assert!(rasterizer
            .backend()
            .calls()
            .contains(&HostCall::DrawTriangles { first: 0, count: 6 }));

        let cache = rasterizer.surface_cache();
        assert!(cache.surface(COLOR_ADDR).unwrap().dirty);
        assert!(cache.surface(DEPTH_ADDR).unwrap().dirty);

        let fb = rasterizer.pipeline_state().framebuffer;
        assert!(fb.color.is_some());
        assert_eq!(fb.stencil, fb.depth);
    }

    #[test]
    fn test_viewport_doubles_half_extents() {
        let mut regs = framebuffer_regs();
        regs.set(index::VIEWPORT_CORNER, (4 << 16) | 2);
        let (mut rasterizer, _mem) = rasterizer(&regs);
        draw_one(&mut rasterizer, &regs);
        assert_eq!(
            rasterizer.pipeline_state().viewport,
            Viewport {
                x: 2,
                y: 4,
                width: 64,
                height: 32
            }
        );
    }

    #[test]
    fn test_viewport_truncates_before_doubling() {
        let mut regs = framebuffer_regs();
        regs.set(index::VIEWPORT_SIZE_X, f32_to_float24(120.5));
        regs.set(index::VIEWPORT_SIZE_Y, f32_to_float24(15.75));
        let (mut rasterizer, _mem) = rasterizer(&regs);
        draw_one(&mut rasterizer, &regs);

        let viewport = rasterizer.pipeline_state().viewport;
        assert_eq!(viewport.width, 240);
        assert_eq!(viewport.height, 30);
    }

    #[test]
    fn test_uniforms_uploaded_once_per_change() {
        let mut regs = framebuffer_regs();
        let (mut rasterizer, _mem) = rasterizer(&regs);
        draw_one(&mut rasterizer, &regs);
        draw_one(&mut rasterizer, &regs);
        let uploads = |r: &Rasterizer<NullBackend>| {
            r.backend()
                .calls()
                .iter()
                .filter(|c| matches!(c, HostCall::UploadUniforms(_)))
                .count()
        };
        assert_eq!(uploads(&rasterizer), 1);

        regs.set(index::TEV_STAGES[1] + index::TEV_CONST_COLOR, 0xFF00_00FF);
        assert_eq!(
            rasterizer.notify_register_changed(&regs, index::TEV_STAGES[1] + index::TEV_CONST_COLOR),
            DirtyFlags::CONST_COLOR
        );
        draw_one(&mut rasterizer, &regs);
        assert_eq!(uploads(&rasterizer), 2);
        assert_eq!(rasterizer.uniforms().data().const_color[1], [1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_shader_switch_on_tev_change() {
        let mut regs = framebuffer_regs();
        let (mut rasterizer, _mem) = rasterizer(&regs);
        draw_one(&mut rasterizer, &regs);
        let first = rasterizer.pipeline_state().program;
        assert_eq!(rasterizer.shader_cache().len(), 1);

        // Stage 0 color op: Modulate
        regs.set(index::TEV_STAGES[0] + index::TEV_OPS, 1);
        rasterizer.notify_register_changed(&regs, index::TEV_STAGES[0] + index::TEV_OPS);
        draw_one(&mut rasterizer, &regs);
        assert_ne!(rasterizer.pipeline_state().program, first);
        assert_eq!(rasterizer.shader_cache().len(), 2);

        // Back to the original configuration reuses the first variant
        regs.set(index::TEV_STAGES[0] + index::TEV_OPS, 0);
        rasterizer.notify_register_changed(&regs, index::TEV_STAGES[0] + index::TEV_OPS);
        draw_one(&mut rasterizer, &regs);
        assert_eq!(rasterizer.pipeline_state().program, first);
        assert_eq!(rasterizer.shader_cache().len(), 2);
    }

    #[test]
    fn test_stencil_requires_d24s8() {
        let mut regs = framebuffer_regs();
        regs.set(index::DEPTH_FORMAT, 0);
        let (mut rasterizer, _mem) = rasterizer(&regs);

        regs.set(index::STENCIL_FUNC, 1 | (0x42 << 16));
        rasterizer.notify_register_changed(&regs, index::STENCIL_FUNC);
        assert!(!rasterizer.pipeline_state().stencil.test_enabled);

        regs.set(index::DEPTH_FORMAT, 3);
        rasterizer.notify_register_changed(&regs, index::DEPTH_FORMAT);
        let stencil = rasterizer.pipeline_state().stencil;
        assert!(stencil.test_enabled);
        assert_eq!(stencil.reference, 0x42);
    }

    #[test]
    fn test_blend_and_depth_sync() {
        let mut regs = framebuffer_regs();
        let (mut rasterizer, _mem) = rasterizer(&regs);

        regs.set(index::COLOR_OPERATION, 1 << 8);
        regs.set(index::ALPHA_BLENDING, (6 << 16) | (7 << 20));
        regs.set(index::DEPTH_COLOR_MASK, 1 | (4 << 4) | (0xF << 8));
        for id in [index::COLOR_OPERATION, index::ALPHA_BLENDING, index::DEPTH_COLOR_MASK] {
            rasterizer.notify_register_changed(&regs, id);
        }

        let state = rasterizer.pipeline_state();
        assert!(state.blend_enabled);
        assert_eq!(state.blend_funcs.src_rgb, BlendFactor::SourceAlpha);
        assert_eq!(state.blend_funcs.dst_rgb, BlendFactor::OneMinusSourceAlpha);
        assert!(state.depth.test_enabled);
        assert_eq!(state.depth.func, CompareFunc::LessThan);
        assert!(!state.depth.write_enabled);
        assert!(state.color_mask.red && state.color_mask.alpha);
    }

    #[test]
    fn test_texture_unit_binding() {
        let mut regs = framebuffer_regs();
        regs.set(index::TEXTURE_UNITS_ENABLE, 0b001);
        regs.set(index::TEXTURE_CONFIG[0] + index::TEXTURE_ADDRESS, TEXTURE_ADDR / 8);
        regs.set(index::TEXTURE_CONFIG[0] + index::TEXTURE_SIZE, (16 << 16) | 16);
        // Nearest filtering, clamp to border on both axes
        regs.set(index::TEXTURE_CONFIG[0] + index::TEXTURE_PARAMS, (1 << 8) | (1 << 12));
        regs.set(index::TEXTURE_CONFIG[0] + index::TEXTURE_BORDER_COLOR, 0xFF00_FF00);
        let (mut rasterizer, _mem) = rasterizer(&regs);
        draw_one(&mut rasterizer, &regs);

        let state = rasterizer.pipeline_state();
        let texture = state.texture_units[0].texture.unwrap();
        assert!(state.texture_units[1].texture.is_none());

        let sampler = state.texture_units[0].sampler.unwrap();
        let sampler_state = rasterizer.backend().sampler_state(sampler).unwrap();
        assert_eq!(sampler_state.wrap_s, WrapMode::ClampToBorder);
        assert_eq!(sampler_state.border_color, 0xFF00_FF00);
        assert!(rasterizer
            .backend()
            .calls()
            .contains(&HostCall::BindTexture(0, Some(texture))));
    }

    #[test]
    fn test_unsupported_texture_is_unbound() {
        let mut regs = framebuffer_regs();
        regs.set(index::TEXTURE_UNITS_ENABLE, 0b001);
        regs.set(index::TEXTURE_CONFIG[0] + index::TEXTURE_ADDRESS, TEXTURE_ADDR / 8);
        regs.set(index::TEXTURE_CONFIG[0] + index::TEXTURE_SIZE, (8 << 16) | 8);
        regs.set(index::TEXTURE_FORMAT[0], 15);
        let (mut rasterizer, _mem) = rasterizer(&regs);
        draw_one(&mut rasterizer, &regs);

        assert!(rasterizer.is_hw_enabled());
        assert!(rasterizer.pipeline_state().texture_units[0].texture.is_none());
        assert_eq!(rasterizer.backend().draw_calls(), 1);
    }

    #[test]
    fn test_maximum_texture_size_is_unbound() {
        let mut regs = framebuffer_regs();
        regs.set(index::TEXTURE_UNITS_ENABLE, 0b001);
        regs.set(index::TEXTURE_CONFIG[0] + index::TEXTURE_ADDRESS, TEXTURE_ADDR / 8);
        regs.set(index::TEXTURE_CONFIG[0] + index::TEXTURE_SIZE, 0xFFFF_FFFF);
        regs.set(index::TEXTURE_FORMAT[0], 0);
        let (mut rasterizer, _mem) = rasterizer(&regs);
        draw_one(&mut rasterizer, &regs);

        // 2047x2047 RGBA8 runs past the end of guest memory
        assert!(rasterizer.is_hw_enabled());
        assert!(rasterizer.pipeline_state().texture_units[0].texture.is_none());
        assert!(rasterizer.surface_cache().surface(TEXTURE_ADDR).is_none());
        assert_eq!(rasterizer.backend().draw_calls(), 1);
    }

    #[test]
    fn test_pre_read_flushes_render_target() {
        let regs = framebuffer_regs();
        let (mut rasterizer, mem) = rasterizer(&regs);
        draw_one(&mut rasterizer, &regs);

        let texture = rasterizer.pipeline_state().framebuffer.color.unwrap();
        let red = crate::backend::pixel::Texels::Color(vec![[0xFF, 0, 0, 0xFF]; 64 * 32]);
        rasterizer.backend_mut().write_texels(texture, red).unwrap();

        rasterizer.notify_pre_read(COLOR_ADDR, 4);
        assert!(!rasterizer.surface_cache().surface(COLOR_ADDR).unwrap().dirty);
        // RGBA8 color buffers are stored ABGR in guest memory
        assert_eq!(mem.read_vec(COLOR_ADDR, 4).unwrap(), vec![0xFF, 0, 0, 0xFF]);
    }

    #[test]
    fn test_guest_write_invalidates() {
        let regs = framebuffer_regs();
        let (mut rasterizer, mem) = rasterizer(&regs);
        draw_one(&mut rasterizer, &regs);
        rasterizer.flush_all_surfaces();
        assert_eq!(rasterizer.surface_cache().len(), 2);

        mem.write_u32(COLOR_ADDR + 0x40, 0x1234_5678).unwrap();
        rasterizer.notify_flush(COLOR_ADDR + 0x40, 4);
        assert!(rasterizer.surface_cache().surface(COLOR_ADDR).is_none());
        assert!(rasterizer.pipeline_state().framebuffer.color.is_none());

        // Next draw picks up the new bytes
        draw_one(&mut rasterizer, &regs);
        assert!(rasterizer.surface_cache().surface(COLOR_ADDR).is_some());
    }

    #[test]
    fn test_host_failure_disables_until_reset() {
        let mut regs = framebuffer_regs();
        let (mut rasterizer, _mem) = rasterizer(&regs);
        draw_one(&mut rasterizer, &regs);
        assert!(rasterizer.is_hw_enabled());

        // Lose the depth texture behind the cache's back, then force a framebuffer change
        let depth = rasterizer.pipeline_state().framebuffer.depth.unwrap();
        rasterizer.backend_mut().delete_texture(depth);
        regs.set(index::COLOR_BUFFER_ADDRESS, 0x3_0000 / 8);
        draw_one(&mut rasterizer, &regs);
        assert!(!rasterizer.is_hw_enabled());

        // Everything is ignored while disabled
        assert_eq!(rasterizer.notify_register_changed(&regs, index::CULL_MODE), DirtyFlags::empty());
        let draws = rasterizer.backend().draw_calls();
        draw_one(&mut rasterizer, &regs);
        assert_eq!(rasterizer.backend().draw_calls(), draws);

        rasterizer.reset(&regs);
        assert!(rasterizer.is_hw_enabled());
        assert!(rasterizer.surface_cache().is_empty());
        draw_one(&mut rasterizer, &regs);
        assert_eq!(rasterizer.backend().draw_calls(), draws + 1);
    }

    #[test]
    fn test_reset_resyncs_everything() {
        let regs = framebuffer_regs();
        let (mut rasterizer, _mem) = rasterizer(&regs);
        draw_one(&mut rasterizer, &regs);
        rasterizer.backend_mut().clear_calls();

        rasterizer.reset(&regs);
        assert!(rasterizer.surface_cache().is_empty());
        draw_one(&mut rasterizer, &regs);
        let calls = rasterizer.backend().calls();
        for expected in [
            HostCall::SetCullState(CullState::default()),
            HostCall::SetBlendEnabled(false),
            HostCall::SetDepthState(rasterizer.pipeline_state().depth),
        ] {
            assert!(calls.contains(&expected), "missing {:?}", expected);
        }
        assert!(calls.iter().any(|c| matches!(c, HostCall::UploadUniforms(_))));
    }

    #[test]
    fn test_disabled_renderer_is_inert() {
        let regs = framebuffer_regs();
        let config = GpuConfig {
            use_hw_renderer: false,
            ..GpuConfig::default()
        };
        let mut rasterizer = Rasterizer::new(Box::new(NullBackend::new()), memory(), &config);
        rasterizer.init(&regs).unwrap();
        draw_one(&mut rasterizer, &regs);
        rasterizer.notify_register_changed(&regs, index::CULL_MODE);
        rasterizer.flush_all_surfaces();

        assert!(!rasterizer.backend().is_initialized());
        assert!(rasterizer.backend().calls().is_empty());
    }
}
