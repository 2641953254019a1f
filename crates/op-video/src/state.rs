//! Host pipeline state mirror
//!
//! [`PipelineState`] holds what the rasterizer wants the host to have set.
//! [`StateTracker`] remembers what was last pushed and only forwards the
//! groups that changed.

use op_core::error::VideoError;

use crate::backend::{
    BlendFuncs, ColorMask, CullState, DepthState, FramebufferAttachments, GraphicsBackend, ProgramHandle,
    SamplerHandle, StencilState, TextureHandle, Viewport,
};
use crate::color::rgba8_to_f32;
use crate::pica::regs::NUM_TEXTURE_UNITS;
use crate::pica::LogicOp;

/// Texture and sampler bound to one texture unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureUnitState {
    pub texture: Option<TextureHandle>,
    pub sampler: Option<SamplerHandle>,
}

/// Host fixed-function state controlled by the rasterizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineState {
    pub cull: CullState,
    pub blend_enabled: bool,
    pub blend_funcs: BlendFuncs,
    /// RGBA8 with red in the low byte
    pub blend_color: u32,
    pub logic_op: LogicOp,
    pub stencil: StencilState,
    pub depth: DepthState,
    pub color_mask: ColorMask,
    pub viewport: Viewport,
    pub framebuffer: FramebufferAttachments,
    pub program: Option<ProgramHandle>,
    pub texture_units: [TextureUnitState; NUM_TEXTURE_UNITS],
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            cull: CullState::default(),
            blend_enabled: false,
            blend_funcs: BlendFuncs::default(),
            blend_color: 0,
            logic_op: LogicOp::Copy,
            stencil: StencilState::default(),
            depth: DepthState::default(),
            color_mask: ColorMask::default(),
            viewport: Viewport::default(),
            framebuffer: FramebufferAttachments::default(),
            program: None,
            texture_units: [TextureUnitState::default(); NUM_TEXTURE_UNITS],
        }
    }
}

impl PipelineState {
    /// Push every group that differs from `applied`, or all of them when
    /// nothing has been applied yet.
    pub fn apply_to<B: GraphicsBackend + ?Sized>(
        &self,
        applied: Option<&PipelineState>,
        backend: &mut B,
    ) -> Result<(), VideoError> {
        let changed = |f: &dyn Fn(&PipelineState) -> bool| applied.map_or(true, |a| !f(a));

        if changed(&|a: &PipelineState| a.framebuffer == self.framebuffer) {
            backend.set_framebuffer(&self.framebuffer)?;
        }
        if changed(&|a: &PipelineState| a.program == self.program) {
            backend.use_program(self.program);
        }
        if changed(&|a: &PipelineState| a.cull == self.cull) {
            backend.set_cull_state(&self.cull);
        }
        if changed(&|a: &PipelineState| a.blend_enabled == self.blend_enabled) {
            backend.set_blend_enabled(self.blend_enabled);
        }
        if changed(&|a: &PipelineState| a.blend_funcs == self.blend_funcs) {
            backend.set_blend_funcs(&self.blend_funcs);
        }
        if changed(&|a: &PipelineState| a.blend_color == self.blend_color) {
            backend.set_blend_color(rgba8_to_f32(self.blend_color));
        }
        if changed(&|a: &PipelineState| a.logic_op == self.logic_op) {
            backend.set_logic_op(self.logic_op);
        }
        if changed(&|a: &PipelineState| a.stencil == self.stencil) {
            backend.set_stencil_state(&self.stencil);
        }
        if changed(&|a: &PipelineState| a.depth == self.depth) {
            backend.set_depth_state(&self.depth);
        }
        if changed(&|a: &PipelineState| a.color_mask == self.color_mask) {
            backend.set_color_mask(&self.color_mask);
        }
        if changed(&|a: &PipelineState| a.viewport == self.viewport) {
            backend.set_viewport(&self.viewport);
        }

        for (unit, state) in self.texture_units.iter().enumerate() {
            let previous = applied.map(|a| a.texture_units[unit]);
            if previous.map(|p| p.texture) != Some(state.texture) {
                backend.bind_texture(unit as u32, state.texture);
            }
            if previous.map(|p| p.sampler) != Some(state.sampler) {
                backend.bind_sampler(unit as u32, state.sampler);
            }
        }

        Ok(())
    }

    /// Drop every reference to a texture that no longer exists
    pub fn forget_texture(&mut self, texture: TextureHandle) {
        let clear = |slot: &mut Option<TextureHandle>| {
            if *slot == Some(texture) {
                *slot = None;
            }
        };
        clear(&mut self.framebuffer.color);
        clear(&mut self.framebuffer.depth);
        clear(&mut self.framebuffer.stencil);
        for unit in &mut self.texture_units {
            clear(&mut unit.texture);
        }
    }
}

/// Wanted state plus the last state pushed to the host
#[derive(Debug, Default)]
pub struct StateTracker {
    current: PipelineState,
    applied: Option<PipelineState>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &PipelineState {
        &self.current
    }

    pub fn current_mut(&mut self) -> &mut PipelineState {
        &mut self.current
    }

    /// Push pending changes to the backend.
    ///
    /// On failure the applied snapshot is dropped so the next call pushes
    /// everything again.
    pub fn apply<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) -> Result<(), VideoError> {
        if self.applied.as_ref() == Some(&self.current) {
            return Ok(());
        }
        match self.current.apply_to(self.applied.as_ref(), backend) {
            Ok(()) => {
                self.applied = Some(self.current.clone());
                Ok(())
            }
            Err(e) => {
                self.applied = None;
                Err(e)
            }
        }
    }

    /// Forget what the host has; the next apply pushes every group
    pub fn invalidate(&mut self) {
        self.applied = None;
    }

    pub fn forget_texture(&mut self, texture: TextureHandle) {
        self.current.forget_texture(texture);
        if let Some(applied) = &mut self.applied {
            applied.forget_texture(texture);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::{HostCall, NullBackend};
    use crate::backend::FrontFace;

    #[test]
    fn test_first_apply_pushes_everything() {
        let mut backend = NullBackend::new();
        let mut tracker = StateTracker::new();
        tracker.apply(&mut backend).unwrap();
        // 11 fixed-function groups plus texture and sampler per unit
        assert_eq!(backend.calls().len(), 11 + 2 * NUM_TEXTURE_UNITS);
    }

    #[test]
    fn test_apply_only_pushes_changes() {
        let mut backend = NullBackend::new();
        let mut tracker = StateTracker::new();
        tracker.apply(&mut backend).unwrap();
        backend.clear_calls();

        tracker.current_mut().cull = CullState {
            enabled: true,
            front_face: FrontFace::Clockwise,
        };
        tracker.apply(&mut backend).unwrap();
        assert_eq!(
            backend.calls(),
            &[HostCall::SetCullState(CullState {
                enabled: true,
                front_face: FrontFace::Clockwise,
            })]
        );

        backend.clear_calls();
        tracker.apply(&mut backend).unwrap();
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_invalidate_forces_full_push() {
        let mut backend = NullBackend::new();
        let mut tracker = StateTracker::new();
        tracker.apply(&mut backend).unwrap();
        backend.clear_calls();
        tracker.invalidate();
        tracker.apply(&mut backend).unwrap();
        assert!(backend.calls().contains(&HostCall::SetLogicOp(LogicOp::Copy)));
    }

    #[test]
    fn test_forget_texture() {
        let mut tracker = StateTracker::new();
        let tex = TextureHandle(7);
        tracker.current_mut().texture_units[1].texture = Some(tex);
        tracker.current_mut().framebuffer.color = Some(tex);
        tracker.forget_texture(tex);
        assert_eq!(tracker.current().texture_units[1].texture, None);
        assert_eq!(tracker.current().framebuffer.color, None);
    }

    #[test]
    fn test_failed_apply_retries_everything() {
        let mut backend = NullBackend::new();
        let mut tracker = StateTracker::new();
        tracker.current_mut().framebuffer.color = Some(TextureHandle(99));
        assert!(tracker.apply(&mut backend).is_err());

        tracker.current_mut().framebuffer.color = None;
        backend.clear_calls();
        tracker.apply(&mut backend).unwrap();
        assert!(backend.calls().contains(&HostCall::SetBlendEnabled(false)));
    }
}
