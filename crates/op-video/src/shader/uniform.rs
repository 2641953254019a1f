//! Per-draw uniform block

use bytemuck::{Pod, Zeroable};

use crate::backend::GraphicsBackend;
use crate::pica::regs::NUM_TEV_STAGES;

/// Contents of the `shader_data` block, std140 layout
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformData {
    pub alphatest_ref: i32,
    pub _pad: [i32; 3],
    pub const_color: [[f32; 4]; NUM_TEV_STAGES],
    pub tev_combiner_buffer_color: [f32; 4],
}

impl Default for UniformData {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Uniform values plus a dirty flag; uploaded at most once per draw
#[derive(Debug, Clone)]
pub struct UniformBlock {
    data: UniformData,
    dirty: bool,
}

impl Default for UniformBlock {
    fn default() -> Self {
        Self {
            data: UniformData::default(),
            dirty: true,
        }
    }
}

impl UniformBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &UniformData {
        &self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn set_alphatest_ref(&mut self, value: i32) {
        if self.data.alphatest_ref != value {
            self.data.alphatest_ref = value;
            self.dirty = true;
        }
    }

    pub fn set_const_color(&mut self, stage: usize, color: [f32; 4]) {
        if self.data.const_color[stage] != color {
            self.data.const_color[stage] = color;
            self.dirty = true;
        }
    }

    pub fn set_combiner_buffer_color(&mut self, color: [f32; 4]) {
        if self.data.tev_combiner_buffer_color != color {
            self.data.tev_combiner_buffer_color = color;
            self.dirty = true;
        }
    }

    /// Upload if dirty. Returns whether an upload happened.
    pub fn upload<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) -> bool {
        if !self.dirty {
            return false;
        }
        backend.upload_uniforms(bytemuck::bytes_of(&self.data));
        self.dirty = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullBackend;

    #[test]
    fn test_std140_size() {
        assert_eq!(std::mem::size_of::<UniformData>(), 128);
        assert_eq!(std::mem::offset_of!(UniformData, const_color), 16);
        assert_eq!(std::mem::offset_of!(UniformData, tev_combiner_buffer_color), 112);
    }

    #[test]
    fn test_unchanged_values_stay_clean() {
        let mut block = UniformBlock::new();
        let mut backend = NullBackend::new();
        assert!(block.upload(&mut backend));
        assert!(!block.upload(&mut backend));

        block.set_alphatest_ref(0);
        block.set_const_color(3, [0.0; 4]);
        assert!(!block.is_dirty());

        block.set_const_color(3, [1.0, 0.0, 0.0, 1.0]);
        assert!(block.upload(&mut backend));
        assert_eq!(backend.uniforms().len(), 128);
        assert_eq!(&backend.uniforms()[64..68], &1.0f32.to_le_bytes());
    }
}
