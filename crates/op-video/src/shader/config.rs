//! Shader cache key

use crate::pica::regs::{TevCombinerBufferInput, NUM_TEV_STAGES};
use crate::pica::{CompareFunc, Regs, TevStageConfig};

/// Every register field that changes the generated fragment shader.
///
/// Constant colors live in the uniform block and are excluded, so configs
/// differing only in constants share one program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineConfig {
    /// `Always` when the alpha test is disabled
    pub alpha_test_func: CompareFunc,
    /// TEV stages with `const_color` cleared
    pub tev_stages: [TevStageConfig; NUM_TEV_STAGES],
    pub combiner_buffer_input: TevCombinerBufferInput,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            alpha_test_func: CompareFunc::Always,
            tev_stages: [TevStageConfig::default(); NUM_TEV_STAGES],
            combiner_buffer_input: TevCombinerBufferInput::default(),
        }
    }
}

/// Three 4-bit color sources (bits 0-11) and three alpha sources (16-27)
const SOURCES_MASK: u32 = 0x0FFF_0FFF;
/// Three 4-bit color modifiers (bits 0-11) and three 3-bit alpha modifiers (12-22)
const MODIFIERS_MASK: u32 = 0x0077_7FFF;
/// Color operation (bits 0-3) and alpha operation (16-19)
const OPS_MASK: u32 = 0x000F_000F;
/// Color scale (bits 0-1) and alpha scale (16-17)
const SCALES_MASK: u32 = 0x0003_0003;

/// The fields of `stage` the shader generator reads
fn stage_key(stage: TevStageConfig) -> TevStageConfig {
    TevStageConfig {
        sources_raw: stage.sources_raw & SOURCES_MASK,
        modifiers_raw: stage.modifiers_raw & MODIFIERS_MASK,
        ops_raw: stage.ops_raw & OPS_MASK,
        scales_raw: stage.scales_raw & SCALES_MASK,
        const_color: 0,
    }
}

impl PipelineConfig {
    /// Snapshot the shader-relevant state of `regs`
    pub fn from_regs(regs: &Regs) -> Self {
        let alpha_test = regs.alpha_test();
        let tev_stages = regs.tev_stages().map(stage_key);

        Self {
            alpha_test_func: if alpha_test.enable {
                alpha_test.func
            } else {
                CompareFunc::Always
            },
            tev_stages,
            combiner_buffer_input: regs.tev_combiner_buffer_input(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pica::index;

    #[test]
    fn test_constants_excluded() {
        let mut regs = Regs::new();
        let before = PipelineConfig::from_regs(&regs);
        regs.set(index::TEV_STAGES[2] + index::TEV_CONST_COLOR, 0xFF00_FF00);
        assert_eq!(PipelineConfig::from_regs(&regs), before);
    }

    #[test]
    fn test_disabled_alpha_test_is_always() {
        let mut regs = Regs::new();
        // LessThan, disabled
        regs.set(index::ALPHA_TEST, 4 << 4);
        assert_eq!(PipelineConfig::from_regs(&regs).alpha_test_func, CompareFunc::Always);
        regs.set(index::ALPHA_TEST, (4 << 4) | 1);
        assert_eq!(PipelineConfig::from_regs(&regs).alpha_test_func, CompareFunc::LessThan);
    }

    #[test]
    fn test_stage_fields_distinguish() {
        let mut regs = Regs::new();
        let base = PipelineConfig::from_regs(&regs);
        regs.set(index::TEV_STAGES[5] + index::TEV_SCALES, 1);
        assert_ne!(PipelineConfig::from_regs(&regs), base);

        let mut regs = Regs::new();
        regs.set(index::TEV_COMBINER_BUFFER_INPUT, 1 << 8);
        assert_ne!(PipelineConfig::from_regs(&regs), base);
    }

    #[test]
    fn test_unused_stage_bits_ignored() {
        let mut regs = Regs::new();
        let stage = index::TEV_STAGES[1];
        regs.set(stage + index::TEV_SOURCES, 0x3 | (0x1 << 16));
        regs.set(stage + index::TEV_MODIFIERS, 0x1 | (0x2 << 12));
        regs.set(stage + index::TEV_OPS, 0x1 | (0x1 << 16));
        regs.set(stage + index::TEV_SCALES, 0x1 | (0x2 << 16));
        let base = PipelineConfig::from_regs(&regs);

        regs.set(stage + index::TEV_SOURCES, 0xF000_F000 | 0x3 | (0x1 << 16));
        regs.set(stage + index::TEV_MODIFIERS, 0xFF88_8000 | 0x1 | (0x2 << 12));
        regs.set(stage + index::TEV_OPS, 0xFFF0_FFF0 | 0x1 | (0x1 << 16));
        regs.set(stage + index::TEV_SCALES, 0xFFFC_FFFC | 0x1 | (0x2 << 16));
        assert_eq!(PipelineConfig::from_regs(&regs), base);

        // A used field still distinguishes
        regs.set(stage + index::TEV_MODIFIERS, 0x1 | (0x3 << 12));
        assert_ne!(PipelineConfig::from_regs(&regs), base);
    }
}
