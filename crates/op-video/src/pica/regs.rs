//! PICA register file
//!
//! The register file is a plain value. The rasterizer never holds on to it;
//! every operation that depends on register state takes `&Regs`.

use super::float24::float24_to_f32;
use super::types::*;

/// Number of 32-bit registers in the file
pub const NUM_REGS: usize = 0x300;

/// Number of TEV combiner stages
pub const NUM_TEV_STAGES: usize = 6;

/// Number of texture units with their own configuration registers
pub const NUM_TEXTURE_UNITS: usize = 3;

/// Register indices
pub mod index {
    pub const CULL_MODE: u32 = 0x40;
    pub const VIEWPORT_SIZE_X: u32 = 0x41;
    pub const VIEWPORT_SIZE_Y: u32 = 0x43;
    pub const VIEWPORT_CORNER: u32 = 0x68;

    pub const TEXTURE_UNITS_ENABLE: u32 = 0x80;
    pub const TEXTURE_CONFIG: [u32; 3] = [0x81, 0x91, 0x99];
    pub const TEXTURE_FORMAT: [u32; 3] = [0x8E, 0x96, 0x9E];

    /// Offsets inside a texture configuration block
    pub const TEXTURE_BORDER_COLOR: u32 = 0;
    pub const TEXTURE_SIZE: u32 = 1;
    pub const TEXTURE_PARAMS: u32 = 2;
    pub const TEXTURE_ADDRESS: u32 = 4;

    pub const TEV_STAGES: [u32; 6] = [0xC0, 0xC8, 0xD0, 0xD8, 0xF0, 0xF8];

    /// Offsets inside a TEV stage block
    pub const TEV_SOURCES: u32 = 0;
    pub const TEV_MODIFIERS: u32 = 1;
    pub const TEV_OPS: u32 = 2;
    pub const TEV_CONST_COLOR: u32 = 3;
    pub const TEV_SCALES: u32 = 4;

    pub const TEV_COMBINER_BUFFER_INPUT: u32 = 0xE0;
    pub const TEV_COMBINER_BUFFER_COLOR: u32 = 0xFD;

    pub const COLOR_OPERATION: u32 = 0x100;
    pub const ALPHA_BLENDING: u32 = 0x101;
    pub const LOGIC_OP: u32 = 0x102;
    pub const BLEND_CONST: u32 = 0x103;
    pub const ALPHA_TEST: u32 = 0x104;
    pub const STENCIL_FUNC: u32 = 0x105;
    pub const STENCIL_OP: u32 = 0x106;
    pub const DEPTH_COLOR_MASK: u32 = 0x107;

    pub const DEPTH_FORMAT: u32 = 0x116;
    pub const COLOR_FORMAT: u32 = 0x117;
    pub const DEPTH_BUFFER_ADDRESS: u32 = 0x11C;
    pub const COLOR_BUFFER_ADDRESS: u32 = 0x11D;
    pub const FRAMEBUFFER_DIMENSIONS: u32 = 0x11E;
}

#[inline]
fn bits(value: u32, shift: u32, width: u32) -> u32 {
    (value >> shift) & ((1u32 << width) - 1)
}

/// Combiner output scale. The reserved encoding 3 scales by one.
#[inline]
fn multiplier(scale: u32) -> u32 {
    match scale {
        0..=2 => 1 << scale,
        _ => 1,
    }
}

#[inline]
fn sign_extend(value: u32, width: u32) -> i32 {
    let shift = 32 - width;
    ((value << shift) as i32) >> shift
}

/// Physical addresses are stored in units of 8 bytes
#[inline]
fn decode_address(raw: u32) -> u32 {
    raw.wrapping_mul(8)
}

fn decode_or<T: Copy + std::fmt::Debug>(
    raw: u32,
    what: &str,
    fallback: T,
    decode: fn(u32) -> Option<T>,
) -> T {
    decode(raw).unwrap_or_else(|| {
        tracing::warn!("Unknown {} encoding {}, using {:?}", what, raw, fallback);
        fallback
    })
}

/// Configuration of one texture unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureConfig {
    pub address: u32,
    pub width: u32,
    pub height: u32,
    pub mag_filter: TextureFilter,
    pub min_filter: TextureFilter,
    pub wrap_s: WrapMode,
    pub wrap_t: WrapMode,
    /// RGBA8 with red in the low byte
    pub border_color: u32,
}

/// Texture unit configuration including enable bit and format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullTextureConfig {
    pub enabled: bool,
    pub config: TextureConfig,
    /// `None` for encodings outside the known format set
    pub format: Option<TextureFormat>,
    pub raw_format: u32,
}

/// One TEV combiner stage, kept in register encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TevStageConfig {
    pub sources_raw: u32,
    pub modifiers_raw: u32,
    pub ops_raw: u32,
    pub scales_raw: u32,
    /// RGBA8 with red in the low byte
    pub const_color: u32,
}

impl TevStageConfig {
    pub fn color_source(&self, input: usize) -> Option<TevSource> {
        TevSource::from_raw(bits(self.sources_raw, 4 * input as u32, 4))
    }

    pub fn alpha_source(&self, input: usize) -> Option<TevSource> {
        TevSource::from_raw(bits(self.sources_raw, 16 + 4 * input as u32, 4))
    }

    pub fn color_modifier(&self, input: usize) -> Option<TevColorModifier> {
        TevColorModifier::from_raw(bits(self.modifiers_raw, 4 * input as u32, 4))
    }

    pub fn alpha_modifier(&self, input: usize) -> Option<TevAlphaModifier> {
        TevAlphaModifier::from_raw(bits(self.modifiers_raw, 12 + 4 * input as u32, 3))
    }

    pub fn color_op(&self) -> Option<TevOperation> {
        TevOperation::from_raw(bits(self.ops_raw, 0, 4))
    }

    pub fn alpha_op(&self) -> Option<TevOperation> {
        TevOperation::from_raw(bits(self.ops_raw, 16, 4))
    }

    pub fn color_multiplier(&self) -> u32 {
        multiplier(bits(self.scales_raw, 0, 2))
    }

    pub fn alpha_multiplier(&self) -> u32 {
        multiplier(bits(self.scales_raw, 16, 2))
    }

    /// A stage that forwards the previous stage's output unchanged
    pub fn is_pass_through(&self) -> bool {
        self.color_op() == Some(TevOperation::Replace)
            && self.alpha_op() == Some(TevOperation::Replace)
            && self.color_source(0) == Some(TevSource::Previous)
            && self.alpha_source(0) == Some(TevSource::Previous)
            && self.color_modifier(0) == Some(TevColorModifier::SourceColor)
            && self.alpha_modifier(0) == Some(TevAlphaModifier::SourceAlpha)
            && self.color_multiplier() == 1
            && self.alpha_multiplier() == 1
    }
}

/// Combiner buffer update selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TevCombinerBufferInput {
    pub update_mask_rgb: u32,
    pub update_mask_a: u32,
}

impl TevCombinerBufferInput {
    pub fn updates_color(&self, stage: usize) -> bool {
        stage < 4 && self.update_mask_rgb & (1 << stage) != 0
    }

    pub fn updates_alpha(&self, stage: usize) -> bool {
        stage < 4 && self.update_mask_a & (1 << stage) != 0
    }
}

/// Blend equations and factors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlphaBlending {
    pub equation_rgb: BlendEquation,
    pub equation_a: BlendEquation,
    pub factor_source_rgb: BlendFactor,
    pub factor_dest_rgb: BlendFactor,
    pub factor_source_a: BlendFactor,
    pub factor_dest_a: BlendFactor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlphaTest {
    pub enable: bool,
    pub func: CompareFunc,
    pub reference: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StencilTest {
    pub enable: bool,
    pub func: CompareFunc,
    pub write_mask: u8,
    pub reference_value: u8,
    pub input_mask: u8,
    pub action_stencil_fail: StencilAction,
    pub action_depth_fail: StencilAction,
    pub action_depth_pass: StencilAction,
}

/// Depth test and color/depth write masks (register 0x107)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthColorMask {
    pub depth_test_enable: bool,
    pub depth_test_func: CompareFunc,
    pub red_enable: bool,
    pub green_enable: bool,
    pub blue_enable: bool,
    pub alpha_enable: bool,
    pub depth_write_enable: bool,
}

/// Framebuffer attachments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferConfig {
    pub color_address: u32,
    pub depth_address: u32,
    pub width: u32,
    pub height: u32,
    pub color_format: Option<ColorFormat>,
    pub depth_format: Option<DepthFormat>,
}

/// The PICA register file
#[derive(Clone, PartialEq, Eq)]
pub struct Regs {
    raw: Box<[u32]>,
}

impl Default for Regs {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Regs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nonzero = self.raw.iter().filter(|&&v| v != 0).count();
        f.debug_struct("Regs").field("nonzero", &nonzero).finish()
    }
}

impl Regs {
    /// Create a zeroed register file
    pub fn new() -> Self {
        Self {
            raw: vec![0u32; NUM_REGS].into_boxed_slice(),
        }
    }

    /// Read a raw register. Out-of-range indices read as zero.
    pub fn get(&self, id: u32) -> u32 {
        self.raw.get(id as usize).copied().unwrap_or(0)
    }

    /// Write a raw register. Returns false for out-of-range indices.
    pub fn set(&mut self, id: u32, value: u32) -> bool {
        match self.raw.get_mut(id as usize) {
            Some(reg) => {
                *reg = value;
                true
            }
            None => {
                tracing::warn!("Write to out-of-range register 0x{:x}", id);
                false
            }
        }
    }

    pub fn cull_mode(&self) -> CullMode {
        decode_or(
            bits(self.get(index::CULL_MODE), 0, 2),
            "cull mode",
            CullMode::KeepAll,
            CullMode::from_raw,
        )
    }

    /// Viewport half-width
    pub fn viewport_size_x(&self) -> f32 {
        float24_to_f32(self.get(index::VIEWPORT_SIZE_X))
    }

    /// Viewport half-height
    pub fn viewport_size_y(&self) -> f32 {
        float24_to_f32(self.get(index::VIEWPORT_SIZE_Y))
    }

    /// Viewport origin as signed 10-bit coordinates
    pub fn viewport_corner(&self) -> (i32, i32) {
        let raw = self.get(index::VIEWPORT_CORNER);
        (
            sign_extend(bits(raw, 0, 10), 10),
            sign_extend(bits(raw, 16, 10), 10),
        )
    }

    pub fn texture(&self, unit: usize) -> FullTextureConfig {
        let base = index::TEXTURE_CONFIG[unit];
        let size = self.get(base + index::TEXTURE_SIZE);
        let params = self.get(base + index::TEXTURE_PARAMS);
        let raw_format = bits(self.get(index::TEXTURE_FORMAT[unit]), 0, 4);

        FullTextureConfig {
            enabled: bits(self.get(index::TEXTURE_UNITS_ENABLE), unit as u32, 1) != 0,
            config: TextureConfig {
                address: decode_address(self.get(base + index::TEXTURE_ADDRESS)),
                width: bits(size, 16, 11),
                height: bits(size, 0, 11),
                mag_filter: decode_or(bits(params, 1, 1), "filter", TextureFilter::Nearest, TextureFilter::from_raw),
                min_filter: decode_or(bits(params, 2, 1), "filter", TextureFilter::Nearest, TextureFilter::from_raw),
                wrap_t: decode_or(bits(params, 8, 2), "wrap mode", WrapMode::ClampToEdge, WrapMode::from_raw),
                wrap_s: decode_or(bits(params, 12, 2), "wrap mode", WrapMode::ClampToEdge, WrapMode::from_raw),
                border_color: self.get(base + index::TEXTURE_BORDER_COLOR),
            },
            format: TextureFormat::from_raw(raw_format),
            raw_format,
        }
    }

    pub fn textures(&self) -> [FullTextureConfig; NUM_TEXTURE_UNITS] {
        [self.texture(0), self.texture(1), self.texture(2)]
    }

    pub fn tev_stage(&self, stage: usize) -> TevStageConfig {
        let base = index::TEV_STAGES[stage];
        TevStageConfig {
            sources_raw: self.get(base + index::TEV_SOURCES),
            modifiers_raw: self.get(base + index::TEV_MODIFIERS),
            ops_raw: self.get(base + index::TEV_OPS),
            scales_raw: self.get(base + index::TEV_SCALES),
            const_color: self.get(base + index::TEV_CONST_COLOR),
        }
    }

    pub fn tev_stages(&self) -> [TevStageConfig; NUM_TEV_STAGES] {
        std::array::from_fn(|stage| self.tev_stage(stage))
    }

    pub fn tev_combiner_buffer_input(&self) -> TevCombinerBufferInput {
        let raw = self.get(index::TEV_COMBINER_BUFFER_INPUT);
        TevCombinerBufferInput {
            update_mask_rgb: bits(raw, 8, 4),
            update_mask_a: bits(raw, 12, 4),
        }
    }

    /// RGBA8 with red in the low byte
    pub fn tev_combiner_buffer_color(&self) -> u32 {
        self.get(index::TEV_COMBINER_BUFFER_COLOR)
    }

    pub fn alphablend_enabled(&self) -> bool {
        bits(self.get(index::COLOR_OPERATION), 8, 1) != 0
    }

    pub fn alpha_blending(&self) -> AlphaBlending {
        let raw = self.get(index::ALPHA_BLENDING);
        let eq = |shift| decode_or(bits(raw, shift, 8), "blend equation", BlendEquation::Add, BlendEquation::from_raw);
        let factor = |shift, fallback| decode_or(bits(raw, shift, 4), "blend factor", fallback, BlendFactor::from_raw);
        AlphaBlending {
            equation_rgb: eq(0),
            equation_a: eq(8),
            factor_source_rgb: factor(16, BlendFactor::One),
            factor_dest_rgb: factor(20, BlendFactor::Zero),
            factor_source_a: factor(24, BlendFactor::One),
            factor_dest_a: factor(28, BlendFactor::Zero),
        }
    }

    pub fn logic_op(&self) -> LogicOp {
        // All 16 encodings are valid
        decode_or(bits(self.get(index::LOGIC_OP), 0, 4), "logic op", LogicOp::Copy, LogicOp::from_raw)
    }

    /// RGBA8 with red in the low byte
    pub fn blend_const(&self) -> u32 {
        self.get(index::BLEND_CONST)
    }

    pub fn alpha_test(&self) -> AlphaTest {
        let raw = self.get(index::ALPHA_TEST);
        AlphaTest {
            enable: bits(raw, 0, 1) != 0,
            func: decode_or(bits(raw, 4, 3), "compare func", CompareFunc::Always, CompareFunc::from_raw),
            reference: bits(raw, 8, 8) as u8,
        }
    }

    pub fn stencil_test(&self) -> StencilTest {
        let func = self.get(index::STENCIL_FUNC);
        let op = self.get(index::STENCIL_OP);
        let action = |shift| decode_or(bits(op, shift, 3), "stencil action", StencilAction::Keep, StencilAction::from_raw);
        StencilTest {
            enable: bits(func, 0, 1) != 0,
            func: decode_or(bits(func, 4, 3), "compare func", CompareFunc::Always, CompareFunc::from_raw),
            write_mask: bits(func, 8, 8) as u8,
            reference_value: bits(func, 16, 8) as u8,
            input_mask: bits(func, 24, 8) as u8,
            action_stencil_fail: action(0),
            action_depth_fail: action(4),
            action_depth_pass: action(8),
        }
    }

    pub fn depth_color_mask(&self) -> DepthColorMask {
        let raw = self.get(index::DEPTH_COLOR_MASK);
        DepthColorMask {
            depth_test_enable: bits(raw, 0, 1) != 0,
            depth_test_func: decode_or(bits(raw, 4, 3), "compare func", CompareFunc::Always, CompareFunc::from_raw),
            red_enable: bits(raw, 8, 1) != 0,
            green_enable: bits(raw, 9, 1) != 0,
            blue_enable: bits(raw, 10, 1) != 0,
            alpha_enable: bits(raw, 11, 1) != 0,
            depth_write_enable: bits(raw, 12, 1) != 0,
        }
    }

    pub fn framebuffer(&self) -> FramebufferConfig {
        let dims = self.get(index::FRAMEBUFFER_DIMENSIONS);
        FramebufferConfig {
            color_address: decode_address(self.get(index::COLOR_BUFFER_ADDRESS)),
            depth_address: decode_address(self.get(index::DEPTH_BUFFER_ADDRESS)),
            width: bits(dims, 0, 11),
            height: bits(dims, 12, 10) + 1,
            color_format: ColorFormat::from_raw(bits(self.get(index::COLOR_FORMAT), 16, 3)),
            depth_format: DepthFormat::from_raw(bits(self.get(index::DEPTH_FORMAT), 0, 2)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pica::float24::f32_to_float24;

    #[test]
    fn test_out_of_range() {
        let mut regs = Regs::new();
        assert!(!regs.set(NUM_REGS as u32, 1));
        assert_eq!(regs.get(NUM_REGS as u32), 0);
    }

    #[test]
    fn test_viewport() {
        let mut regs = Regs::new();
        regs.set(index::VIEWPORT_SIZE_X, f32_to_float24(200.0));
        regs.set(index::VIEWPORT_SIZE_Y, f32_to_float24(120.0));
        regs.set(index::VIEWPORT_CORNER, (0x3FF << 16) | 8);
        assert_eq!(regs.viewport_size_x(), 200.0);
        assert_eq!(regs.viewport_size_y(), 120.0);
        assert_eq!(regs.viewport_corner(), (8, -1));
    }

    #[test]
    fn test_texture_config() {
        let mut regs = Regs::new();
        regs.set(index::TEXTURE_UNITS_ENABLE, 0b010);
        regs.set(index::TEXTURE_CONFIG[1] + index::TEXTURE_SIZE, (64 << 16) | 32);
        regs.set(index::TEXTURE_CONFIG[1] + index::TEXTURE_PARAMS, (1 << 12) | (3 << 8) | 0b110);
        regs.set(index::TEXTURE_CONFIG[1] + index::TEXTURE_ADDRESS, 0x1800_0000 / 8);
        regs.set(index::TEXTURE_CONFIG[1] + index::TEXTURE_BORDER_COLOR, 0xFF00_00FF);
        regs.set(index::TEXTURE_FORMAT[1], 3);

        let tex = regs.texture(1);
        assert!(tex.enabled);
        assert!(!regs.texture(0).enabled);
        assert_eq!(tex.config.width, 64);
        assert_eq!(tex.config.height, 32);
        assert_eq!(tex.config.address, 0x1800_0000);
        assert_eq!(tex.config.mag_filter, TextureFilter::Linear);
        assert_eq!(tex.config.min_filter, TextureFilter::Linear);
        assert_eq!(tex.config.wrap_s, WrapMode::ClampToBorder);
        assert_eq!(tex.config.wrap_t, WrapMode::MirroredRepeat);
        assert_eq!(tex.config.border_color, 0xFF00_00FF);
        assert_eq!(tex.format, Some(TextureFormat::Rgb565));
    }

    #[test]
    fn test_texture_size_is_eleven_bits() {
        let mut regs = Regs::new();
        regs.set(index::TEXTURE_CONFIG[0] + index::TEXTURE_SIZE, 0xFFFF_FFFF);
        let tex = regs.texture(0);
        assert_eq!(tex.config.width, 0x7FF);
        assert_eq!(tex.config.height, 0x7FF);
    }

    #[test]
    fn test_tev_stage_fields() {
        let mut regs = Regs::new();
        let base = index::TEV_STAGES[4];
        // color sources tex0, primary, constant; alpha source previous
        regs.set(base + index::TEV_SOURCES, 3 | (0 << 4) | (14 << 8) | (15 << 16));
        regs.set(base + index::TEV_MODIFIERS, 1 | (7 << 12));
        regs.set(base + index::TEV_OPS, 4 | (1 << 16));
        regs.set(base + index::TEV_SCALES, 2 | (1 << 16));

        let stage = regs.tev_stage(4);
        assert_eq!(stage.color_source(0), Some(TevSource::Texture0));
        assert_eq!(stage.color_source(1), Some(TevSource::PrimaryColor));
        assert_eq!(stage.color_source(2), Some(TevSource::Constant));
        assert_eq!(stage.alpha_source(0), Some(TevSource::Previous));
        assert_eq!(stage.color_modifier(0), Some(TevColorModifier::OneMinusSourceColor));
        assert_eq!(stage.alpha_modifier(0), Some(TevAlphaModifier::OneMinusSourceBlue));
        assert_eq!(stage.color_op(), Some(TevOperation::Lerp));
        assert_eq!(stage.alpha_op(), Some(TevOperation::Modulate));
        assert_eq!(stage.color_multiplier(), 4);
        assert_eq!(stage.alpha_multiplier(), 2);
        assert!(!stage.is_pass_through());
    }

    #[test]
    fn test_reserved_scale_is_one() {
        let stage = TevStageConfig {
            scales_raw: 3 | (3 << 16),
            ..Default::default()
        };
        assert_eq!(stage.color_multiplier(), 1);
        assert_eq!(stage.alpha_multiplier(), 1);
    }

    #[test]
    fn test_pass_through_stage() {
        let stage = TevStageConfig {
            sources_raw: 15 | (15 << 16),
            ..Default::default()
        };
        assert!(stage.is_pass_through());
    }

    #[test]
    fn test_combiner_buffer_input() {
        let mut regs = Regs::new();
        regs.set(index::TEV_COMBINER_BUFFER_INPUT, (0b0101 << 8) | (0b1000 << 12));
        let input = regs.tev_combiner_buffer_input();
        assert!(input.updates_color(0));
        assert!(!input.updates_color(1));
        assert!(input.updates_color(2));
        assert!(input.updates_alpha(3));
        assert!(!input.updates_alpha(4));
    }

    #[test]
    fn test_output_merger() {
        let mut regs = Regs::new();
        regs.set(index::COLOR_OPERATION, 1 << 8);
        regs.set(index::ALPHA_BLENDING, (7 << 28) | (6 << 24) | (7 << 20) | (6 << 16) | (1 << 8));
        regs.set(index::ALPHA_TEST, 1 | (5 << 4) | (0x80 << 8));
        regs.set(index::STENCIL_FUNC, 1 | (2 << 4) | (0xFF << 8) | (0x42 << 16) | (0x0F << 24));
        regs.set(index::STENCIL_OP, 1 | (2 << 4) | (3 << 8));
        regs.set(index::DEPTH_COLOR_MASK, 1 | (4 << 4) | (0b1011 << 8) | (1 << 12));

        assert!(regs.alphablend_enabled());
        let blend = regs.alpha_blending();
        assert_eq!(blend.equation_rgb, BlendEquation::Add);
        assert_eq!(blend.equation_a, BlendEquation::Subtract);
        assert_eq!(blend.factor_source_rgb, BlendFactor::SourceAlpha);
        assert_eq!(blend.factor_dest_a, BlendFactor::OneMinusSourceAlpha);

        let alpha = regs.alpha_test();
        assert!(alpha.enable);
        assert_eq!(alpha.func, CompareFunc::LessThanOrEqual);
        assert_eq!(alpha.reference, 0x80);

        let stencil = regs.stencil_test();
        assert!(stencil.enable);
        assert_eq!(stencil.func, CompareFunc::Equal);
        assert_eq!(stencil.write_mask, 0xFF);
        assert_eq!(stencil.reference_value, 0x42);
        assert_eq!(stencil.input_mask, 0x0F);
        assert_eq!(stencil.action_stencil_fail, StencilAction::Zero);
        assert_eq!(stencil.action_depth_fail, StencilAction::Replace);
        assert_eq!(stencil.action_depth_pass, StencilAction::Increment);

        let mask = regs.depth_color_mask();
        assert!(mask.depth_test_enable);
        assert_eq!(mask.depth_test_func, CompareFunc::LessThan);
        assert!(mask.red_enable && mask.green_enable && !mask.blue_enable && mask.alpha_enable);
        assert!(mask.depth_write_enable);
    }

    #[test]
    fn test_framebuffer() {
        let mut regs = Regs::new();
        regs.set(index::COLOR_BUFFER_ADDRESS, 0x1800_0000 / 8);
        regs.set(index::DEPTH_BUFFER_ADDRESS, 0x1810_0000 / 8);
        regs.set(index::FRAMEBUFFER_DIMENSIONS, 240 | ((400 - 1) << 12));
        regs.set(index::COLOR_FORMAT, 2 << 16);
        regs.set(index::DEPTH_FORMAT, 3);

        let fb = regs.framebuffer();
        assert_eq!(fb.color_address, 0x1800_0000);
        assert_eq!(fb.depth_address, 0x1810_0000);
        assert_eq!(fb.width, 240);
        assert_eq!(fb.height, 400);
        assert_eq!(fb.color_format, Some(ColorFormat::Rgb5a1));
        assert_eq!(fb.depth_format, Some(DepthFormat::D24S8));
    }

    #[test]
    fn test_unknown_cull_mode_falls_back() {
        let mut regs = Regs::new();
        regs.set(index::CULL_MODE, 3);
        assert_eq!(regs.cull_mode(), CullMode::KeepAll);
    }
}
