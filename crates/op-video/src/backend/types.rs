//! Host-side handles, pixel formats and fixed-function state values

use bytemuck::{Pod, Zeroable};

use crate::pica::{BlendEquation, BlendFactor, CompareFunc, StencilAction, TextureFilter, WrapMode};

/// Host texture object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u32);

/// Host sampler object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SamplerHandle(pub u32);

/// Host shader program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(pub u32);

/// Storage format of a host texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalFormat {
    Rgba8,
    Rgb8,
    Rgb5A1,
    Rgb565,
    Rgba4,
    Depth16,
    Depth24,
    Depth24Stencil8,
}

impl InternalFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth16 | Self::Depth24 | Self::Depth24Stencil8)
    }

    pub fn has_stencil(self) -> bool {
        self == Self::Depth24Stencil8
    }
}

/// Channel order of client-side pixel data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    Rgba,
    Rgb,
    Bgr,
    DepthComponent,
    DepthStencil,
}

/// Component packing of client-side pixel data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentType {
    UnsignedByte,
    /// One u32 per pixel, red in the most significant byte
    UnsignedInt8888,
    UnsignedShort5551,
    UnsignedShort565,
    UnsignedShort4444,
    UnsignedShort,
    UnsignedInt,
    /// One u32 per pixel, depth in the high 24 bits and stencil in the low 8
    UnsignedInt248,
}

/// Host texture format triple: storage format plus client data layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostFormat {
    pub internal: InternalFormat,
    pub layout: PixelLayout,
    pub component: ComponentType,
}

impl HostFormat {
    pub const fn new(internal: InternalFormat, layout: PixelLayout, component: ComponentType) -> Self {
        Self {
            internal,
            layout,
            component,
        }
    }

    /// Bytes per pixel of client data in this format
    pub fn bytes_per_pixel(&self) -> usize {
        match (self.layout, self.component) {
            (PixelLayout::Rgba, ComponentType::UnsignedByte) => 4,
            (PixelLayout::Rgb | PixelLayout::Bgr, ComponentType::UnsignedByte) => 3,
            (_, ComponentType::UnsignedByte) => 1,
            (_, ComponentType::UnsignedShort5551)
            | (_, ComponentType::UnsignedShort565)
            | (_, ComponentType::UnsignedShort4444)
            | (_, ComponentType::UnsignedShort) => 2,
            (_, ComponentType::UnsignedInt8888)
            | (_, ComponentType::UnsignedInt)
            | (_, ComponentType::UnsignedInt248) => 4,
        }
    }
}

/// Client layout of decoded texture data: RGBA, one byte per channel
pub const RGBA8_BYTES: HostFormat =
    HostFormat::new(InternalFormat::Rgba8, PixelLayout::Rgba, ComponentType::UnsignedByte);

/// Winding order treated as front-facing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontFace {
    Clockwise,
    CounterClockwise,
}

/// Face culling state. Back faces are culled when enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CullState {
    pub enabled: bool,
    pub front_face: FrontFace,
}

impl Default for CullState {
    fn default() -> Self {
        Self {
            enabled: false,
            front_face: FrontFace::CounterClockwise,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendFuncs {
    pub equation_rgb: BlendEquation,
    pub equation_a: BlendEquation,
    pub src_rgb: BlendFactor,
    pub dst_rgb: BlendFactor,
    pub src_a: BlendFactor,
    pub dst_a: BlendFactor,
}

impl Default for BlendFuncs {
    fn default() -> Self {
        Self {
            equation_rgb: BlendEquation::Add,
            equation_a: BlendEquation::Add,
            src_rgb: BlendFactor::One,
            dst_rgb: BlendFactor::Zero,
            src_a: BlendFactor::One,
            dst_a: BlendFactor::Zero,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilState {
    pub test_enabled: bool,
    pub func: CompareFunc,
    pub reference: u8,
    pub compare_mask: u8,
    pub write_mask: u8,
    pub action_stencil_fail: StencilAction,
    pub action_depth_fail: StencilAction,
    pub action_depth_pass: StencilAction,
}

impl Default for StencilState {
    fn default() -> Self {
        Self {
            test_enabled: false,
            func: CompareFunc::Always,
            reference: 0,
            compare_mask: 0xFF,
            write_mask: 0xFF,
            action_stencil_fail: StencilAction::Keep,
            action_depth_fail: StencilAction::Keep,
            action_depth_pass: StencilAction::Keep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub test_enabled: bool,
    pub func: CompareFunc,
    pub write_enabled: bool,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test_enabled: false,
            func: CompareFunc::LessThan,
            write_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorMask {
    pub red: bool,
    pub green: bool,
    pub blue: bool,
    pub alpha: bool,
}

impl Default for ColorMask {
    fn default() -> Self {
        Self {
            red: true,
            green: true,
            blue: true,
            alpha: true,
        }
    }
}

/// Sampler parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerState {
    pub mag_filter: TextureFilter,
    pub min_filter: TextureFilter,
    pub wrap_s: WrapMode,
    pub wrap_t: WrapMode,
    /// RGBA8 with red in the low byte
    pub border_color: u32,
}

impl Default for SamplerState {
    fn default() -> Self {
        Self {
            mag_filter: TextureFilter::Linear,
            min_filter: TextureFilter::Linear,
            wrap_s: WrapMode::Repeat,
            wrap_t: WrapMode::Repeat,
            border_color: 0,
        }
    }
}

/// Viewport in host pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Framebuffer attachments. Stencil is attached only for D24S8 depth surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FramebufferAttachments {
    pub color: Option<TextureHandle>,
    pub depth: Option<TextureHandle>,
    pub stencil: Option<TextureHandle>,
}

/// Vertex layout consumed by the generated vertex shader
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct HardwareVertex {
    pub position: [f32; 4],
    pub color: [f32; 4],
    pub tex_coord0: [f32; 2],
    pub tex_coord1: [f32; 2],
    pub tex_coord2: [f32; 2],
    /// Keeps the stride at 64 bytes
    pub _pad: [f32; 2],
}
