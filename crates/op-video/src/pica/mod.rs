//! PICA200 register definitions

pub mod float24;
pub mod regs;
pub mod types;

pub use float24::{f32_to_float24, float24_to_f32};
pub use regs::{index, FramebufferConfig, FullTextureConfig, Regs, TevStageConfig, TextureConfig};
pub use types::*;
