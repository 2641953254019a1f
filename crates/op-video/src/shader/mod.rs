//! Shader variants for the fixed-function fragment pipeline

pub mod cache;
pub mod config;
pub mod glsl;
pub mod spirv;
pub mod uniform;

pub use cache::{ShaderCache, ShaderVariant};
pub use config::PipelineConfig;
pub use uniform::{UniformBlock, UniformData};
