//! Host rendering backends

pub mod null;
pub mod pixel;
pub mod types;
pub mod vulkan;

use op_core::error::VideoError;

use crate::pica::LogicOp;
pub use types::*;

/// Host graphics API as seen by the rasterizer.
///
/// Calls are immediate-mode and fire-and-forget, except
/// [`download_texture`](GraphicsBackend::download_texture), which blocks
/// until all queued work touching the texture has completed.
pub trait GraphicsBackend {
    /// Initialize the backend
    fn init(&mut self) -> Result<(), VideoError>;

    /// Shutdown the backend
    fn shutdown(&mut self);

    /// Create a texture object with no storage
    fn create_texture(&mut self) -> Result<TextureHandle, VideoError>;

    /// Release a texture object
    fn delete_texture(&mut self, texture: TextureHandle);

    /// Define the texture's storage and contents from client pixels, bottom row first
    fn upload_texture(
        &mut self,
        texture: TextureHandle,
        width: u32,
        height: u32,
        format: &HostFormat,
        data: &[u8],
    ) -> Result<(), VideoError>;

    /// Read back the texture's contents as client pixels, bottom row first
    fn download_texture(&mut self, texture: TextureHandle, format: &HostFormat) -> Result<Vec<u8>, VideoError>;

    /// Create a sampler object with default parameters
    fn create_sampler(&mut self) -> Result<SamplerHandle, VideoError>;

    /// Update sampler parameters
    fn set_sampler_state(&mut self, sampler: SamplerHandle, state: &SamplerState);

    /// Compile and link a GLSL program
    fn create_program(&mut self, vertex_source: &str, fragment_source: &str) -> Result<ProgramHandle, VideoError>;

    /// Release a program
    fn delete_program(&mut self, program: ProgramHandle);

    /// Bind a program for subsequent draws
    fn use_program(&mut self, program: Option<ProgramHandle>);

    fn set_cull_state(&mut self, state: &CullState);

    fn set_blend_enabled(&mut self, enabled: bool);

    fn set_blend_funcs(&mut self, funcs: &BlendFuncs);

    /// Constant blend color, normalized RGBA
    fn set_blend_color(&mut self, color: [f32; 4]);

    fn set_logic_op(&mut self, op: LogicOp);

    fn set_stencil_state(&mut self, state: &StencilState);

    fn set_depth_state(&mut self, state: &DepthState);

    fn set_color_mask(&mut self, mask: &ColorMask);

    fn set_viewport(&mut self, viewport: &Viewport);

    /// Bind a texture to a texture unit
    fn bind_texture(&mut self, unit: u32, texture: Option<TextureHandle>);

    /// Bind a sampler to a texture unit
    fn bind_sampler(&mut self, unit: u32, sampler: Option<SamplerHandle>);

    /// Attach render targets. Fails when the attachments cannot be rendered to together.
    fn set_framebuffer(&mut self, attachments: &FramebufferAttachments) -> Result<(), VideoError>;

    /// Replace the contents of the uniform block at binding 0
    fn upload_uniforms(&mut self, data: &[u8]);

    /// Replace the contents of the vertex buffer
    fn upload_vertices(&mut self, vertices: &[HardwareVertex]);

    /// Draw `count` vertices from the vertex buffer as a triangle list
    fn draw_triangles(&mut self, first: u32, count: u32) -> Result<(), VideoError>;
}
