//! Null backend for testing
//!
//! Keeps texture contents in memory and records every call, so the surface
//! cache and rasterizer can be exercised without a GPU.

use std::collections::HashMap;

use op_core::error::VideoError;

use super::pixel::{self, Texels};
use super::*;

/// One recorded backend call
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    CreateTexture(TextureHandle),
    DeleteTexture(TextureHandle),
    UploadTexture {
        texture: TextureHandle,
        width: u32,
        height: u32,
        format: HostFormat,
    },
    DownloadTexture(TextureHandle),
    CreateSampler(SamplerHandle),
    SetSamplerState(SamplerHandle, SamplerState),
    CreateProgram(ProgramHandle),
    DeleteProgram(ProgramHandle),
    UseProgram(Option<ProgramHandle>),
    SetCullState(CullState),
    SetBlendEnabled(bool),
    SetBlendFuncs(BlendFuncs),
    SetBlendColor([f32; 4]),
    SetLogicOp(LogicOp),
    SetStencilState(StencilState),
    SetDepthState(DepthState),
    SetColorMask(ColorMask),
    SetViewport(Viewport),
    BindTexture(u32, Option<TextureHandle>),
    BindSampler(u32, Option<SamplerHandle>),
    SetFramebuffer(FramebufferAttachments),
    UploadUniforms(Vec<u8>),
    UploadVertices(usize),
    DrawTriangles { first: u32, count: u32 },
}

/// In-memory texture
#[derive(Debug, Clone)]
pub struct NullTexture {
    pub width: u32,
    pub height: u32,
    pub internal: Option<InternalFormat>,
    pub texels: Texels,
}

/// Generated program sources
#[derive(Debug, Clone)]
pub struct NullProgram {
    pub vertex_source: String,
    pub fragment_source: String,
}

/// Graphics backend without a GPU
pub struct NullBackend {
    initialized: bool,
    fail_init: bool,
    next_handle: u32,
    textures: HashMap<TextureHandle, NullTexture>,
    samplers: HashMap<SamplerHandle, SamplerState>,
    programs: HashMap<ProgramHandle, NullProgram>,
    calls: Vec<HostCall>,
    uniforms: Vec<u8>,
    vertices: Vec<HardwareVertex>,
    draw_calls: u32,
}

impl NullBackend {
    pub fn new() -> Self {
        Self {
            initialized: false,
            fail_init: false,
            next_handle: 1,
            textures: HashMap::new(),
            samplers: HashMap::new(),
            programs: HashMap::new(),
            calls: Vec::new(),
            uniforms: Vec::new(),
            vertices: Vec::new(),
            draw_calls: 0,
        }
    }

    fn alloc_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn record(&mut self, call: HostCall) {
        self.calls.push(call);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Make the next [`init`](GraphicsBackend::init) fail, like a machine without a usable GPU
    pub fn fail_init(&mut self, fail: bool) {
        self.fail_init = fail;
    }

    /// Recorded calls since creation or the last [`clear_calls`](Self::clear_calls)
    pub fn calls(&self) -> &[HostCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn texture(&self, texture: TextureHandle) -> Option<&NullTexture> {
        self.textures.get(&texture)
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn program(&self, program: ProgramHandle) -> Option<&NullProgram> {
        self.programs.get(&program)
    }

    pub fn sampler_state(&self, sampler: SamplerHandle) -> Option<&SamplerState> {
        self.samplers.get(&sampler)
    }

    /// Last uploaded uniform block
    pub fn uniforms(&self) -> &[u8] {
        &self.uniforms
    }

    /// Last uploaded vertex data
    pub fn vertices(&self) -> &[HardwareVertex] {
        &self.vertices
    }

    pub fn draw_calls(&self) -> u32 {
        self.draw_calls
    }

    /// Overwrite texture contents directly, standing in for rendering
    pub fn write_texels(&mut self, texture: TextureHandle, texels: Texels) -> Result<(), VideoError> {
        let tex = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| VideoError::Backend(format!("unknown texture {}", texture.0)))?;
        if texels.len() != (tex.width * tex.height) as usize {
            return Err(VideoError::Backend(format!(
                "expected {} texels, got {}",
                tex.width * tex.height,
                texels.len()
            )));
        }
        tex.texels = match tex.internal {
            Some(internal) => pixel::store(internal, texels)?,
            None => texels,
        };
        Ok(())
    }

    fn attachment(&self, texture: Option<TextureHandle>) -> Result<Option<&NullTexture>, VideoError> {
        texture
            .map(|handle| {
                self.textures.get(&handle).ok_or_else(|| {
                    VideoError::IncompleteFramebuffer(format!("unknown texture {}", handle.0))
                })
            })
            .transpose()
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicsBackend for NullBackend {
    fn init(&mut self) -> Result<(), VideoError> {
        if self.fail_init {
            return Err(VideoError::Backend("no graphics device".into()));
        }
        self.initialized = true;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.textures.clear();
        self.samplers.clear();
        self.programs.clear();
        self.initialized = false;
    }

    fn create_texture(&mut self) -> Result<TextureHandle, VideoError> {
        let handle = TextureHandle(self.alloc_handle());
        self.textures.insert(
            handle,
            NullTexture {
                width: 0,
                height: 0,
                internal: None,
                texels: Texels::Color(Vec::new()),
            },
        );
        self.record(HostCall::CreateTexture(handle));
        Ok(handle)
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture);
        self.record(HostCall::DeleteTexture(texture));
    }

    fn upload_texture(
        &mut self,
        texture: TextureHandle,
        width: u32,
        height: u32,
        format: &HostFormat,
        data: &[u8],
    ) -> Result<(), VideoError> {
        self.record(HostCall::UploadTexture {
            texture,
            width,
            height,
            format: *format,
        });

        let texels = pixel::unpack(format, data, (width * height) as usize)?;
        let texels = pixel::store(format.internal, texels)?;
        let tex = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| VideoError::Backend(format!("unknown texture {}", texture.0)))?;
        *tex = NullTexture {
            width,
            height,
            internal: Some(format.internal),
            texels,
        };
        Ok(())
    }

    fn download_texture(&mut self, texture: TextureHandle, format: &HostFormat) -> Result<Vec<u8>, VideoError> {
        self.record(HostCall::DownloadTexture(texture));
        let tex = self
            .textures
            .get(&texture)
            .ok_or_else(|| VideoError::Backend(format!("unknown texture {}", texture.0)))?;
        pixel::pack(format, &tex.texels)
    }

    fn create_sampler(&mut self) -> Result<SamplerHandle, VideoError> {
        let handle = SamplerHandle(self.alloc_handle());
        self.samplers.insert(handle, SamplerState::default());
        self.record(HostCall::CreateSampler(handle));
        Ok(handle)
    }

    fn set_sampler_state(&mut self, sampler: SamplerHandle, state: &SamplerState) {
        self.samplers.insert(sampler, *state);
        self.record(HostCall::SetSamplerState(sampler, *state));
    }

    fn create_program(&mut self, vertex_source: &str, fragment_source: &str) -> Result<ProgramHandle, VideoError> {
        let handle = ProgramHandle(self.alloc_handle());
        self.programs.insert(
            handle,
            NullProgram {
                vertex_source: vertex_source.to_string(),
                fragment_source: fragment_source.to_string(),
            },
        );
        self.record(HostCall::CreateProgram(handle));
        Ok(handle)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program);
        self.record(HostCall::DeleteProgram(program));
    }

    fn use_program(&mut self, program: Option<ProgramHandle>) {
        self.record(HostCall::UseProgram(program));
    }

    fn set_cull_state(&mut self, state: &CullState) {
        self.record(HostCall::SetCullState(*state));
    }

    fn set_blend_enabled(&mut self, enabled: bool) {
        self.record(HostCall::SetBlendEnabled(enabled));
    }

    fn set_blend_funcs(&mut self, funcs: &BlendFuncs) {
        self.record(HostCall::SetBlendFuncs(*funcs));
    }

    fn set_blend_color(&mut self, color: [f32; 4]) {
        self.record(HostCall::SetBlendColor(color));
    }

    fn set_logic_op(&mut self, op: LogicOp) {
        self.record(HostCall::SetLogicOp(op));
    }

    fn set_stencil_state(&mut self, state: &StencilState) {
        self.record(HostCall::SetStencilState(*state));
    }

    fn set_depth_state(&mut self, state: &DepthState) {
        self.record(HostCall::SetDepthState(*state));
    }

    fn set_color_mask(&mut self, mask: &ColorMask) {
        self.record(HostCall::SetColorMask(*mask));
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        self.record(HostCall::SetViewport(*viewport));
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<TextureHandle>) {
        self.record(HostCall::BindTexture(unit, texture));
    }

    fn bind_sampler(&mut self, unit: u32, sampler: Option<SamplerHandle>) {
        self.record(HostCall::BindSampler(unit, sampler));
    }

    fn set_framebuffer(&mut self, attachments: &FramebufferAttachments) -> Result<(), VideoError> {
        self.record(HostCall::SetFramebuffer(*attachments));

        let color = self.attachment(attachments.color)?;
        let depth = self.attachment(attachments.depth)?;
        let stencil = self.attachment(attachments.stencil)?;

        if color.is_some_and(|c| c.internal.is_some_and(|f| f.is_depth())) {
            return Err(VideoError::IncompleteFramebuffer("depth texture in color slot".into()));
        }
        if depth.is_some_and(|d| d.internal.is_some_and(|f| !f.is_depth())) {
            return Err(VideoError::IncompleteFramebuffer("color texture in depth slot".into()));
        }
        if stencil.is_some_and(|s| s.internal.is_some_and(|f| !f.has_stencil())) {
            return Err(VideoError::IncompleteFramebuffer("stencil attachment without stencil".into()));
        }
        if let (Some(c), Some(d)) = (color, depth) {
            if (c.width, c.height) != (d.width, d.height) {
                return Err(VideoError::IncompleteFramebuffer(format!(
                    "color {}x{} does not match depth {}x{}",
                    c.width, c.height, d.width, d.height
                )));
            }
        }
        Ok(())
    }

    fn upload_uniforms(&mut self, data: &[u8]) {
        self.uniforms = data.to_vec();
        self.record(HostCall::UploadUniforms(data.to_vec()));
    }

    fn upload_vertices(&mut self, vertices: &[HardwareVertex]) {
        self.vertices = vertices.to_vec();
        self.record(HostCall::UploadVertices(vertices.len()));
    }

    fn draw_triangles(&mut self, first: u32, count: u32) -> Result<(), VideoError> {
        if (first + count) as usize > self.vertices.len() {
            return Err(VideoError::Backend(format!(
                "draw of {} vertices past buffer of {}",
                first + count,
                self.vertices.len()
            )));
        }
        self.draw_calls += 1;
        self.record(HostCall::DrawTriangles { first, count });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::RGBA8_BYTES;

    #[test]
    fn test_null_backend_init() {
        let mut backend = NullBackend::new();
        assert!(backend.init().is_ok());
        assert!(backend.is_initialized());
        backend.shutdown();
        assert!(!backend.is_initialized());
    }

    #[test]
    fn test_null_backend_texture_round_trip() {
        let mut backend = NullBackend::new();
        let tex = backend.create_texture().unwrap();
        let data: Vec<u8> = (0..2 * 2 * 4).map(|i| i as u8).collect();
        backend.upload_texture(tex, 2, 2, &RGBA8_BYTES, &data).unwrap();
        assert_eq!(backend.download_texture(tex, &RGBA8_BYTES).unwrap(), data);
        assert_eq!(backend.texture(tex).unwrap().width, 2);
    }

    #[test]
    fn test_null_backend_short_upload() {
        let mut backend = NullBackend::new();
        let tex = backend.create_texture().unwrap();
        assert!(matches!(
            backend.upload_texture(tex, 4, 4, &RGBA8_BYTES, &[0; 8]),
            Err(VideoError::InvalidPixelTransfer(_))
        ));
    }

    #[test]
    fn test_null_backend_draw_call_tracking() {
        let mut backend = NullBackend::new();
        backend.upload_vertices(&[HardwareVertex::default(); 6]);
        backend.draw_triangles(0, 6).unwrap();
        backend.draw_triangles(0, 3).unwrap();
        assert_eq!(backend.draw_calls(), 2);
        assert!(backend.draw_triangles(3, 6).is_err());
    }

    #[test]
    fn test_null_backend_incomplete_framebuffer() {
        let mut backend = NullBackend::new();
        let color = backend.create_texture().unwrap();
        let depth = backend.create_texture().unwrap();
        backend.upload_texture(color, 4, 4, &RGBA8_BYTES, &[0; 64]).unwrap();
        let d24 = HostFormat::new(
            InternalFormat::Depth24,
            PixelLayout::DepthComponent,
            ComponentType::UnsignedInt,
        );
        backend.upload_texture(depth, 8, 8, &d24, &[0; 256]).unwrap();

        let result = backend.set_framebuffer(&FramebufferAttachments {
            color: Some(color),
            depth: Some(depth),
            stencil: None,
        });
        assert!(matches!(result, Err(VideoError::IncompleteFramebuffer(_))));

        let result = backend.set_framebuffer(&FramebufferAttachments {
            color: Some(depth),
            depth: None,
            stencil: None,
        });
        assert!(matches!(result, Err(VideoError::IncompleteFramebuffer(_))));
    }

    #[test]
    fn test_null_backend_call_log() {
        let mut backend = NullBackend::new();
        backend.set_blend_enabled(true);
        backend.bind_texture(1, None);
        assert_eq!(
            backend.calls(),
            &[HostCall::SetBlendEnabled(true), HostCall::BindTexture(1, None)]
        );
        backend.clear_calls();
        assert!(backend.calls().is_empty());
    }
}
