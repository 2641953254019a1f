//! GLSL to SPIR-V translation

use naga::back::spv;
use naga::front::glsl;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::ShaderStage;
use op_core::error::VideoError;

/// Parse, validate and translate one GLSL stage to SPIR-V words
pub fn glsl_to_spirv(source: &str, stage: ShaderStage) -> Result<Vec<u32>, VideoError> {
    let mut frontend = glsl::Frontend::default();
    let module = frontend
        .parse(&glsl::Options::from(stage), source)
        .map_err(|e| VideoError::ShaderCompilation(e.emit_to_string(source)))?;

    let info = Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|e| VideoError::ShaderCompilation(e.emit_to_string(source)))?;

    // Clip space already matches the host framebuffer orientation
    let mut options = spv::Options::default();
    options.flags.remove(spv::WriterFlags::ADJUST_COORDINATE_SPACE);

    let pipeline = spv::PipelineOptions {
        shader_stage: stage,
        entry_point: "main".into(),
    };
    spv::write_vec(&module, &info, &options, Some(&pipeline))
        .map_err(|e| VideoError::ShaderCompilation(e.to_string()))
}
