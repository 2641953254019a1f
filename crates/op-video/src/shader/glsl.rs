//! GLSL generation for the fixed-function TEV combiner
//!
//! All variants share one vertex shader. The fragment shader evaluates the
//! six combiner stages in order, skipping pass-through stages, and applies
//! the alpha test last.

use std::fmt::Write;

use tracing::warn;

use super::config::PipelineConfig;
use crate::pica::regs::NUM_TEV_STAGES;
use crate::pica::{CompareFunc, TevAlphaModifier, TevColorModifier, TevOperation, TevSource, TevStageConfig};

/// Vertex attribute locations, matching the field order of `HardwareVertex`
pub const ATTRIBUTE_POSITION: u32 = 0;
pub const ATTRIBUTE_COLOR: u32 = 1;
pub const ATTRIBUTE_TEXCOORD0: u32 = 2;
pub const ATTRIBUTE_TEXCOORD1: u32 = 3;
pub const ATTRIBUTE_TEXCOORD2: u32 = 4;

/// Descriptor bindings in set 0
pub const BINDING_UNIFORMS: u32 = 0;
pub const BINDING_TEXTURES: [u32; 3] = [1, 2, 3];
pub const BINDING_SAMPLERS: [u32; 3] = [4, 5, 6];

const VERTEX_SHADER: &str = r#"#version 450

layout(location = 0) in vec4 vert_position;
layout(location = 1) in vec4 vert_color;
layout(location = 2) in vec2 vert_texcoord0;
layout(location = 3) in vec2 vert_texcoord1;
layout(location = 4) in vec2 vert_texcoord2;

layout(location = 0) out vec4 primary_color;
layout(location = 1) out vec2 texcoord0;
layout(location = 2) out vec2 texcoord1;
layout(location = 3) out vec2 texcoord2;

void main() {
    primary_color = vert_color;
    texcoord0 = vert_texcoord0;
    texcoord1 = vert_texcoord1;
    texcoord2 = vert_texcoord2;
    gl_Position = vec4(vert_position.x, vert_position.y, -vert_position.z, vert_position.w);
}
"#;

const FRAGMENT_HEADER: &str = r#"#version 450

layout(location = 0) in vec4 primary_color;
layout(location = 1) in vec2 texcoord0;
layout(location = 2) in vec2 texcoord1;
layout(location = 3) in vec2 texcoord2;

layout(location = 0) out vec4 color;

layout(std140, set = 0, binding = 0) uniform shader_data {
    int alphatest_ref;
    vec4 const_color[6];
    vec4 tev_combiner_buffer_color;
} uniforms;

layout(set = 0, binding = 1) uniform texture2D tex0;
layout(set = 0, binding = 2) uniform texture2D tex1;
layout(set = 0, binding = 3) uniform texture2D tex2;
layout(set = 0, binding = 4) uniform sampler samp0;
layout(set = 0, binding = 5) uniform sampler samp1;
layout(set = 0, binding = 6) uniform sampler samp2;

void main() {
"#;

/// The vertex shader shared by every variant
pub fn generate_vertex_shader() -> String {
    VERTEX_SHADER.to_string()
}

fn source_expr(source: Option<TevSource>, stage: usize) -> String {
    match source {
        Some(TevSource::PrimaryColor) => "primary_color".into(),
        // No fragment lighting: the primary color stands in for the lit color
        Some(TevSource::PrimaryFragmentColor) => "primary_color".into(),
        Some(TevSource::SecondaryFragmentColor) => "vec4(0.0)".into(),
        Some(TevSource::Texture0) => "texture(sampler2D(tex0, samp0), texcoord0)".into(),
        Some(TevSource::Texture1) => "texture(sampler2D(tex1, samp1), texcoord1)".into(),
        Some(TevSource::Texture2) => "texture(sampler2D(tex2, samp2), texcoord2)".into(),
        Some(TevSource::PreviousBuffer) => "combiner_buffer".into(),
        Some(TevSource::Constant) => format!("uniforms.const_color[{}]", stage),
        Some(TevSource::Previous) => "last_tex_env_out".into(),
        Some(TevSource::Texture3) | None => {
            warn!("Unsupported TEV source {:?} in stage {}", source, stage);
            "vec4(0.0)".into()
        }
    }
}

fn color_modifier_expr(modifier: Option<TevColorModifier>, src: &str) -> String {
    match modifier {
        Some(TevColorModifier::SourceColor) => format!("{}.rgb", src),
        Some(TevColorModifier::OneMinusSourceColor) => format!("vec3(1.0) - {}.rgb", src),
        Some(TevColorModifier::SourceAlpha) => format!("{}.aaa", src),
        Some(TevColorModifier::OneMinusSourceAlpha) => format!("vec3(1.0) - {}.aaa", src),
        Some(TevColorModifier::SourceRed) => format!("{}.rrr", src),
        Some(TevColorModifier::OneMinusSourceRed) => format!("vec3(1.0) - {}.rrr", src),
        Some(TevColorModifier::SourceGreen) => format!("{}.ggg", src),
        Some(TevColorModifier::OneMinusSourceGreen) => format!("vec3(1.0) - {}.ggg", src),
        Some(TevColorModifier::SourceBlue) => format!("{}.bbb", src),
        Some(TevColorModifier::OneMinusSourceBlue) => format!("vec3(1.0) - {}.bbb", src),
        None => {
            warn!("Unknown TEV color modifier");
            "vec3(0.0)".into()
        }
    }
}

fn alpha_modifier_expr(modifier: Option<TevAlphaModifier>, src: &str) -> String {
    match modifier {
        Some(TevAlphaModifier::SourceAlpha) => format!("{}.a", src),
        Some(TevAlphaModifier::OneMinusSourceAlpha) => format!("1.0 - {}.a", src),
        Some(TevAlphaModifier::SourceRed) => format!("{}.r", src),
        Some(TevAlphaModifier::OneMinusSourceRed) => format!("1.0 - {}.r", src),
        Some(TevAlphaModifier::SourceGreen) => format!("{}.g", src),
        Some(TevAlphaModifier::OneMinusSourceGreen) => format!("1.0 - {}.g", src),
        Some(TevAlphaModifier::SourceBlue) => format!("{}.b", src),
        Some(TevAlphaModifier::OneMinusSourceBlue) => format!("1.0 - {}.b", src),
        None => {
            warn!("Unknown TEV alpha modifier");
            "0.0".into()
        }
    }
}

fn color_combiner_expr(op: Option<TevOperation>, r: [&str; 3]) -> String {
    let [a, b, c] = r;
    match op {
        Some(TevOperation::Replace) => a.to_string(),
        Some(TevOperation::Modulate) => format!("{a} * {b}"),
        Some(TevOperation::Add) => format!("min({a} + {b}, vec3(1.0))"),
        Some(TevOperation::AddSigned) => format!("clamp({a} + {b} - vec3(0.5), vec3(0.0), vec3(1.0))"),
        Some(TevOperation::Lerp) => format!("{a} * {c} + {b} * (vec3(1.0) - {c})"),
        Some(TevOperation::Subtract) => format!("max({a} - {b}, vec3(0.0))"),
        Some(TevOperation::MultiplyThenAdd) => format!("min({a} * {b} + {c}, vec3(1.0))"),
        Some(TevOperation::AddThenMultiply) => format!("min({a} + {b}, vec3(1.0)) * {c}"),
        Some(TevOperation::Dot3Rgb) => format!("vec3(dot({a} - vec3(0.5), {b} - vec3(0.5)) * 4.0)"),
        None => {
            warn!("Unknown TEV color operation");
            "vec3(0.0)".into()
        }
    }
}

fn alpha_combiner_expr(op: Option<TevOperation>, r: [&str; 3]) -> String {
    let [a, b, c] = r;
    match op {
        Some(TevOperation::Replace) => a.to_string(),
        Some(TevOperation::Modulate) => format!("{a} * {b}"),
        Some(TevOperation::Add) => format!("min({a} + {b}, 1.0)"),
        Some(TevOperation::AddSigned) => format!("clamp({a} + {b} - 0.5, 0.0, 1.0)"),
        Some(TevOperation::Lerp) => format!("{a} * {c} + {b} * (1.0 - {c})"),
        Some(TevOperation::Subtract) => format!("max({a} - {b}, 0.0)"),
        Some(TevOperation::MultiplyThenAdd) => format!("min({a} * {b} + {c}, 1.0)"),
        Some(TevOperation::AddThenMultiply) => format!("min({a} + {b}, 1.0) * {c}"),
        Some(TevOperation::Dot3Rgb) | None => {
            warn!("Unsupported TEV alpha operation {:?}", op);
            "0.0".into()
        }
    }
}

/// Condition under which a fragment fails the alpha test
fn alpha_test_fail_condition(func: CompareFunc) -> Option<String> {
    let alpha = "int(last_tex_env_out.a * 255.0)";
    let op = match func {
        CompareFunc::Never | CompareFunc::Always => return None,
        CompareFunc::Equal => "!=",
        CompareFunc::NotEqual => "==",
        CompareFunc::LessThan => ">=",
        CompareFunc::LessThanOrEqual => ">",
        CompareFunc::GreaterThan => "<=",
        CompareFunc::GreaterThanOrEqual => "<",
    };
    Some(format!("{} {} uniforms.alphatest_ref", alpha, op))
}

fn write_stage(out: &mut String, index: usize, stage: &TevStageConfig) {
    let color_results: Vec<String> = (0..3)
        .map(|i| format!("color_results_{}_{}", index, i))
        .collect();
    let alpha_results: Vec<String> = (0..3)
        .map(|i| format!("alpha_results_{}_{}", index, i))
        .collect();

    for (i, name) in color_results.iter().enumerate() {
        let src = source_expr(stage.color_source(i), index);
        let _ = writeln!(out, "    vec3 {} = {};", name, color_modifier_expr(stage.color_modifier(i), &src));
    }
    for (i, name) in alpha_results.iter().enumerate() {
        let src = source_expr(stage.alpha_source(i), index);
        let _ = writeln!(out, "    float {} = {};", name, alpha_modifier_expr(stage.alpha_modifier(i), &src));
    }

    let color_refs = [&*color_results[0], &*color_results[1], &*color_results[2]];
    let alpha_refs = [&*alpha_results[0], &*alpha_results[1], &*alpha_results[2]];
    let _ = writeln!(
        out,
        "    vec3 color_output_{} = {};",
        index,
        color_combiner_expr(stage.color_op(), color_refs)
    );
    let _ = writeln!(
        out,
        "    float alpha_output_{} = {};",
        index,
        alpha_combiner_expr(stage.alpha_op(), alpha_refs)
    );
    let _ = writeln!(
        out,
        "    last_tex_env_out = vec4(clamp(color_output_{i} * {:.1}, vec3(0.0), vec3(1.0)), clamp(alpha_output_{i} * {:.1}, 0.0, 1.0));",
        stage.color_multiplier() as f32,
        stage.alpha_multiplier() as f32,
        i = index,
    );
}

/// Fragment shader reproducing the combiner configuration in `config`
pub fn generate_fragment_shader(config: &PipelineConfig) -> String {
    let mut out = String::from(FRAGMENT_HEADER);

    // Nothing can pass, so skip the combiners entirely
    if config.alpha_test_func == CompareFunc::Never {
        out.push_str("    discard;\n}\n");
        return out;
    }

    out.push_str("    vec4 combiner_buffer = uniforms.tev_combiner_buffer_color;\n");
    out.push_str("    vec4 last_tex_env_out = vec4(0.0);\n\n");

    for (index, stage) in config.tev_stages.iter().enumerate().take(NUM_TEV_STAGES) {
        if !stage.is_pass_through() {
            write_stage(&mut out, index, stage);
        }

        if config.combiner_buffer_input.updates_color(index) {
            out.push_str("    combiner_buffer = vec4(last_tex_env_out.rgb, combiner_buffer.a);\n");
        }
        if config.combiner_buffer_input.updates_alpha(index) {
            out.push_str("    combiner_buffer = vec4(combiner_buffer.rgb, last_tex_env_out.a);\n");
        }
    }

    if let Some(condition) = alpha_test_fail_condition(config.alpha_test_func) {
        let _ = writeln!(out, "\n    if ({}) {{\n        discard;\n    }}", condition);
    }

    out.push_str("\n    color = last_tex_env_out;\n}\n");
    out
}
