//! Vertex data handed over by the geometry pipeline

use crate::backend::HardwareVertex;
use crate::pica::float24_to_f32;

/// A vertex as produced by the vertex shader unit
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OutputVertex {
    /// Clip-space position
    pub pos: [f32; 4],
    /// Primary color, each channel in [0, 1]
    pub color: [f32; 4],
    pub tc0: [f32; 2],
    pub tc1: [f32; 2],
    pub tc2: [f32; 2],
}

impl OutputVertex {
    /// Build a vertex from raw float24 words in the order
    /// pos.xyzw, color.rgba, tc0.uv, tc1.uv, tc2.uv
    pub fn from_float24(raw: &[u32; 14]) -> Self {
        let f = |i: usize| float24_to_f32(raw[i]);
        Self {
            pos: [f(0), f(1), f(2), f(3)],
            color: [f(4), f(5), f(6), f(7)],
            tc0: [f(8), f(9)],
            tc1: [f(10), f(11)],
            tc2: [f(12), f(13)],
        }
    }
}

impl From<&OutputVertex> for HardwareVertex {
    fn from(v: &OutputVertex) -> Self {
        Self {
            position: v.pos,
            color: v.color,
            tex_coord0: v.tc0,
            tex_coord1: v.tc1,
            tex_coord2: v.tc2,
            _pad: [0.0; 2],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pica::f32_to_float24;

    #[test]
    fn test_hardware_vertex_conversion() {
        let v = OutputVertex {
            pos: [1.0, -1.0, 0.5, 1.0],
            color: [0.25, 0.5, 0.75, 1.0],
            tc0: [0.0, 1.0],
            tc1: [0.5, 0.5],
            tc2: [1.0, 0.0],
        };
        let hw = HardwareVertex::from(&v);
        assert_eq!(hw.position, v.pos);
        assert_eq!(hw.color, v.color);
        assert_eq!(hw.tex_coord1, [0.5, 0.5]);
        assert_eq!(hw._pad, [0.0, 0.0]);
    }

    #[test]
    fn test_from_float24() {
        let values = [1.0, 2.0, -3.0, 1.0, 0.5, 0.25, 0.125, 1.0, 0.0, 1.0, 2.0, 4.0, -8.0, 16.0];
        let raw: [u32; 14] = std::array::from_fn(|i| f32_to_float24(values[i]));
        let v = OutputVertex::from_float24(&raw);
        assert_eq!(v.pos, [1.0, 2.0, -3.0, 1.0]);
        assert_eq!(v.color, [0.5, 0.25, 0.125, 1.0]);
        assert_eq!(v.tc2, [-8.0, 16.0]);
    }
}
