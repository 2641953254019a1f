//! Client pixel transfer
//!
//! Converts between client-side pixel data described by a [`HostFormat`]
//! and texel values held by a host texture, the way a driver does for
//! texture upload and readback.

use op_core::error::VideoError;

use super::types::{ComponentType, HostFormat, InternalFormat, PixelLayout};
use crate::color::*;

/// Depth (24-bit normalized) and stencil of one texel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DepthStencil {
    pub depth: u32,
    pub stencil: u8,
}

/// Texel values of a whole image, bottom row first
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Texels {
    Color(Vec<[u8; 4]>),
    DepthStencil(Vec<DepthStencil>),
}

impl Texels {
    pub fn len(&self) -> usize {
        match self {
            Self::Color(t) => t.len(),
            Self::DepthStencil(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Storage for a freshly created texture
    pub fn zeroed(internal: InternalFormat, count: usize) -> Self {
        if internal.is_depth() {
            Self::DepthStencil(vec![DepthStencil::default(); count])
        } else {
            Self::Color(vec![[0, 0, 0, 0]; count])
        }
    }
}

fn invalid(format: &HostFormat) -> VideoError {
    VideoError::InvalidPixelTransfer(format!("{:?}/{:?}", format.layout, format.component))
}

#[inline]
fn u16_at(data: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([data[2 * i], data[2 * i + 1]])
}

#[inline]
fn u32_at(data: &[u8], i: usize) -> u32 {
    u32::from_le_bytes([data[4 * i], data[4 * i + 1], data[4 * i + 2], data[4 * i + 3]])
}

#[inline]
pub(crate) fn d16_to_d24(d: u16) -> u32 {
    ((d as u32) << 8) | ((d as u32) >> 8)
}

/// Decode `count` client pixels
pub fn unpack(format: &HostFormat, data: &[u8], count: usize) -> Result<Texels, VideoError> {
    let needed = count * format.bytes_per_pixel();
    if data.len() < needed {
        return Err(VideoError::InvalidPixelTransfer(format!(
            "expected {} bytes, got {}",
            needed,
            data.len()
        )));
    }

    let color = |f: &dyn Fn(usize) -> [u8; 4]| -> Result<Texels, VideoError> {
        Ok(Texels::Color((0..count).map(f).collect()))
    };
    let depth = |f: &dyn Fn(usize) -> DepthStencil| -> Result<Texels, VideoError> {
        Ok(Texels::DepthStencil((0..count).map(f).collect()))
    };

    match (format.layout, format.component) {
        (PixelLayout::Rgba, ComponentType::UnsignedByte) => {
            color(&|i| [data[4 * i], data[4 * i + 1], data[4 * i + 2], data[4 * i + 3]])
        }
        (PixelLayout::Rgba, ComponentType::UnsignedInt8888) => color(&|i| {
            let [a, b, g, r] = u32_at(data, i).to_le_bytes();
            [r, g, b, a]
        }),
        (PixelLayout::Rgb, ComponentType::UnsignedByte) => {
            color(&|i| [data[3 * i], data[3 * i + 1], data[3 * i + 2], 255])
        }
        (PixelLayout::Bgr, ComponentType::UnsignedByte) => {
            color(&|i| [data[3 * i + 2], data[3 * i + 1], data[3 * i], 255])
        }
        (PixelLayout::Rgba, ComponentType::UnsignedShort5551) => color(&|i| {
            let p = u16_at(data, i);
            [
                convert_5_to_8(((p >> 11) & 0x1F) as u8),
                convert_5_to_8(((p >> 6) & 0x1F) as u8),
                convert_5_to_8(((p >> 1) & 0x1F) as u8),
                convert_1_to_8((p & 1) as u8),
            ]
        }),
        (PixelLayout::Rgb, ComponentType::UnsignedShort565) => color(&|i| {
            let p = u16_at(data, i);
            [
                convert_5_to_8(((p >> 11) & 0x1F) as u8),
                convert_6_to_8(((p >> 5) & 0x3F) as u8),
                convert_5_to_8((p & 0x1F) as u8),
                255,
            ]
        }),
        (PixelLayout::Rgba, ComponentType::UnsignedShort4444) => color(&|i| {
            let p = u16_at(data, i);
            [
                convert_4_to_8(((p >> 12) & 0xF) as u8),
                convert_4_to_8(((p >> 8) & 0xF) as u8),
                convert_4_to_8(((p >> 4) & 0xF) as u8),
                convert_4_to_8((p & 0xF) as u8),
            ]
        }),
        (PixelLayout::DepthComponent, ComponentType::UnsignedShort) => depth(&|i| DepthStencil {
            depth: d16_to_d24(u16_at(data, i)),
            stencil: 0,
        }),
        (PixelLayout::DepthComponent, ComponentType::UnsignedInt) => depth(&|i| DepthStencil {
            depth: u32_at(data, i) >> 8,
            stencil: 0,
        }),
        (PixelLayout::DepthStencil, ComponentType::UnsignedInt248) => depth(&|i| {
            let v = u32_at(data, i);
            DepthStencil {
                depth: v >> 8,
                stencil: v as u8,
            }
        }),
        _ => Err(invalid(format)),
    }
}

/// Encode texels as client pixels
pub fn pack(format: &HostFormat, texels: &Texels) -> Result<Vec<u8>, VideoError> {
    let mut out = Vec::with_capacity(texels.len() * format.bytes_per_pixel());

    match (texels, format.layout, format.component) {
        (Texels::Color(t), PixelLayout::Rgba, ComponentType::UnsignedByte) => {
            t.iter().for_each(|c| out.extend_from_slice(c));
        }
        (Texels::Color(t), PixelLayout::Rgba, ComponentType::UnsignedInt8888) => {
            t.iter().for_each(|&[r, g, b, a]| out.extend_from_slice(&[a, b, g, r]));
        }
        (Texels::Color(t), PixelLayout::Rgb, ComponentType::UnsignedByte) => {
            t.iter().for_each(|&[r, g, b, _]| out.extend_from_slice(&[r, g, b]));
        }
        (Texels::Color(t), PixelLayout::Bgr, ComponentType::UnsignedByte) => {
            t.iter().for_each(|&[r, g, b, _]| out.extend_from_slice(&[b, g, r]));
        }
        (Texels::Color(t), PixelLayout::Rgba, ComponentType::UnsignedShort5551) => {
            for &[r, g, b, a] in t {
                let p = ((convert_8_to(r, 5) as u16) << 11)
                    | ((convert_8_to(g, 5) as u16) << 6)
                    | ((convert_8_to(b, 5) as u16) << 1)
                    | convert_8_to(a, 1) as u16;
                out.extend_from_slice(&p.to_le_bytes());
            }
        }
        (Texels::Color(t), PixelLayout::Rgb, ComponentType::UnsignedShort565) => {
            for &[r, g, b, _] in t {
                let p = ((convert_8_to(r, 5) as u16) << 11)
                    | ((convert_8_to(g, 6) as u16) << 5)
                    | convert_8_to(b, 5) as u16;
                out.extend_from_slice(&p.to_le_bytes());
            }
        }
        (Texels::Color(t), PixelLayout::Rgba, ComponentType::UnsignedShort4444) => {
            for &[r, g, b, a] in t {
                let p = ((convert_8_to(r, 4) as u16) << 12)
                    | ((convert_8_to(g, 4) as u16) << 8)
                    | ((convert_8_to(b, 4) as u16) << 4)
                    | convert_8_to(a, 4) as u16;
                out.extend_from_slice(&p.to_le_bytes());
            }
        }
        (Texels::DepthStencil(t), PixelLayout::DepthComponent, ComponentType::UnsignedShort) => {
            t.iter().for_each(|d| out.extend_from_slice(&((d.depth >> 8) as u16).to_le_bytes()));
        }
        (Texels::DepthStencil(t), PixelLayout::DepthComponent, ComponentType::UnsignedInt) => {
            t.iter().for_each(|d| out.extend_from_slice(&(d.depth << 8).to_le_bytes()));
        }
        (Texels::DepthStencil(t), PixelLayout::DepthStencil, ComponentType::UnsignedInt248) => {
            t.iter()
                .for_each(|d| out.extend_from_slice(&((d.depth << 8) | d.stencil as u32).to_le_bytes()));
        }
        _ => return Err(invalid(format)),
    }

    Ok(out)
}

/// Reduce texels to the precision of the texture's storage format
pub fn store(internal: InternalFormat, texels: Texels) -> Result<Texels, VideoError> {
    let requantize = |c: u8, bits: u32| match bits {
        1 => convert_1_to_8(convert_8_to(c, 1)),
        4 => convert_4_to_8(convert_8_to(c, 4)),
        5 => convert_5_to_8(convert_8_to(c, 5)),
        6 => convert_6_to_8(convert_8_to(c, 6)),
        _ => c,
    };

    match (internal, texels) {
        (InternalFormat::Rgba8, t @ Texels::Color(_)) => Ok(t),
        (InternalFormat::Rgb8, Texels::Color(t)) => {
            Ok(Texels::Color(t.into_iter().map(|[r, g, b, _]| [r, g, b, 255]).collect()))
        }
        (InternalFormat::Rgb5A1, Texels::Color(t)) => Ok(Texels::Color(
            t.into_iter()
                .map(|[r, g, b, a]| [requantize(r, 5), requantize(g, 5), requantize(b, 5), requantize(a, 1)])
                .collect(),
        )),
        (InternalFormat::Rgb565, Texels::Color(t)) => Ok(Texels::Color(
            t.into_iter()
                .map(|[r, g, b, _]| [requantize(r, 5), requantize(g, 6), requantize(b, 5), 255])
                .collect(),
        )),
        (InternalFormat::Rgba4, Texels::Color(t)) => Ok(Texels::Color(
            t.into_iter()
                .map(|c| c.map(|v| requantize(v, 4)))
                .collect(),
        )),
        (InternalFormat::Depth16, Texels::DepthStencil(t)) => Ok(Texels::DepthStencil(
            t.into_iter()
                .map(|d| DepthStencil {
                    depth: d16_to_d24((d.depth >> 8) as u16),
                    stencil: 0,
                })
                .collect(),
        )),
        (InternalFormat::Depth24, Texels::DepthStencil(t)) => Ok(Texels::DepthStencil(
            t.into_iter().map(|d| DepthStencil { stencil: 0, ..d }).collect(),
        )),
        (InternalFormat::Depth24Stencil8, t @ Texels::DepthStencil(_)) => Ok(t),
        (internal, _) => Err(VideoError::InvalidPixelTransfer(format!(
            "texel kind does not match {:?} storage",
            internal
        ))),
    }
}
