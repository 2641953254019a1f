//! Format catalog
//!
//! Maps guest surface formats to their size and to the host texture format
//! used for byte-accurate upload and readback.

use op_core::error::VideoError;

use crate::backend::types::{ComponentType, HostFormat, InternalFormat, PixelLayout};
use crate::pica::{ColorFormat, DepthFormat, TextureFormat};

/// Every pixel format a cached surface can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SurfaceFormat {
    // Shared between textures and color buffers
    Rgba8,
    Rgb8,
    Rgb5a1,
    Rgb565,
    Rgba4,

    // Texture-only formats
    Ia8,
    Rg8,
    I8,
    A8,
    Ia4,
    I4,
    A4,
    Etc1,
    Etc1a4,

    // Depth buffer formats
    D16,
    D24,
    D24S8,
}

const FB_RGBA8: HostFormat =
    HostFormat::new(InternalFormat::Rgba8, PixelLayout::Rgba, ComponentType::UnsignedInt8888);
const FB_RGB8: HostFormat =
    HostFormat::new(InternalFormat::Rgb8, PixelLayout::Bgr, ComponentType::UnsignedByte);
const FB_RGB5A1: HostFormat =
    HostFormat::new(InternalFormat::Rgb5A1, PixelLayout::Rgba, ComponentType::UnsignedShort5551);
const FB_RGB565: HostFormat =
    HostFormat::new(InternalFormat::Rgb565, PixelLayout::Rgb, ComponentType::UnsignedShort565);
const FB_RGBA4: HostFormat =
    HostFormat::new(InternalFormat::Rgba4, PixelLayout::Rgba, ComponentType::UnsignedShort4444);

const DEPTH_D16: HostFormat =
    HostFormat::new(InternalFormat::Depth16, PixelLayout::DepthComponent, ComponentType::UnsignedShort);
const DEPTH_D24: HostFormat =
    HostFormat::new(InternalFormat::Depth24, PixelLayout::DepthComponent, ComponentType::UnsignedInt);
const DEPTH_D24S8: HostFormat =
    HostFormat::new(InternalFormat::Depth24Stencil8, PixelLayout::DepthStencil, ComponentType::UnsignedInt248);

impl SurfaceFormat {
    pub fn from_texture_format(format: TextureFormat) -> Self {
        match format {
            TextureFormat::Rgba8 => Self::Rgba8,
            TextureFormat::Rgb8 => Self::Rgb8,
            TextureFormat::Rgb5a1 => Self::Rgb5a1,
            TextureFormat::Rgb565 => Self::Rgb565,
            TextureFormat::Rgba4 => Self::Rgba4,
            TextureFormat::Ia8 => Self::Ia8,
            TextureFormat::Rg8 => Self::Rg8,
            TextureFormat::I8 => Self::I8,
            TextureFormat::A8 => Self::A8,
            TextureFormat::Ia4 => Self::Ia4,
            TextureFormat::I4 => Self::I4,
            TextureFormat::A4 => Self::A4,
            TextureFormat::Etc1 => Self::Etc1,
            TextureFormat::Etc1a4 => Self::Etc1a4,
        }
    }

    pub fn from_color_format(format: ColorFormat) -> Self {
        match format {
            ColorFormat::Rgba8 => Self::Rgba8,
            ColorFormat::Rgb8 => Self::Rgb8,
            ColorFormat::Rgb5a1 => Self::Rgb5a1,
            ColorFormat::Rgb565 => Self::Rgb565,
            ColorFormat::Rgba4 => Self::Rgba4,
        }
    }

    pub fn from_depth_format(format: DepthFormat) -> Self {
        match format {
            DepthFormat::D16 => Self::D16,
            DepthFormat::D24 => Self::D24,
            DepthFormat::D24S8 => Self::D24S8,
        }
    }

    /// Texture format with the same texel encoding, if any
    pub fn texture_format(self) -> Option<TextureFormat> {
        Some(match self {
            Self::Rgba8 => TextureFormat::Rgba8,
            Self::Rgb8 => TextureFormat::Rgb8,
            Self::Rgb5a1 => TextureFormat::Rgb5a1,
            Self::Rgb565 => TextureFormat::Rgb565,
            Self::Rgba4 => TextureFormat::Rgba4,
            Self::Ia8 => TextureFormat::Ia8,
            Self::Rg8 => TextureFormat::Rg8,
            Self::I8 => TextureFormat::I8,
            Self::A8 => TextureFormat::A8,
            Self::Ia4 => TextureFormat::Ia4,
            Self::I4 => TextureFormat::I4,
            Self::A4 => TextureFormat::A4,
            Self::Etc1 => TextureFormat::Etc1,
            Self::Etc1a4 => TextureFormat::Etc1a4,
            Self::D16 | Self::D24 | Self::D24S8 => return None,
        })
    }

    pub fn bits_per_pixel(self) -> u32 {
        match self {
            Self::Rgba8 => 32,
            Self::Rgb8 => 24,
            Self::Rgb5a1 | Self::Rgb565 | Self::Rgba4 => 16,
            Self::Ia8 | Self::Rg8 => 16,
            Self::I8 | Self::A8 | Self::Ia4 => 8,
            Self::I4 | Self::A4 => 4,
            Self::Etc1 => 4,
            Self::Etc1a4 => 8,
            Self::D16 => 16,
            Self::D24 => 24,
            Self::D24S8 => 32,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Self::D16 | Self::D24 | Self::D24S8)
    }

    pub fn has_stencil(self) -> bool {
        self == Self::D24S8
    }

    /// Host format triple for byte-accurate transfer of this format.
    ///
    /// Texture-only formats have no host equivalent and fail with
    /// [`VideoError::UnsupportedFormat`].
    pub fn host_format(self) -> Result<HostFormat, VideoError> {
        match self {
            Self::Rgba8 => Ok(FB_RGBA8),
            Self::Rgb8 => Ok(FB_RGB8),
            Self::Rgb5a1 => Ok(FB_RGB5A1),
            Self::Rgb565 => Ok(FB_RGB565),
            Self::Rgba4 => Ok(FB_RGBA4),
            Self::D16 => Ok(DEPTH_D16),
            Self::D24 => Ok(DEPTH_D24),
            Self::D24S8 => Ok(DEPTH_D24S8),
            other => Err(VideoError::UnsupportedFormat(format!("{:?}", other))),
        }
    }
}
