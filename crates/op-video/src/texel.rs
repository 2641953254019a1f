//! Texel decoder for every PICA texture format
//!
//! Produces RGBA8 from tiled guest texture data. ETC1 textures further split
//! each 8x8 tile into four 4x4 blocks, each optionally preceded by a 64-bit
//! block of 4-bit alpha values (ETC1A4).

use crate::color::*;
use crate::pica::TextureFormat;
use crate::tiling::{align_to_tile, MORTON_LUT};

/// Geometry and format of a texture in guest memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl TextureInfo {
    pub fn bits_per_pixel(&self) -> u32 {
        match self.format {
            TextureFormat::Rgba8 => 32,
            TextureFormat::Rgb8 => 24,
            TextureFormat::Rgb5a1
            | TextureFormat::Rgb565
            | TextureFormat::Rgba4
            | TextureFormat::Ia8
            | TextureFormat::Rg8 => 16,
            TextureFormat::I8 | TextureFormat::A8 | TextureFormat::Ia4 | TextureFormat::Etc1a4 => 8,
            TextureFormat::I4 | TextureFormat::A4 | TextureFormat::Etc1 => 4,
        }
    }
}

#[inline]
fn byte(data: &[u8], offset: usize) -> u8 {
    data.get(offset).copied().unwrap_or(0)
}

#[inline]
fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([byte(data, offset), byte(data, offset + 1)])
}

#[inline]
fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = byte(data, offset + i);
    }
    u64::from_le_bytes(bytes)
}

/// Offset of `(x, y)` in units of `bits_per_pixel`
#[inline]
fn texel_index(x: u32, y: u32, width: u32) -> usize {
    let morton = MORTON_LUT[((y & 7) * 8 + (x & 7)) as usize];
    ((x & !7) * 8 + (y & !7) * align_to_tile(width) + morton) as usize
}

/// Decode the texel at `(x, y)`, with y = 0 the top row
pub fn lookup_texel(data: &[u8], x: u32, y: u32, info: &TextureInfo) -> [u8; 4] {
    let index = texel_index(x, y, info.width);

    match info.format {
        TextureFormat::Rgba8 => {
            let o = index * 4;
            [byte(data, o + 3), byte(data, o + 2), byte(data, o + 1), byte(data, o)]
        }
        TextureFormat::Rgb8 => {
            let o = index * 3;
            [byte(data, o + 2), byte(data, o + 1), byte(data, o), 255]
        }
        TextureFormat::Rgb5a1 => {
            let p = read_u16(data, index * 2);
            [
                convert_5_to_8(((p >> 11) & 0x1F) as u8),
                convert_5_to_8(((p >> 6) & 0x1F) as u8),
                convert_5_to_8(((p >> 1) & 0x1F) as u8),
                convert_1_to_8((p & 1) as u8),
            ]
        }
        TextureFormat::Rgb565 => {
            let p = read_u16(data, index * 2);
            [
                convert_5_to_8(((p >> 11) & 0x1F) as u8),
                convert_6_to_8(((p >> 5) & 0x3F) as u8),
                convert_5_to_8((p & 0x1F) as u8),
                255,
            ]
        }
        TextureFormat::Rgba4 => {
            let p = read_u16(data, index * 2);
            [
                convert_4_to_8(((p >> 12) & 0xF) as u8),
                convert_4_to_8(((p >> 8) & 0xF) as u8),
                convert_4_to_8(((p >> 4) & 0xF) as u8),
                convert_4_to_8((p & 0xF) as u8),
            ]
        }
        TextureFormat::Ia8 => {
            let o = index * 2;
            let i = byte(data, o + 1);
            [i, i, i, byte(data, o)]
        }
        TextureFormat::Rg8 => {
            let o = index * 2;
            [byte(data, o + 1), byte(data, o), 0, 255]
        }
        TextureFormat::I8 => {
            let i = byte(data, index);
            [i, i, i, 255]
        }
        TextureFormat::A8 => [0, 0, 0, byte(data, index)],
        TextureFormat::Ia4 => {
            let p = byte(data, index);
            let i = convert_4_to_8(p >> 4);
            [i, i, i, convert_4_to_8(p & 0xF)]
        }
        TextureFormat::I4 => {
            let i = convert_4_to_8(nibble(data, index));
            [i, i, i, 255]
        }
        TextureFormat::A4 => [0, 0, 0, convert_4_to_8(nibble(data, index))],
        TextureFormat::Etc1 | TextureFormat::Etc1a4 => lookup_etc1(data, x, y, info),
    }
}

/// Odd texels live in the high nibble
#[inline]
fn nibble(data: &[u8], index: usize) -> u8 {
    let b = byte(data, index / 2);
    if index % 2 == 1 { b >> 4 } else { b & 0xF }
}

const ETC1_MODIFIERS: [[i32; 2]; 8] = [
    [2, 8],
    [5, 17],
    [9, 29],
    [13, 42],
    [18, 60],
    [24, 80],
    [33, 106],
    [47, 183],
];

fn lookup_etc1(data: &[u8], x: u32, y: u32, info: &TextureInfo) -> [u8; 4] {
    let has_alpha = info.format == TextureFormat::Etc1a4;
    let block_bytes: usize = if has_alpha { 16 } else { 8 };

    let coarse_x = (x & !7) as usize;
    let coarse_y = (y & !7) as usize;
    let subtile = (((x / 4) & 1) + 2 * ((y / 4) & 1)) as usize;
    let tiles_per_row = (align_to_tile(info.width) / 8) as usize;

    // Four blocks per tile
    let offset = (coarse_x / 8) * block_bytes * 4
        + (coarse_y / 8) * block_bytes * 4 * tiles_per_row
        + subtile * block_bytes;

    let (alpha, color_offset) = if has_alpha {
        (read_u64(data, offset), offset + 8)
    } else {
        (u64::MAX, offset)
    };

    let (bx, by) = (x & 3, y & 3);
    let [r, g, b] = etc1_rgb(read_u64(data, color_offset), bx, by);
    let a = convert_4_to_8(((alpha >> (4 * (bx * 4 + by))) & 0xF) as u8);
    [r, g, b, a]
}

/// Decode one texel of a little-endian ETC1 block
fn etc1_rgb(block: u64, x: u32, y: u32) -> [u8; 3] {
    let field = |shift: u32, width: u32| ((block >> shift) & ((1u64 << width) - 1)) as i32;

    let texel = 4 * x + y;
    let flip = field(32, 1) != 0;
    let differential = field(33, 1) != 0;

    // The flip bit selects horizontal instead of vertical sub-block halves
    let second_half = if flip { y >= 2 } else { x >= 2 };

    let base = if differential {
        let mut r = field(59, 5);
        let mut g = field(51, 5);
        let mut b = field(43, 5);
        if second_half {
            let signed = |v: i32| if v & 4 != 0 { v - 8 } else { v };
            r += signed(field(56, 3));
            g += signed(field(48, 3));
            b += signed(field(40, 3));
        }
        [r, g, b].map(|c| convert_5_to_8(c.clamp(0, 31) as u8) as i32)
    } else if second_half {
        [field(56, 4), field(48, 4), field(40, 4)].map(|c| convert_4_to_8(c as u8) as i32)
    } else {
        [field(60, 4), field(52, 4), field(44, 4)].map(|c| convert_4_to_8(c as u8) as i32)
    };

    let table = if second_half { field(34, 3) } else { field(37, 3) } as usize;
    let mut modifier = ETC1_MODIFIERS[table][((block >> texel) & 1) as usize];
    if (block >> (16 + texel)) & 1 != 0 {
        modifier = -modifier;
    }

    base.map(|c| (c + modifier).clamp(0, 255) as u8)
}

/// Decode a whole texture to RGBA8 host rows, bottom row first
pub fn decode_texture(data: &[u8], info: &TextureInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity((info.width * info.height * 4) as usize);
    for host_y in 0..info.height {
        let y = info.height - 1 - host_y;
        for x in 0..info.width {
            out.extend_from_slice(&lookup_texel(data, x, y, info));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiling::tiled_offset;

    fn info(format: TextureFormat) -> TextureInfo {
        TextureInfo {
            width: 8,
            height: 8,
            format,
        }
    }

    #[test]
    fn test_rgba8_byte_order() {
        let mut data = vec![0u8; 256];
        let o = tiled_offset(1, 0, 8, 4) as usize;
        data[o..o + 4].copy_from_slice(&[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(lookup_texel(&data, 1, 0, &info(TextureFormat::Rgba8)), [0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_rgb565() {
        let mut data = vec![0u8; 128];
        let o = tiled_offset(3, 5, 8, 2) as usize;
        data[o..o + 2].copy_from_slice(&0xF81Fu16.to_le_bytes());
        assert_eq!(lookup_texel(&data, 3, 5, &info(TextureFormat::Rgb565)), [255, 0, 255, 255]);
    }

    #[test]
    fn test_rgb5a1() {
        let mut data = vec![0u8; 128];
        data[0..2].copy_from_slice(&0x07C1u16.to_le_bytes());
        assert_eq!(lookup_texel(&data, 0, 0, &info(TextureFormat::Rgb5a1)), [0, 255, 0, 255]);
    }

    #[test]
    fn test_ia8_and_rg8() {
        let data = [0x80u8, 0x40];
        assert_eq!(lookup_texel(&data, 0, 0, &info(TextureFormat::Ia8)), [0x40, 0x40, 0x40, 0x80]);
        assert_eq!(lookup_texel(&data, 0, 0, &info(TextureFormat::Rg8)), [0x40, 0x80, 0, 255]);
    }

    #[test]
    fn test_4bit_nibble_order() {
        // Texel 0 is the low nibble, texel 1 the high one
        let mut data = vec![0u8; 32];
        data[0] = 0xA5;
        assert_eq!(lookup_texel(&data, 0, 0, &info(TextureFormat::I4)), [0x55, 0x55, 0x55, 255]);
        assert_eq!(lookup_texel(&data, 1, 0, &info(TextureFormat::A4)), [0, 0, 0, 0xAA]);
    }

    #[test]
    fn test_ia4() {
        let data = [0x3Cu8];
        assert_eq!(lookup_texel(&data, 0, 0, &info(TextureFormat::Ia4)), [0x33, 0x33, 0x33, 0xCC]);
    }

    #[test]
    fn test_etc1_individual_mode() {
        // Base colors 0xF/0x0 per half, table 0, all modifiers positive small
        let block: u64 = (0xFu64 << 60) | (0xFu64 << 52) | (0xFu64 << 44);
        let data = block.to_le_bytes();
        let tex = info(TextureFormat::Etc1);
        // Left half: 255 + 2 clamps to 255
        assert_eq!(lookup_texel(&data, 0, 0, &tex), [255, 255, 255, 255]);
        // Right half: 0 + 2
        assert_eq!(lookup_texel(&data, 3, 0, &tex), [2, 2, 2, 255]);
    }

    #[test]
    fn test_etc1_negation_and_table() {
        // Right half base 0x8 -> 0x88, table 7, texel (2,0) uses large negated modifier
        let texel = 4 * 2;
        let block: u64 = (0x8u64 << 56) | (0x8u64 << 48) | (0x8u64 << 40)
            | (7u64 << 34)
            | (1u64 << texel)
            | (1u64 << (16 + texel));
        let data = block.to_le_bytes();
        let expected = (0x88i32 - 183).clamp(0, 255) as u8;
        assert_eq!(lookup_texel(&data, 2, 0, &info(TextureFormat::Etc1)), [expected, expected, expected, 255]);
    }

    #[test]
    fn test_etc1a4_alpha() {
        let mut data = vec![0u8; 16];
        // Alpha nibble for texel (1, 2) is at 4 * (1 * 4 + 2)
        let alpha: u64 = 0x9u64 << (4 * (4 + 2));
        data[..8].copy_from_slice(&alpha.to_le_bytes());
        let texel = lookup_texel(&data, 1, 2, &info(TextureFormat::Etc1a4));
        assert_eq!(texel[3], 0x99);
        assert_eq!(lookup_texel(&data, 0, 0, &info(TextureFormat::Etc1a4))[3], 0);
    }

    #[test]
    fn test_etc1_second_tile_offset() {
        // 16-wide ETC1: tile (1, 0) starts 32 bytes in
        let mut data = vec![0u8; 64];
        let block: u64 = (0xFu64 << 60) | (0xFu64 << 52) | (0xFu64 << 44);
        data[32..40].copy_from_slice(&block.to_le_bytes());
        let tex = TextureInfo { width: 16, height: 8, format: TextureFormat::Etc1 };
        assert_eq!(lookup_texel(&data, 8, 0, &tex), [255, 255, 255, 255]);
        assert_eq!(lookup_texel(&data, 0, 0, &tex), [2, 2, 2, 255]);
    }

    #[test]
    fn test_decode_texture_flips() {
        let mut data = vec![0u8; 64];
        // Top-left texel white, everything else black
        data[0] = 0xFF;
        let out = decode_texture(&data, &info(TextureFormat::I8));
        assert_eq!(&out[7 * 8 * 4..7 * 8 * 4 + 4], &[255, 255, 255, 255]);
        assert_eq!(&out[0..4], &[0, 0, 0, 255]);
    }
}
