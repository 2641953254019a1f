//! Morton (Z-order) tiling codec
//!
//! Guest surfaces are stored as rows of 8x8 tiles. Within a tile, pixels
//! follow a Z-order curve: bit 0 of the tile-local index is x0, bit 1 is y0,
//! bit 2 is x1 and so on. Host surfaces are linear with the rows flipped
//! vertically, since guest row 0 is the top of the image and host row 0 is
//! the bottom.

/// Tile-local Morton index for `(y & 7) * 8 + (x & 7)`
pub const MORTON_LUT: [u32; 64] = [
    0, 1, 4, 5, 16, 17, 20, 21,
    2, 3, 6, 7, 18, 19, 22, 23,
    8, 9, 12, 13, 24, 25, 28, 29,
    10, 11, 14, 15, 26, 27, 30, 31,
    32, 33, 36, 37, 48, 49, 52, 53,
    34, 35, 38, 39, 50, 51, 54, 55,
    40, 41, 44, 45, 56, 57, 60, 61,
    42, 43, 46, 47, 58, 59, 62, 63,
];

/// Round up to the next multiple of the tile size. Saturates near `u32::MAX`.
#[inline]
pub fn align_to_tile(value: u32) -> u32 {
    value.saturating_add(7) & !7
}

/// Byte offset of `(x, y)` relative to the start of its tile row.
///
/// The tile column contributes `(x & !7) * 8 * bytes_per_pixel`; the
/// intra-tile position comes from [`MORTON_LUT`].
#[inline]
pub fn morton_offset(x: u32, y: u32, bytes_per_pixel: u32) -> u32 {
    let i = ((y & 7) * 8 + (x & 7)) as usize;
    let coarse_x = x & !7;
    (MORTON_LUT[i] + coarse_x * 8) * bytes_per_pixel
}

/// Byte offset of `(x, y)` in a tiled surface `width` pixels wide.
///
/// Widths that are not a multiple of 8 are padded to a whole tile.
#[inline]
pub fn tiled_offset(x: u32, y: u32, width: u32, bytes_per_pixel: u32) -> u32 {
    let coarse_y = y & !7;
    morton_offset(x, y, bytes_per_pixel) + coarse_y * align_to_tile(width) * bytes_per_pixel
}

/// Recover tile-local `(x, y)` from a Morton index in `0..64`
#[inline]
pub fn morton_decode(index: u32) -> (u32, u32) {
    let x = (index & 1) | ((index >> 1) & 2) | ((index >> 2) & 4);
    let y = ((index >> 1) & 1) | ((index >> 2) & 2) | ((index >> 3) & 4);
    (x, y)
}

/// Number of guest bytes spanned by a tiled surface, or `None` when it
/// exceeds the 32-bit physical address space
pub fn tiled_size(width: u32, height: u32, bits_per_pixel: u32) -> Option<u32> {
    let align = |v: u32| (v as u64 + 7) & !7;
    let bytes = align(width) * align(height) * bits_per_pixel as u64 / 8;
    u32::try_from(bytes).ok()
}

/// Convert a tiled guest image into linear, bottom-up host rows.
///
/// `guest` must hold at least [`tiled_size`] bytes.
pub fn untile(guest: &[u8], width: u32, height: u32, bytes_per_pixel: u32) -> Vec<u8> {
    let bpp = bytes_per_pixel as usize;
    let mut host = vec![0u8; (width * height) as usize * bpp];

    for y in 0..height {
        let host_row = (height - 1 - y) * width;
        for x in 0..width {
            let src = tiled_offset(x, y, width, bytes_per_pixel) as usize;
            let dst = (host_row + x) as usize * bpp;
            host[dst..dst + bpp].copy_from_slice(&guest[src..src + bpp]);
        }
    }

    host
}

/// Write linear, bottom-up host rows into a tiled guest image.
///
/// Bytes of `guest` outside the `width` x `height` area are left untouched.
pub fn tile(host: &[u8], guest: &mut [u8], width: u32, height: u32, bytes_per_pixel: u32) {
    let bpp = bytes_per_pixel as usize;

    for y in 0..height {
        let host_row = (height - 1 - y) * width;
        for x in 0..width {
            let dst = tiled_offset(x, y, width, bytes_per_pixel) as usize;
            let src = (host_row + x) as usize * bpp;
            guest[dst..dst + bpp].copy_from_slice(&host[src..src + bpp]);
        }
    }
}

/// Guest D24S8 (depth in bits 0-23, stencil in 24-31) to host (depth << 8 | stencil)
#[inline]
pub fn d24s8_guest_to_host(guest: u32) -> u32 {
    guest.rotate_left(8)
}

/// Host (depth << 8 | stencil) to guest D24S8
#[inline]
pub fn d24s8_host_to_guest(host: u32) -> u32 {
    host.rotate_right(8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_lut_matches_bit_interleave() {
        for y in 0..8u32 {
            for x in 0..8u32 {
                let interleaved = (x & 1) | ((y & 1) << 1) | ((x & 2) << 1) | ((y & 2) << 2)
                    | ((x & 4) << 2) | ((y & 4) << 3);
                assert_eq!(MORTON_LUT[(y * 8 + x) as usize], interleaved);
            }
        }
    }

    #[test]
    fn test_tile_offset_bijection() {
        for bpp in [1u32, 2, 4] {
            let mut seen = HashSet::new();
            for y in 0..8 {
                for x in 0..8 {
                    let offset = morton_offset(x, y, bpp);
                    assert!(offset < 64 * bpp);
                    assert_eq!(offset % bpp, 0);
                    assert!(seen.insert(offset));
                    assert_eq!(morton_decode(offset / bpp), (x, y));
                }
            }
            assert_eq!(seen.len(), 64);
        }
    }

    #[test]
    fn test_second_tile_row() {
        // First pixel of the second tile row in a 16-wide RGBA8 surface
        assert_eq!(tiled_offset(0, 8, 16, 4), 16 * 8 * 4);
        // Second tile in the first row
        assert_eq!(tiled_offset(8, 0, 16, 4), 64 * 4);
    }

    #[test]
    fn test_unaligned_width_padding() {
        // A 12-wide surface occupies two tiles per row
        assert_eq!(tiled_size(12, 8, 32), Some(2 * 64 * 4));
        assert_eq!(tiled_offset(0, 8, 12, 4), 16 * 8 * 4);
        assert_eq!(tiled_offset(11, 7, 12, 4), (64 + MORTON_LUT[7 * 8 + 3]) * 4);
    }

    #[test]
    fn test_oversize_surface_has_no_size() {
        assert_eq!(tiled_size(u32::MAX, u32::MAX, 32), None);
        assert_eq!(tiled_size(0xFFFF, 0xFFFF, 32), None);
        assert_eq!(tiled_size(2047, 2047, 32), Some(2048 * 2048 * 4));
        assert_eq!(align_to_tile(u32::MAX), 0xFFFF_FFF8);
    }

    #[test]
    fn test_untile_flips_rows() {
        // 8x8 single-byte image where each byte is its Morton index
        let guest: Vec<u8> = (0..64u8).collect();
        let host = untile(&guest, 8, 8, 1);
        // Top-left guest pixel lands at the start of the last host row
        assert_eq!(host[7 * 8], 0);
        // Bottom-left guest pixel (0, 7) is the first host pixel
        assert_eq!(host[0], MORTON_LUT[7 * 8] as u8);
    }

    #[test]
    fn test_tile_preserves_padding_bytes() {
        let mut guest = vec![0xEEu8; tiled_size(4, 4, 8).unwrap() as usize];
        let host = vec![0x11u8; 16];
        tile(&host, &mut guest, 4, 4, 1);
        assert_eq!(guest.iter().filter(|&&b| b == 0x11).count(), 16);
        assert_eq!(guest.iter().filter(|&&b| b == 0xEE).count(), 48);
    }

    #[test]
    fn test_d24s8_rotation() {
        let guest = 0xAB12_3456; // stencil 0xAB, depth 0x123456
        assert_eq!(d24s8_guest_to_host(guest), 0x1234_56AB);
        assert_eq!(d24s8_host_to_guest(0x1234_56AB), guest);
    }

    proptest! {
        #[test]
        fn prop_tile_untile_round_trip(
            w_tiles in 1u32..5,
            h_tiles in 1u32..5,
            bpp in prop::sample::select(vec![1u32, 2, 3, 4]),
            seed in any::<u64>(),
        ) {
            let (width, height) = (w_tiles * 8, h_tiles * 8);
            let len = tiled_size(width, height, bpp * 8).unwrap() as usize;
            let guest: Vec<u8> = (0..len)
                .map(|i| (seed.wrapping_mul(i as u64 + 1) >> 24) as u8)
                .collect();

            let host = untile(&guest, width, height, bpp);
            let mut back = vec![0u8; len];
            tile(&host, &mut back, width, height, bpp);
            prop_assert_eq!(back, guest);
        }

        #[test]
        fn prop_tiled_offsets_unique(width in 1u32..40, height in 1u32..40, bpp in 1u32..5) {
            let mut seen = HashSet::new();
            for y in 0..height {
                for x in 0..width {
                    let offset = tiled_offset(x, y, width, bpp);
                    prop_assert!(offset + bpp <= tiled_size(width, height, bpp * 8).unwrap());
                    prop_assert!(seen.insert(offset));
                }
            }
        }
    }
}
