//! Channel width conversion

/// Expand a 1-bit channel to 8 bits
#[inline]
pub fn convert_1_to_8(value: u8) -> u8 {
    if value & 1 != 0 { 255 } else { 0 }
}

/// Expand a 4-bit channel to 8 bits by bit replication
#[inline]
pub fn convert_4_to_8(value: u8) -> u8 {
    (value << 4) | (value & 0xF)
}

/// Expand a 5-bit channel to 8 bits by bit replication
#[inline]
pub fn convert_5_to_8(value: u8) -> u8 {
    (value << 3) | (value >> 2)
}

/// Expand a 6-bit channel to 8 bits by bit replication
#[inline]
pub fn convert_6_to_8(value: u8) -> u8 {
    (value << 2) | (value >> 4)
}

/// Reduce an 8-bit channel to `bits` bits.
///
/// Truncation is the exact inverse of the replication expansions above.
#[inline]
pub fn convert_8_to(value: u8, bits: u32) -> u8 {
    value >> (8 - bits)
}

/// Unpack an RGBA8 register value (red in the low byte) to normalized floats
pub fn rgba8_to_f32(color: u32) -> [f32; 4] {
    let [r, g, b, a] = color.to_le_bytes();
    [r, g, b, a].map(|c| c as f32 / 255.0)
}
