//! PICA 24-bit floating point
//!
//! Layout is 1 sign bit, 7 exponent bits (bias 63) and 16 mantissa bits.

/// Decode a raw float24 register value to f32.
///
/// Only the low 24 bits of `raw` are significant.
pub fn float24_to_f32(raw: u32) -> f32 {
    let raw = raw & 0x00FF_FFFF;
    if raw == 0 {
        return 0.0;
    }

    let mantissa = (raw & 0xFFFF) << 7;
    let exponent = (((raw >> 16) & 0x7F) + 64) << 23;
    let sign = (raw & 0x80_0000) << 8;
    f32::from_bits(sign | exponent | mantissa)
}

/// Encode an f32 as float24, truncating the mantissa.
///
/// Exponents outside the float24 range saturate.
pub fn f32_to_float24(value: f32) -> u32 {
    if value == 0.0 {
        return 0;
    }

    let bits = value.to_bits();
    let sign = (bits >> 8) & 0x80_0000;
    let exponent = ((bits >> 23) & 0xFF) as i32 - 64;
    let exponent = exponent.clamp(0, 0x7F) as u32;
    let mantissa = (bits & 0x7F_FFFF) >> 7;
    sign | (exponent << 16) | mantissa
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero() {
        assert_eq!(float24_to_f32(0), 0.0);
        assert_eq!(float24_to_f32(0xFF00_0000), 0.0);
    }

    #[test]
    fn test_known_values() {
        // 1.0: exponent 63, mantissa 0
        assert_eq!(float24_to_f32(0x3F_0000), 1.0);
        // 200.0 = 1.5625 * 2^7
        assert_eq!(float24_to_f32(0x46_9000), 200.0);
        // -0.5
        assert_eq!(float24_to_f32(0xBE_0000), -0.5);
    }

    #[test]
    fn test_round_trip() {
        for value in [1.0f32, 120.0, 200.0, 0.25, -3.0, 65504.0] {
            assert_eq!(float24_to_f32(f32_to_float24(value)), value);
        }
    }

    #[test]
    fn test_not_ieee_reinterpretation() {
        let raw = f32_to_float24(160.0);
        assert_ne!(f32::from_bits(raw), 160.0);
        assert_eq!(float24_to_f32(raw), 160.0);
    }
}
