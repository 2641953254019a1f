//! Enumerations encoded in PICA register fields

/// Declares a register-encoded enum with a fallible raw decoder
macro_rules! pica_enum {
    ($(#[$meta:meta])* pub enum $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            /// Decode a raw register field
            pub fn from_raw(raw: u32) -> Option<Self> {
                match raw {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            /// Raw register encoding
            pub fn raw(self) -> u32 {
                self as u32
            }
        }
    };
}

pica_enum! {
    /// Face culling mode
    pub enum CullMode {
        KeepAll = 0,
        KeepClockWise = 1,
        KeepCounterClockWise = 2,
    }
}

pica_enum! {
    /// Texture formats
    pub enum TextureFormat {
        Rgba8 = 0,
        Rgb8 = 1,
        Rgb5a1 = 2,
        Rgb565 = 3,
        Rgba4 = 4,
        Ia8 = 5,
        Rg8 = 6,
        I8 = 7,
        A8 = 8,
        Ia4 = 9,
        I4 = 10,
        A4 = 11,
        Etc1 = 12,
        Etc1a4 = 13,
    }
}

pica_enum! {
    /// Color buffer formats
    pub enum ColorFormat {
        Rgba8 = 0,
        Rgb8 = 1,
        Rgb5a1 = 2,
        Rgb565 = 3,
        Rgba4 = 4,
    }
}

pica_enum! {
    /// Depth buffer formats
    pub enum DepthFormat {
        D16 = 0,
        D24 = 2,
        D24S8 = 3,
    }
}

pica_enum! {
    /// Texture coordinate wrapping
    pub enum WrapMode {
        ClampToEdge = 0,
        ClampToBorder = 1,
        Repeat = 2,
        MirroredRepeat = 3,
    }
}

pica_enum! {
    /// Texture filter
    pub enum TextureFilter {
        Nearest = 0,
        Linear = 1,
    }
}

pica_enum! {
    /// Blend equation
    pub enum BlendEquation {
        Add = 0,
        Subtract = 1,
        ReverseSubtract = 2,
        Min = 3,
        Max = 4,
    }
}

pica_enum! {
    /// Blend factor
    pub enum BlendFactor {
        Zero = 0,
        One = 1,
        SourceColor = 2,
        OneMinusSourceColor = 3,
        DestColor = 4,
        OneMinusDestColor = 5,
        SourceAlpha = 6,
        OneMinusSourceAlpha = 7,
        DestAlpha = 8,
        OneMinusDestAlpha = 9,
        ConstantColor = 10,
        OneMinusConstantColor = 11,
        ConstantAlpha = 12,
        OneMinusConstantAlpha = 13,
        SourceAlphaSaturate = 14,
    }
}

pica_enum! {
    /// Framebuffer logic operation
    pub enum LogicOp {
        Clear = 0,
        And = 1,
        AndReverse = 2,
        Copy = 3,
        Set = 4,
        CopyInverted = 5,
        NoOp = 6,
        Invert = 7,
        Nand = 8,
        Or = 9,
        Nor = 10,
        Xor = 11,
        Equiv = 12,
        AndInverted = 13,
        OrReverse = 14,
        OrInverted = 15,
    }
}

pica_enum! {
    /// Comparison function for alpha, stencil and depth tests
    pub enum CompareFunc {
        Never = 0,
        Always = 1,
        Equal = 2,
        NotEqual = 3,
        LessThan = 4,
        LessThanOrEqual = 5,
        GreaterThan = 6,
        GreaterThanOrEqual = 7,
    }
}

pica_enum! {
    /// Stencil buffer update action
    pub enum StencilAction {
        Keep = 0,
        Zero = 1,
        Replace = 2,
        Increment = 3,
        Decrement = 4,
        Invert = 5,
        IncrementWrap = 6,
        DecrementWrap = 7,
    }
}

pica_enum! {
    /// TEV combiner input source
    pub enum TevSource {
        PrimaryColor = 0,
        PrimaryFragmentColor = 1,
        SecondaryFragmentColor = 2,
        Texture0 = 3,
        Texture1 = 4,
        Texture2 = 5,
        Texture3 = 6,
        PreviousBuffer = 13,
        Constant = 14,
        Previous = 15,
    }
}

pica_enum! {
    /// TEV color input modifier
    pub enum TevColorModifier {
        SourceColor = 0,
        OneMinusSourceColor = 1,
        SourceAlpha = 2,
        OneMinusSourceAlpha = 3,
        SourceRed = 4,
        OneMinusSourceRed = 5,
        SourceGreen = 8,
        OneMinusSourceGreen = 9,
        SourceBlue = 12,
        OneMinusSourceBlue = 13,
    }
}

pica_enum! {
    /// TEV alpha input modifier
    pub enum TevAlphaModifier {
        SourceAlpha = 0,
        OneMinusSourceAlpha = 1,
        SourceRed = 2,
        OneMinusSourceRed = 3,
        SourceGreen = 4,
        OneMinusSourceGreen = 5,
        SourceBlue = 6,
        OneMinusSourceBlue = 7,
    }
}

pica_enum! {
    /// TEV combiner operation
    pub enum TevOperation {
        Replace = 0,
        Modulate = 1,
        Add = 2,
        AddSigned = 3,
        Lerp = 4,
        Subtract = 5,
        Dot3Rgb = 6,
        MultiplyThenAdd = 8,
        AddThenMultiply = 9,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw() {
        assert_eq!(CullMode::from_raw(1), Some(CullMode::KeepClockWise));
        assert_eq!(CullMode::from_raw(3), None);
        assert_eq!(DepthFormat::from_raw(1), None);
        assert_eq!(DepthFormat::from_raw(3), Some(DepthFormat::D24S8));
        assert_eq!(TevSource::from_raw(7), None);
        assert_eq!(TevOperation::from_raw(8), Some(TevOperation::MultiplyThenAdd));
    }

    #[test]
    fn test_raw() {
        assert_eq!(TextureFormat::Etc1a4.raw(), 13);
        assert_eq!(TevColorModifier::OneMinusSourceBlue.raw(), 13);
    }
}
