//! Error types for the oxidized-pica rasterizer

use thiserror::Error;

/// Main error type for the rasterizer
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Video error: {0}")]
    Video(#[from] VideoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),
}

/// Guest memory errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Invalid address: 0x{0:08x}")]
    InvalidAddress(u32),

    #[error("Access violation at 0x{addr:08x}: {kind}")]
    AccessViolation { addr: u32, kind: AccessKind },

    #[error("Access out of range at 0x{addr:08x} (size 0x{size:x})")]
    OutOfRange { addr: u32, size: u32 },
}

/// Rasterizer and host graphics errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VideoError {
    /// The format has no byte-accurate host equivalent
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Framebuffer incomplete: {0}")]
    IncompleteFramebuffer(String),

    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    #[error("Vulkan error: {0}")]
    Vulkan(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid pixel transfer: {0}")]
    InvalidPixelTransfer(String),

    /// Surface dimensions whose guest size does not fit the address space
    #[error("Surface too large: {width}x{height}")]
    SurfaceTooLarge { width: u32, height: u32 },
}

/// Kind of memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    /// Texture or framebuffer access outside GPU-visible memory
    Gpu,
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Gpu => write!(f, "gpu"),
        }
    }
}

/// Result type alias for rasterizer operations
pub type Result<T> = std::result::Result<T, EmulatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MemoryError::InvalidAddress(0x12345678);
        assert_eq!(format!("{}", err), "Invalid address: 0x12345678");

        let err = MemoryError::AccessViolation {
            addr: 0xDEADBEEF,
            kind: AccessKind::Write,
        };
        assert_eq!(
            format!("{}", err),
            "Access violation at 0xdeadbeef: write"
        );

        let err = VideoError::UnsupportedFormat("ETC1".to_string());
        assert_eq!(format!("{}", err), "Unsupported format: ETC1");
    }

    #[test]
    fn test_error_conversion() {
        let mem_err = MemoryError::OutOfRange { addr: 0x1000, size: 4 };
        let emu_err: EmulatorError = mem_err.into();
        assert!(matches!(emu_err, EmulatorError::Memory(_)));

        let video_err = VideoError::Vulkan("device lost".to_string());
        let emu_err: EmulatorError = video_err.into();
        assert!(matches!(emu_err, EmulatorError::Video(_)));

        let err = VideoError::SurfaceTooLarge { width: 4096, height: 2 };
        assert_eq!(format!("{}", err), "Surface too large: 4096x2");
    }
}
