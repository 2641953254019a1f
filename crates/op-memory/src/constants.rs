//! 3DS physical memory map

/// VRAM base address
pub const VRAM_BASE: u32 = 0x1800_0000;
/// VRAM size (6 MB)
pub const VRAM_SIZE: u32 = 0x0060_0000;

/// DSP memory base address
pub const DSP_RAM_BASE: u32 = 0x1FF0_0000;
/// DSP memory size (512 KB)
pub const DSP_RAM_SIZE: u32 = 0x0008_0000;

/// AXI WRAM base address
pub const AXI_WRAM_BASE: u32 = 0x1FF8_0000;
/// AXI WRAM size (512 KB)
pub const AXI_WRAM_SIZE: u32 = 0x0008_0000;

/// FCRAM base address
pub const FCRAM_BASE: u32 = 0x2000_0000;
/// FCRAM size (128 MB)
pub const FCRAM_SIZE: u32 = 0x0800_0000;
