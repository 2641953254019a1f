//! Physical memory regions

use bitflags::bitflags;

bitflags! {
    /// Region access flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u32 {
        /// Region is readable
        const READ  = 0b0000_0001;
        /// Region is writable
        const WRITE = 0b0000_0010;
        /// Region is GPU-visible (framebuffers and textures may live here)
        const GPU   = 0b0000_0100;

        const RW = Self::READ.bits() | Self::WRITE.bits();
        const RW_GPU = Self::RW.bits() | Self::GPU.bits();
    }
}

/// Memory region descriptor
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    /// Base physical address
    pub base: u32,
    /// Size in bytes
    pub size: u32,
    /// Access flags
    pub flags: RegionFlags,
    /// Region name
    pub name: &'static str,
}

impl MemoryRegion {
    pub fn new(name: &'static str, base: u32, size: u32, flags: RegionFlags) -> Self {
        Self { base, size, flags, name }
    }

    /// One past the last address of the region
    pub fn end(&self) -> u64 {
        self.base as u64 + self.size as u64
    }

    /// Whether `[addr, addr + len)` lies entirely inside this region
    pub fn contains_range(&self, addr: u32, len: usize) -> bool {
        addr >= self.base && (addr as u64 + len as u64) <= self.end()
    }
}
