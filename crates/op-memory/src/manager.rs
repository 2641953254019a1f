//! Memory manager implementation

use crate::constants::*;
use crate::guest::GuestMemory;
use crate::region::{MemoryRegion, RegionFlags};
use op_core::error::{AccessKind, MemoryError};
use parking_lot::RwLock;
use std::sync::Arc;

/// Backing storage for one region
struct RegionStorage {
    desc: MemoryRegion,
    data: RwLock<Vec<u8>>,
}

/// Guest physical memory for the 3DS
///
/// Each region owns its own buffer; an access must fall entirely inside one
/// region.
pub struct MemoryManager {
    regions: Vec<RegionStorage>,
}

impl MemoryManager {
    /// Create the standard 3DS physical memory map
    pub fn new() -> Arc<Self> {
        Self::with_regions(vec![
            MemoryRegion::new("VRAM", VRAM_BASE, VRAM_SIZE, RegionFlags::RW_GPU),
            MemoryRegion::new("DSP RAM", DSP_RAM_BASE, DSP_RAM_SIZE, RegionFlags::RW),
            MemoryRegion::new("AXI WRAM", AXI_WRAM_BASE, AXI_WRAM_SIZE, RegionFlags::RW_GPU),
            MemoryRegion::new("FCRAM", FCRAM_BASE, FCRAM_SIZE, RegionFlags::RW_GPU),
        ])
    }

    /// Create a memory manager over a custom region list
    pub fn with_regions(regions: Vec<MemoryRegion>) -> Arc<Self> {
        let mut regions: Vec<RegionStorage> = regions
            .into_iter()
            .map(|desc| {
                tracing::debug!(
                    "Mapping {} at 0x{:08x} (0x{:x} bytes)",
                    desc.name,
                    desc.base,
                    desc.size
                );
                RegionStorage {
                    data: RwLock::new(vec![0u8; desc.size as usize]),
                    desc,
                }
            })
            .collect();
        regions.sort_by_key(|r| r.desc.base);

        Arc::new(Self { regions })
    }

    /// Get the region descriptors
    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter().map(|r| &r.desc)
    }

    /// Find the region containing `addr`
    pub fn region_of(&self, addr: u32) -> Option<&MemoryRegion> {
        self.find(addr).map(|r| &r.desc)
    }

    fn find(&self, addr: u32) -> Option<&RegionStorage> {
        let idx = self.regions.partition_point(|r| r.desc.base <= addr);
        let region = self.regions.get(idx.checked_sub(1)?)?;
        ((addr as u64) < region.desc.end()).then_some(region)
    }

    fn check(&self, addr: u32, len: usize, required: RegionFlags) -> Result<&RegionStorage, MemoryError> {
        let region = self.find(addr).ok_or(MemoryError::InvalidAddress(addr))?;

        if !region.desc.contains_range(addr, len) {
            return Err(MemoryError::OutOfRange {
                addr,
                size: len as u32,
            });
        }

        if !region.desc.flags.contains(required) {
            let kind = if required.contains(RegionFlags::GPU) {
                AccessKind::Gpu
            } else if required.contains(RegionFlags::WRITE) {
                AccessKind::Write
            } else {
                AccessKind::Read
            };
            return Err(MemoryError::AccessViolation { addr, kind });
        }

        Ok(region)
    }

    /// Fill a range with a byte value
    pub fn fill(&self, addr: u32, len: usize, value: u8) -> Result<(), MemoryError> {
        let region = self.check(addr, len, RegionFlags::WRITE)?;
        let offset = (addr - region.desc.base) as usize;
        region.data.write()[offset..offset + len].fill(value);
        Ok(())
    }
}

impl GuestMemory for MemoryManager {
    fn read_physical(&self, addr: u32, dst: &mut [u8]) -> Result<(), MemoryError> {
        let region = self.check(addr, dst.len(), RegionFlags::READ)?;
        let offset = (addr - region.desc.base) as usize;
        dst.copy_from_slice(&region.data.read()[offset..offset + dst.len()]);
        Ok(())
    }

    fn write_physical(&self, addr: u32, src: &[u8]) -> Result<(), MemoryError> {
        let region = self.check(addr, src.len(), RegionFlags::WRITE)?;
        let offset = (addr - region.desc.base) as usize;
        region.data.write()[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn check_gpu_access(&self, addr: u32, len: usize) -> Result<(), MemoryError> {
        self.check(addr, len, RegionFlags::GPU).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Arc<MemoryManager> {
        MemoryManager::with_regions(vec![
            MemoryRegion::new("low", 0x0000, 0x1_0000, RegionFlags::RW_GPU),
            MemoryRegion::new("rom", 0x2_0000, 0x1000, RegionFlags::READ),
        ])
    }

    #[test]
    fn test_read_write_unaligned() {
        let mem = small();
        mem.write_physical(0x1003, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(mem.read_vec(0x1003, 5).unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(mem.read_u32(0x1004).unwrap(), 0x0504_0302);
    }

    #[test]
    fn test_invalid_address() {
        let mem = small();
        assert_eq!(
            mem.read_u32(0x1_8000),
            Err(MemoryError::InvalidAddress(0x1_8000))
        );
    }

    #[test]
    fn test_cross_region_access() {
        let mem = small();
        let result = mem.write_physical(0xFFFE, &[0; 4]);
        assert_eq!(result, Err(MemoryError::OutOfRange { addr: 0xFFFE, size: 4 }));
    }

    #[test]
    fn test_read_only_region() {
        let mem = small();
        assert!(mem.read_u32(0x2_0000).is_ok());
        assert_eq!(
            mem.write_u32(0x2_0000, 1),
            Err(MemoryError::AccessViolation {
                addr: 0x2_0000,
                kind: AccessKind::Write
            })
        );
    }

    #[test]
    fn test_gpu_visibility() {
        let mem = small();
        assert!(mem.check_gpu_access(0x1000, 0x100).is_ok());
        assert_eq!(
            mem.check_gpu_access(0x2_0000, 4),
            Err(MemoryError::AccessViolation {
                addr: 0x2_0000,
                kind: AccessKind::Gpu
            })
        );

        let mem = MemoryManager::new();
        assert!(mem.check_gpu_access(VRAM_BASE, 0x1000).is_ok());
        assert!(mem.check_gpu_access(DSP_RAM_BASE, 0x1000).is_err());
        // Through the shared handle as the rasterizer sees it
        let shared: Arc<dyn GuestMemory> = mem;
        assert!(shared.check_gpu_access(DSP_RAM_BASE, 4).is_err());
    }

    #[test]
    fn test_standard_map() {
        let mem = MemoryManager::new();
        assert_eq!(mem.regions().count(), 4);
        assert_eq!(mem.region_of(VRAM_BASE + 0x10).unwrap().name, "VRAM");
        assert_eq!(mem.region_of(FCRAM_BASE).unwrap().name, "FCRAM");
        assert!(mem.region_of(0x1000_0000).is_none());
    }
}
