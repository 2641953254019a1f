//! Guest physical memory interface consumed by the rasterizer

use op_core::error::MemoryError;

/// Byte-addressable guest physical memory.
///
/// Accesses carry no alignment requirement. Implementations must be safe to
/// share with the rasterizer thread.
pub trait GuestMemory: Send + Sync {
    /// Read `dst.len()` bytes starting at `addr`
    fn read_physical(&self, addr: u32, dst: &mut [u8]) -> Result<(), MemoryError>;

    /// Write `src` starting at `addr`
    fn write_physical(&self, addr: u32, src: &[u8]) -> Result<(), MemoryError>;

    /// Check that `[addr, addr + len)` may hold a GPU surface.
    ///
    /// Memory without a notion of GPU visibility accepts every range.
    fn check_gpu_access(&self, addr: u32, len: usize) -> Result<(), MemoryError> {
        let _ = (addr, len);
        Ok(())
    }

    /// Read `len` bytes into a new buffer
    fn read_vec(&self, addr: u32, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0u8; len];
        self.read_physical(addr, &mut buf)?;
        Ok(buf)
    }

    /// Read a little-endian u32
    fn read_u32(&self, addr: u32) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read_physical(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write a little-endian u32
    fn write_u32(&self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write_physical(addr, &value.to_le_bytes())
    }
}

impl<T: GuestMemory + ?Sized> GuestMemory for std::sync::Arc<T> {
    fn read_physical(&self, addr: u32, dst: &mut [u8]) -> Result<(), MemoryError> {
        (**self).read_physical(addr, dst)
    }

    fn write_physical(&self, addr: u32, src: &[u8]) -> Result<(), MemoryError> {
        (**self).write_physical(addr, src)
    }

    fn check_gpu_access(&self, addr: u32, len: usize) -> Result<(), MemoryError> {
        (**self).check_gpu_access(addr, len)
    }
}
