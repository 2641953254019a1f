//! Guest physical memory for the oxidized-pica rasterizer
//!
//! This crate provides the byte-addressable physical memory the rasterizer
//! reads textures and framebuffers from and flushes rendered pixels back to.

pub mod constants;
pub mod guest;
pub mod manager;
pub mod region;

pub use constants::*;
pub use guest::GuestMemory;
pub use manager::MemoryManager;
pub use region::{MemoryRegion, RegionFlags};
