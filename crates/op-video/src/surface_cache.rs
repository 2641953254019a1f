//! Surface cache
//!
//! Maps guest physical address ranges to host textures and keeps the two
//! copies coherent. Guest bytes are uploaded on a miss, dirty host copies
//! are written back on flush, and guest writes evict stale host copies.
//!
//! Surfaces are keyed by base address. Ranges of different surfaces may
//! overlap, so every range operation works on intersection rather than on
//! key equality.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use op_core::error::{EmulatorError, VideoError};
use op_memory::GuestMemory;
use tracing::{debug, trace, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::backend::{
    ComponentType, FramebufferAttachments, GraphicsBackend, HostFormat, InternalFormat, PixelLayout,
    TextureHandle, RGBA8_BYTES,
};
use crate::format::SurfaceFormat;
use crate::pica::{FramebufferConfig, FullTextureConfig};
use crate::state::PipelineState;
use crate::texel::{decode_texture, TextureInfo};
use crate::tiling;

type Result<T> = std::result::Result<T, EmulatorError>;

/// Guest memory layout of a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TilingFormat {
    /// Rows of pixels, as used by display buffers
    Linear,
    /// 8x8 Morton tiles
    Block8x8,
    /// 8x8 tiles whose contents are replaced by a clear value instead of
    /// being read from guest memory. Colors are RGBA8 with red in the low
    /// byte. Depth formats take depth from bits 0-23 and stencil from 24-31.
    PendingClear(u32),
}

impl TilingFormat {
    /// Layout the surface has once created
    fn resolved(self) -> Self {
        match self {
            Self::PendingClear(_) => Self::Block8x8,
            other => other,
        }
    }
}

/// Lookup key of a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceParams {
    pub addr: u32,
    pub width: u32,
    pub height: u32,
    pub tiling: TilingFormat,
    pub format: SurfaceFormat,
}

impl SurfaceParams {
    /// Guest bytes covered by the surface. Tiled surfaces are padded to whole tiles.
    pub fn size(&self) -> std::result::Result<u32, VideoError> {
        let bpp = self.format.bits_per_pixel();
        let size = match self.tiling {
            TilingFormat::Linear => {
                u32::try_from(self.width as u64 * self.height as u64 * bpp as u64 / 8).ok()
            }
            _ => tiling::tiled_size(self.width, self.height, bpp),
        };
        size.ok_or(VideoError::SurfaceTooLarge {
            width: self.width,
            height: self.height,
        })
    }
}

/// A host copy of a guest memory surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSurface {
    pub addr: u32,
    pub size: u32,
    /// Hash of the guest bytes when last synchronized
    pub hash: u64,
    pub texture: TextureHandle,
    pub width: u32,
    pub height: u32,
    pub tiling: TilingFormat,
    pub format: SurfaceFormat,
    /// The host copy is newer than guest memory
    pub dirty: bool,
}

impl CachedSurface {
    /// One past the last guest byte
    pub fn end(&self) -> u64 {
        self.addr as u64 + self.size as u64
    }

    pub fn intersects(&self, addr: u32, size: u32) -> bool {
        intervals_intersect(self.addr, self.size, addr, size)
    }

    fn matches(&self, params: &SurfaceParams) -> bool {
        self.width == params.width
            && self.height == params.height
            && self.tiling == params.tiling.resolved()
            && self.format == params.format
    }
}

fn intervals_intersect(a: u32, a_size: u32, b: u32, b_size: u32) -> bool {
    (a as u64) < b as u64 + b_size as u64 && (b as u64) < a as u64 + a_size as u64
}

/// Sub-rectangle of a surface in pixels, y = 0 the top row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl SurfaceRect {
    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

/// Surfaces bound as render targets, by cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoundFramebuffer {
    pub color: Option<u32>,
    pub depth: Option<u32>,
}

/// Surface cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SurfaceCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub uploads: u64,
    pub flushes: u64,
    pub evictions: u64,
}

/// Internal format a surface is stored with on the host
fn internal_format(format: SurfaceFormat) -> InternalFormat {
    format.host_format().map(|h| h.internal).unwrap_or(InternalFormat::Rgba8)
}

/// Guest depth pixels to the host layout of the format's host triple
fn depth_guest_to_host(format: SurfaceFormat, pixels: &[u8]) -> Vec<u8> {
    match format {
        SurfaceFormat::D24 => pixels
            .chunks_exact(3)
            .flat_map(|p| [0, p[0], p[1], p[2]])
            .collect(),
        SurfaceFormat::D24S8 => pixels
            .chunks_exact(4)
            .flat_map(|p| {
                tiling::d24s8_guest_to_host(u32::from_le_bytes([p[0], p[1], p[2], p[3]])).to_le_bytes()
            })
            .collect(),
        _ => pixels.to_vec(),
    }
}

/// Inverse of [`depth_guest_to_host`]
fn depth_host_to_guest(format: SurfaceFormat, pixels: &[u8]) -> Vec<u8> {
    match format {
        SurfaceFormat::D24 => pixels.chunks_exact(4).flat_map(|p| [p[1], p[2], p[3]]).collect(),
        SurfaceFormat::D24S8 => pixels
            .chunks_exact(4)
            .flat_map(|p| {
                tiling::d24s8_host_to_guest(u32::from_le_bytes([p[0], p[1], p[2], p[3]])).to_le_bytes()
            })
            .collect(),
        _ => pixels.to_vec(),
    }
}

/// Cache of host copies of guest surfaces
#[derive(Debug, Default)]
pub struct SurfaceCache {
    surfaces: BTreeMap<u32, CachedSurface>,
    released: Vec<TextureHandle>,
    stats: SurfaceCacheStats,
}

impl SurfaceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    pub fn stats(&self) -> SurfaceCacheStats {
        self.stats
    }

    /// Surface cached at exactly `addr`
    pub fn surface(&self, addr: u32) -> Option<&CachedSurface> {
        self.surfaces.get(&addr)
    }

    pub fn surfaces(&self) -> impl Iterator<Item = &CachedSurface> {
        self.surfaces.values()
    }

    /// Record that the host copy at `addr` was rendered to
    pub fn mark_dirty(&mut self, addr: u32) {
        if let Some(surface) = self.surfaces.get_mut(&addr) {
            surface.dirty = true;
        }
    }

    /// Host textures released since the last call
    pub fn take_released(&mut self) -> Vec<TextureHandle> {
        std::mem::take(&mut self.released)
    }

    fn release<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B, surface: CachedSurface) {
        trace!("Evicting surface at 0x{:08x}", surface.addr);
        backend.delete_texture(surface.texture);
        self.released.push(surface.texture);
        self.stats.evictions += 1;
    }

    /// Keys of surfaces intersecting `[addr, addr + size)`
    fn intersecting(&self, addr: u32, size: u32) -> Vec<u32> {
        let upper = addr as u64 + size as u64;
        self.surfaces
            .iter()
            .take_while(|(&key, _)| (key as u64) < upper)
            .filter(|(_, surface)| surface.intersects(addr, size))
            .map(|(&key, _)| key)
            .collect()
    }

    /// Find or create the surface described by `params`.
    ///
    /// On a miss, overlapping dirty surfaces are flushed and every
    /// overlapping surface is evicted before the new one is uploaded.
    pub fn get_surface<B, M>(&mut self, backend: &mut B, memory: &M, params: &SurfaceParams) -> Result<&CachedSurface>
    where
        B: GraphicsBackend + ?Sized,
        M: GuestMemory + ?Sized,
    {
        let hit = self.surfaces.get(&params.addr).is_some_and(|s| s.matches(params));
        if hit {
            self.stats.hits += 1;
            trace!("Surface hit at 0x{:08x}", params.addr);
            if let TilingFormat::PendingClear(value) = params.tiling {
                let texture = self.surfaces[&params.addr].texture;
                Self::fill(backend, texture, params, value)?;
                self.mark_dirty(params.addr);
            }
            return Ok(&self.surfaces[&params.addr]);
        }

        self.stats.misses += 1;
        let size = params.size()?;
        debug!(
            "Surface miss at 0x{:08x}: {}x{} {:?} {:?}",
            params.addr, params.width, params.height, params.tiling, params.format
        );

        self.flush_in_range(backend, memory, params.addr, size)?;
        self.invalidate_in_range(backend, memory, params.addr, size, true);
        if let Some(stale) = self.surfaces.remove(&params.addr) {
            self.release(backend, stale);
        }

        memory.check_gpu_access(params.addr, size as usize)?;
        let guest = memory.read_vec(params.addr, size as usize)?;
        let texture = backend.create_texture()?;
        let mut surface = CachedSurface {
            addr: params.addr,
            size,
            hash: xxh3_64(&guest),
            texture,
            width: params.width,
            height: params.height,
            tiling: params.tiling.resolved(),
            format: params.format,
            dirty: false,
        };

        let uploaded = match params.tiling {
            TilingFormat::PendingClear(value) => {
                surface.dirty = true;
                Self::fill(backend, texture, params, value)
            }
            _ => Self::upload(backend, &surface, &guest),
        };
        if let Err(e) = uploaded {
            backend.delete_texture(texture);
            return Err(e);
        }
        self.stats.uploads += 1;

        match self.surfaces.entry(params.addr) {
            Entry::Vacant(slot) => Ok(slot.insert(surface)),
            Entry::Occupied(_) => panic!("duplicate cached surface at 0x{:08x}", params.addr),
        }
    }

    /// Find the first cached surface (by address) containing `params.addr`
    /// and return the tile-aligned rectangle the request occupies in it.
    ///
    /// The search stops at that surface. If its layout or format differs,
    /// this falls back to [`get_surface`](Self::get_surface), covering the
    /// whole new surface.
    pub fn get_surface_rect<B, M>(
        &mut self,
        backend: &mut B,
        memory: &M,
        params: &SurfaceParams,
    ) -> Result<(&CachedSurface, SurfaceRect)>
    where
        B: GraphicsBackend + ?Sized,
        M: GuestMemory + ?Sized,
    {
        let candidate = if params.tiling == TilingFormat::Block8x8 {
            self.surfaces
                .values()
                .find(|info| params.addr >= info.addr && (params.addr as u64) < info.end())
        } else {
            None
        };

        let found = candidate.and_then(|info| {
            if info.tiling != params.tiling || info.format != params.format {
                return None;
            }

            let bytes_per_tile = 8 * 8 * info.format.bits_per_pixel() / 8;
            let tiles_per_row = tiling::align_to_tile(info.width) / 8;
            if bytes_per_tile == 0 || tiles_per_row == 0 {
                return None;
            }

            let begin_tile = (params.addr - info.addr) / bytes_per_tile;
            let left = begin_tile % tiles_per_row * 8;
            let top = begin_tile / tiles_per_row * 8;
            Some((
                info.addr,
                SurfaceRect {
                    left,
                    top,
                    right: left + params.width,
                    bottom: top + params.height,
                },
            ))
        });

        if let Some((key, rect)) = found {
            self.stats.hits += 1;
            trace!("Reusing surface at 0x{:08x} for 0x{:08x} at {:?}", key, params.addr, rect);
            return Ok((&self.surfaces[&key], rect));
        }

        let rect = SurfaceRect {
            left: 0,
            top: 0,
            right: params.width,
            bottom: params.height,
        };
        Ok((self.get_surface(backend, memory, params)?, rect))
    }

    /// Look up the texture of a texture unit and bind it in `state`.
    ///
    /// A zero address unbinds the unit without touching the cache.
    pub fn load_and_bind_texture<B, M>(
        &mut self,
        backend: &mut B,
        memory: &M,
        state: &mut PipelineState,
        unit: usize,
        config: &FullTextureConfig,
    ) -> Result<Option<TextureHandle>>
    where
        B: GraphicsBackend + ?Sized,
        M: GuestMemory + ?Sized,
    {
        if config.config.address == 0 {
            state.texture_units[unit].texture = None;
            return Ok(None);
        }

        let format = config
            .format
            .ok_or_else(|| VideoError::UnsupportedFormat(format!("texture format {}", config.raw_format)))?;
        let params = SurfaceParams {
            addr: config.config.address,
            width: config.config.width,
            height: config.config.height,
            tiling: TilingFormat::Block8x8,
            format: SurfaceFormat::from_texture_format(format),
        };

        let texture = self.get_surface(backend, memory, &params)?.texture;
        state.texture_units[unit].texture = Some(texture);
        Ok(Some(texture))
    }

    /// Look up the color and depth buffers and attach them in `state`.
    ///
    /// Buffers at address zero or with an unknown format are left detached.
    pub fn load_and_bind_framebuffer<B, M>(
        &mut self,
        backend: &mut B,
        memory: &M,
        state: &mut PipelineState,
        config: &FramebufferConfig,
    ) -> Result<BoundFramebuffer>
    where
        B: GraphicsBackend + ?Sized,
        M: GuestMemory + ?Sized,
    {
        let mut bound = BoundFramebuffer::default();
        let mut attachments = FramebufferAttachments::default();

        let params = |addr, format| SurfaceParams {
            addr,
            width: config.width,
            height: config.height,
            tiling: TilingFormat::Block8x8,
            format,
        };

        if config.color_address != 0 {
            match config.color_format {
                Some(format) => {
                    let params = params(config.color_address, SurfaceFormat::from_color_format(format));
                    attachments.color = Some(self.get_surface(backend, memory, &params)?.texture);
                    bound.color = Some(config.color_address);
                }
                None => warn!("Color buffer at 0x{:08x} has unknown format", config.color_address),
            }
        }

        if config.depth_address != 0 {
            match config.depth_format {
                Some(format) => {
                    let format = SurfaceFormat::from_depth_format(format);
                    let texture = self.get_surface(backend, memory, &params(config.depth_address, format))?.texture;
                    attachments.depth = Some(texture);
                    if format.has_stencil() {
                        attachments.stencil = Some(texture);
                    }
                    bound.depth = Some(config.depth_address);
                }
                None => warn!("Depth buffer at 0x{:08x} has unknown format", config.depth_address),
            }
        }

        // The color lookup may have been evicted by the depth lookup when the two overlap
        if let Some(addr) = bound.color {
            if self.surfaces.get(&addr).map(|s| s.texture) != attachments.color {
                warn!("Color and depth buffers overlap at 0x{:08x}", addr);
                attachments.color = None;
                bound.color = None;
            }
        }

        state.framebuffer = attachments;
        Ok(bound)
    }

    fn upload<B: GraphicsBackend + ?Sized>(backend: &mut B, surface: &CachedSurface, guest: &[u8]) -> Result<()> {
        let (width, height) = (surface.width, surface.height);
        let format = surface.format;

        if format.is_depth() {
            let bytes_per_pixel = format.bits_per_pixel() / 8;
            let pixels = match surface.tiling {
                TilingFormat::Linear => guest.to_vec(),
                _ => tiling::untile(guest, width, height, bytes_per_pixel),
            };
            let data = depth_guest_to_host(format, &pixels);
            backend.upload_texture(surface.texture, width, height, &format.host_format()?, &data)?;
            return Ok(());
        }

        match surface.tiling {
            TilingFormat::Linear => {
                backend.upload_texture(surface.texture, width, height, &format.host_format()?, guest)?;
            }
            _ => {
                let texture_format = format
                    .texture_format()
                    .ok_or_else(|| VideoError::UnsupportedFormat(format!("{:?}", format)))?;
                let decoded = decode_texture(
                    guest,
                    &TextureInfo {
                        width,
                        height,
                        format: texture_format,
                    },
                );
                let host = HostFormat {
                    internal: internal_format(format),
                    ..RGBA8_BYTES
                };
                backend.upload_texture(surface.texture, width, height, &host, &decoded)?;
            }
        }
        Ok(())
    }

    fn fill<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        texture: TextureHandle,
        params: &SurfaceParams,
        value: u32,
    ) -> Result<()> {
        let count = (params.width * params.height) as usize;
        let internal = internal_format(params.format);

        let (host, pixel) = if params.format.is_depth() {
            (
                HostFormat::new(internal, PixelLayout::DepthStencil, ComponentType::UnsignedInt248),
                tiling::d24s8_guest_to_host(value).to_le_bytes(),
            )
        } else {
            (HostFormat { internal, ..RGBA8_BYTES }, value.to_le_bytes())
        };

        let data = pixel.repeat(count);
        backend.upload_texture(texture, params.width, params.height, &host, &data)?;
        Ok(())
    }

    /// Write a dirty surface back to guest memory.
    ///
    /// Formats without a host equivalent fail with
    /// [`VideoError::UnsupportedFormat`] and leave guest memory untouched.
    pub fn flush_surface<B, M>(&mut self, backend: &mut B, memory: &M, addr: u32) -> Result<()>
    where
        B: GraphicsBackend + ?Sized,
        M: GuestMemory + ?Sized,
    {
        let Some(surface) = self.surfaces.get(&addr).filter(|s| s.dirty).cloned() else {
            return Ok(());
        };
        trace!("Flushing surface at 0x{:08x}", addr);

        let format = surface.format;
        let host = format.host_format()?;
        let bytes_per_pixel = format.bits_per_pixel() / 8;

        let pixels = backend.download_texture(surface.texture, &host)?;
        let pixels = if format.is_depth() {
            depth_host_to_guest(format, &pixels)
        } else {
            pixels
        };

        let guest = match surface.tiling {
            TilingFormat::Linear => pixels,
            _ => {
                let mut guest = memory.read_vec(addr, surface.size as usize)?;
                tiling::tile(&pixels, &mut guest, surface.width, surface.height, bytes_per_pixel);
                guest
            }
        };
        memory.write_physical(addr, &guest)?;

        if let Some(surface) = self.surfaces.get_mut(&addr) {
            surface.dirty = false;
            surface.hash = xxh3_64(&guest);
        }
        self.stats.flushes += 1;
        Ok(())
    }

    /// Flush every dirty surface intersecting `[addr, addr + size)`.
    ///
    /// Surfaces with an unsupported format are skipped with a warning.
    pub fn flush_in_range<B, M>(&mut self, backend: &mut B, memory: &M, addr: u32, size: u32) -> Result<()>
    where
        B: GraphicsBackend + ?Sized,
        M: GuestMemory + ?Sized,
    {
        for key in self.intersecting(addr, size) {
            self.flush_checked(backend, memory, key)?;
        }
        Ok(())
    }

    pub fn flush_all<B, M>(&mut self, backend: &mut B, memory: &M) -> Result<()>
    where
        B: GraphicsBackend + ?Sized,
        M: GuestMemory + ?Sized,
    {
        let keys: Vec<u32> = self.surfaces.keys().copied().collect();
        for key in keys {
            self.flush_checked(backend, memory, key)?;
        }
        Ok(())
    }

    fn flush_checked<B, M>(&mut self, backend: &mut B, memory: &M, key: u32) -> Result<()>
    where
        B: GraphicsBackend + ?Sized,
        M: GuestMemory + ?Sized,
    {
        match self.flush_surface(backend, memory, key) {
            Err(EmulatorError::Video(VideoError::UnsupportedFormat(format))) => {
                warn!("Cannot flush surface at 0x{:08x}: unsupported format {}", key, format);
                Ok(())
            }
            other => other,
        }
    }

    /// Evict every surface intersecting `[addr, addr + size)` that is dirty,
    /// or whose guest bytes no longer hash to the recorded value. With
    /// `ignore_hash` every intersecting surface is evicted.
    pub fn invalidate_in_range<B, M>(&mut self, backend: &mut B, memory: &M, addr: u32, size: u32, ignore_hash: bool)
    where
        B: GraphicsBackend + ?Sized,
        M: GuestMemory + ?Sized,
    {
        let doomed: Vec<u32> = self
            .intersecting(addr, size)
            .into_iter()
            .filter(|key| {
                let surface = &self.surfaces[key];
                surface.dirty
                    || ignore_hash
                    || memory
                        .read_vec(surface.addr, surface.size as usize)
                        .map_or(true, |bytes| xxh3_64(&bytes) != surface.hash)
            })
            .collect();

        for key in doomed {
            if let Some(surface) = self.surfaces.remove(&key) {
                self.release(backend, surface);
            }
        }
    }

    /// Evict one surface without flushing it
    pub fn invalidate_surface<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B, addr: u32) {
        if let Some(surface) = self.surfaces.remove(&addr) {
            self.release(backend, surface);
        }
    }

    /// Evict every surface without flushing
    pub fn invalidate_all<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) {
        let surfaces = std::mem::take(&mut self.surfaces);
        for surface in surfaces.into_values() {
            self.release(backend, surface);
        }
    }
}
