//! Benchmarks for the tiling codec and surface uploads

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use op_memory::{GuestMemory, MemoryManager, VRAM_BASE};
use op_video::backend::null::NullBackend;
use op_video::format::SurfaceFormat;
use op_video::pica::TextureFormat;
use op_video::surface_cache::{SurfaceParams, TilingFormat};
use op_video::texel::{decode_texture, TextureInfo};
use op_video::tiling;
use op_video::SurfaceCache;

const SIZES: [(u32, u32); 3] = [(64, 64), (256, 256), (400, 240)];

fn bench_untile(c: &mut Criterion) {
    let mut group = c.benchmark_group("untile");

    for (width, height) in SIZES {
        for bytes_per_pixel in [2u32, 4] {
            let size = tiling::tiled_size(width, height, bytes_per_pixel * 8).unwrap() as usize;
            let guest: Vec<u8> = (0..size).map(|i| i as u8).collect();
            group.throughput(Throughput::Bytes(size as u64));

            let id = BenchmarkId::new(format!("{}bpp", bytes_per_pixel * 8), format!("{}x{}", width, height));
            group.bench_with_input(id, &guest, |b, guest| {
                b.iter(|| tiling::untile(black_box(guest), width, height, bytes_per_pixel));
            });
        }
    }

    group.finish();
}

fn bench_tile(c: &mut Criterion) {
    let mut group = c.benchmark_group("tile");

    for (width, height) in SIZES {
        let host: Vec<u8> = (0..width * height * 4).map(|i| i as u8).collect();
        let mut guest = vec![0u8; tiling::tiled_size(width, height, 32).unwrap() as usize];
        group.throughput(Throughput::Bytes(host.len() as u64));

        group.bench_function(BenchmarkId::from_parameter(format!("{}x{}", width, height)), |b| {
            b.iter(|| tiling::tile(black_box(&host), &mut guest, width, height, 4));
        });
    }

    group.finish();
}

fn bench_decode_texture(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_texture");

    for format in [TextureFormat::Rgba8, TextureFormat::Rgb565, TextureFormat::Etc1, TextureFormat::Etc1a4] {
        let info = TextureInfo {
            width: 256,
            height: 256,
            format,
        };
        let size = tiling::tiled_size(info.width, info.height, info.bits_per_pixel()).unwrap() as usize;
        let data: Vec<u8> = (0..size).map(|i| (i * 13) as u8).collect();
        group.throughput(Throughput::Elements((info.width * info.height) as u64));

        group.bench_with_input(BenchmarkId::from_parameter(format!("{:?}", format)), &data, |b, data| {
            b.iter(|| decode_texture(black_box(data), &info));
        });
    }

    group.finish();
}

fn bench_surface_upload(c: &mut Criterion) {
    let mut group = c.benchmark_group("surface_upload");
    let mem = MemoryManager::new();

    for format in [SurfaceFormat::Rgba8, SurfaceFormat::Rgb565, SurfaceFormat::D24S8] {
        let params = SurfaceParams {
            addr: VRAM_BASE,
            width: 256,
            height: 256,
            tiling: TilingFormat::Block8x8,
            format,
        };
        let size = params.size().unwrap();
        let data: Vec<u8> = (0..size).map(|i| (i * 7) as u8).collect();
        mem.write_physical(VRAM_BASE, &data).unwrap();
        group.throughput(Throughput::Bytes(size as u64));

        // Every iteration misses: the surface is evicted before the next lookup
        group.bench_function(BenchmarkId::from_parameter(format!("{:?}", format)), |b| {
            let mut backend = NullBackend::new();
            let mut cache = SurfaceCache::new();
            b.iter(|| {
                cache.get_surface(&mut backend, &*mem, &params).unwrap();
                cache.invalidate_all(&mut backend);
                cache.take_released();
                backend.clear_calls();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_untile,
    bench_tile,
    bench_decode_texture,
    bench_surface_upload
);
criterion_main!(benches);
