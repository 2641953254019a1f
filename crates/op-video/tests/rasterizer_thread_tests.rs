//! End-to-end tests driving the rasterizer thread over its bridge

use std::sync::Arc;

use op_core::config::GpuConfig;
use op_memory::{GuestMemory, MemoryManager, VRAM_BASE};
use op_video::backend::null::NullBackend;
use op_video::pica::{f32_to_float24, index};
use op_video::thread::BackendFactory;
use op_video::{GraphicsBackend, OutputVertex, RasterizerThread};

const COLOR_ADDR: u32 = VRAM_BASE;
const DEPTH_ADDR: u32 = VRAM_BASE + 0x4_0000;
const WIDTH: u32 = 64;
const HEIGHT: u32 = 32;
const COLOR_SIZE: u32 = WIDTH * HEIGHT * 4;

fn null_factory() -> BackendFactory {
    Box::new(|| Box::new(NullBackend::new()) as Box<dyn GraphicsBackend>)
}

fn vertex(x: f32, y: f32) -> OutputVertex {
    OutputVertex {
        pos: [x, y, 0.5, 1.0],
        color: [1.0, 0.5, 0.25, 1.0],
        ..Default::default()
    }
}

fn fill_pattern(mem: &MemoryManager, addr: u32, len: u32, seed: u8) -> Vec<u8> {
    let data: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect();
    mem.write_physical(addr, &data).unwrap();
    data
}

fn setup(thread: &RasterizerThread) {
    let sender = thread.sender();
    sender.write_register(index::COLOR_BUFFER_ADDRESS, COLOR_ADDR / 8);
    sender.write_register(index::DEPTH_BUFFER_ADDRESS, DEPTH_ADDR / 8);
    sender.write_register(index::FRAMEBUFFER_DIMENSIONS, WIDTH | ((HEIGHT - 1) << 12));
    sender.write_register(index::COLOR_FORMAT, 0);
    sender.write_register(index::DEPTH_FORMAT, 3);
    sender.write_register(index::VIEWPORT_SIZE_X, f32_to_float24(WIDTH as f32 / 2.0));
    sender.write_register(index::VIEWPORT_SIZE_Y, f32_to_float24(HEIGHT as f32 / 2.0));
}

#[test]
fn test_draw_and_read_back() {
    let mem = MemoryManager::new();
    let original = fill_pattern(&mem, COLOR_ADDR, COLOR_SIZE, 3);

    let thread = RasterizerThread::spawn(null_factory(), mem.clone(), GpuConfig::default(), None).unwrap();
    setup(&thread);
    let sender = thread.sender();

    assert!(sender.add_triangle(vertex(-1.0, -1.0), vertex(1.0, -1.0), vertex(0.0, 1.0)));
    assert!(sender.draw_batch());
    // The null backend keeps the uploaded pixels, so a write-back reproduces them
    assert!(sender.pre_read(COLOR_ADDR, COLOR_SIZE));
    assert_eq!(mem.read_vec(COLOR_ADDR, COLOR_SIZE as usize).unwrap(), original);

    let stats = thread.join();
    assert_eq!(stats.triangles, 1);
    assert_eq!(stats.draws, 1);
}

#[test]
fn test_guest_write_then_draw() {
    let mem = MemoryManager::new();
    fill_pattern(&mem, COLOR_ADDR, COLOR_SIZE, 0);

    let thread = RasterizerThread::spawn(null_factory(), mem.clone(), GpuConfig::default(), None).unwrap();
    setup(&thread);
    let sender = thread.sender();

    sender.add_triangle(vertex(-1.0, -1.0), vertex(1.0, -1.0), vertex(0.0, 1.0));
    sender.draw_batch();
    sender.flush_all();
    assert!(sender.sync());

    // The guest overwrites the color buffer; the stale host copy must go
    let updated = fill_pattern(&mem, COLOR_ADDR, COLOR_SIZE, 0x80);
    sender.flush(COLOR_ADDR, COLOR_SIZE);
    sender.add_triangle(vertex(-1.0, -1.0), vertex(1.0, -1.0), vertex(0.0, 1.0));
    sender.draw_batch();
    assert!(sender.pre_read(COLOR_ADDR, COLOR_SIZE));
    assert_eq!(mem.read_vec(COLOR_ADDR, COLOR_SIZE as usize).unwrap(), updated);

    assert_eq!(thread.join().draws, 2);
}

#[test]
fn test_disabled_renderer_leaves_memory_alone() {
    let mem = MemoryManager::new();
    let original = fill_pattern(&mem, COLOR_ADDR, COLOR_SIZE, 9);
    let config = GpuConfig {
        use_hw_renderer: false,
        ..GpuConfig::default()
    };

    let thread = RasterizerThread::spawn(null_factory(), mem.clone(), config, None).unwrap();
    setup(&thread);
    let sender = thread.sender();
    sender.add_triangle(vertex(-1.0, -1.0), vertex(1.0, -1.0), vertex(0.0, 1.0));
    sender.draw_batch();
    sender.reset();
    sender.flush_all();
    assert!(sender.sync());
    assert_eq!(mem.read_vec(COLOR_ADDR, COLOR_SIZE as usize).unwrap(), original);
}

#[test]
fn test_many_senders() {
    let mem: Arc<MemoryManager> = MemoryManager::new();
    let thread = RasterizerThread::spawn(null_factory(), mem, GpuConfig::default(), None).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let sender = thread.sender();
            std::thread::spawn(move || {
                for i in 0..100 {
                    sender.write_register(index::BLEND_CONST, i);
                }
                sender.sync()
            })
        })
        .collect();
    for worker in workers {
        assert!(worker.join().unwrap());
    }

    assert_eq!(thread.join().register_writes, 400);
}
