//! Oxidized-Pica - headless PICA200 trace player
//!
//! Replays a JSON GPU command trace through the hardware rasterizer and
//! writes back every rendered surface to guest memory at the end.

mod trace;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use op_core::config::{Config, GpuBackend};
use op_core::init_logging;
use op_memory::MemoryManager;
use op_video::backend::null::NullBackend;
use op_video::backend::vulkan::VulkanBackend;
use op_video::thread::BackendFactory;
use op_video::{GraphicsBackend, RasterizerThread};

use crate::trace::Replay;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Null,
    Vulkan,
}

/// Oxidized-Pica - PICA200 hardware rasterizer trace player
#[derive(Parser, Debug)]
#[command(name = "oxidized-pica", version, about)]
struct Args {
    /// Path to the GPU command trace (JSON)
    trace: PathBuf,

    /// Path to config file (default: user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured graphics backend
    #[arg(short, long, value_enum)]
    backend: Option<BackendArg>,

    /// Write the guest bytes of the final color buffer to this file
    #[arg(long)]
    dump_color: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> Config {
    let loaded = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    loaded.unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        Config::default()
    })
}

fn backend_factory(backend: GpuBackend, validation: bool) -> BackendFactory {
    match backend {
        GpuBackend::Vulkan => Box::new(move || Box::new(VulkanBackend::with_validation(validation)) as Box<dyn GraphicsBackend>),
        GpuBackend::Null => Box::new(|| Box::new(NullBackend::new()) as Box<dyn GraphicsBackend>),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_ref());
    if let Some(backend) = args.backend {
        config.gpu.backend = match backend {
            BackendArg::Null => GpuBackend::Null,
            BackendArg::Vulkan => GpuBackend::Vulkan,
        };
    }
    init_logging(&config.debug)?;

    tracing::info!("Starting Oxidized-Pica");
    tracing::info!("Graphics backend: {:?}", config.gpu.backend);

    let commands = trace::load(&args.trace)?;
    tracing::info!("Loaded {} trace commands from {}", commands.len(), args.trace.display());

    let memory = MemoryManager::new();
    let dump_dir = config.debug.dump_shaders.then(|| config.paths.shader_dump_dir.clone());

    let factory = backend_factory(config.gpu.backend, config.debug.validation);
    let thread = match RasterizerThread::spawn(factory, memory.clone(), config.gpu.clone(), dump_dir.clone()) {
        Ok(thread) => thread,
        Err(e) if config.gpu.backend == GpuBackend::Vulkan => {
            tracing::warn!("Vulkan backend unavailable ({}), falling back to the null backend", e);
            RasterizerThread::spawn(backend_factory(GpuBackend::Null, false), memory.clone(), config.gpu.clone(), dump_dir)
                .context("failed to start the rasterizer")?
        }
        Err(e) => return Err(e).context("failed to start the rasterizer"),
    };

    let mut replay = Replay::new(memory, thread.sender());
    replay.run(&commands)?;

    let sender = thread.sender();
    sender.flush_all();
    sender.sync();

    if let Some(path) = &args.dump_color {
        let bytes = replay.read_color_buffer()?;
        std::fs::write(path, &bytes).with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!("Wrote {} color buffer bytes to {}", bytes.len(), path.display());
    }

    let stats = thread.join();
    tracing::info!(
        "Replayed {} commands: {} triangles in {} draws",
        replay.executed(),
        stats.triangles,
        stats.draws
    );
    Ok(())
}
