//! Rasterizer thread
//!
//! Owns the register file and the [`Rasterizer`] and executes bridge
//! messages in order. Host graphics objects are created and used on this
//! thread only.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use op_core::config::GpuConfig;
use op_core::error::{EmulatorError, VideoError};
use op_memory::GuestMemory;

use crate::backend::GraphicsBackend;
use crate::bridge::{create_bridge, BridgeReceiver, BridgeSender, RasterizerMessage};
use crate::pica::Regs;
use crate::rasterizer::Rasterizer;
use crate::shader::ShaderCache;

/// Builds the backend on the rasterizer thread
pub type BackendFactory = Box<dyn FnOnce() -> Box<dyn GraphicsBackend> + Send>;

/// Counters reported when the thread exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    pub messages: u64,
    pub register_writes: u64,
    pub triangles: u64,
    pub draws: u64,
}

/// Message loop state living on the rasterizer thread
pub struct RasterizerWorker {
    regs: Regs,
    rasterizer: Rasterizer<dyn GraphicsBackend>,
    stats: ThreadStats,
}

impl RasterizerWorker {
    pub fn new(rasterizer: Rasterizer<dyn GraphicsBackend>) -> Self {
        Self {
            regs: Regs::new(),
            rasterizer,
            stats: ThreadStats::default(),
        }
    }

    pub fn init(&mut self) -> Result<(), EmulatorError> {
        self.rasterizer.init(&self.regs)
    }

    pub fn regs(&self) -> &Regs {
        &self.regs
    }

    pub fn rasterizer(&self) -> &Rasterizer<dyn GraphicsBackend> {
        &self.rasterizer
    }

    pub fn stats(&self) -> ThreadStats {
        self.stats
    }

    /// Execute one message. Returns false on shutdown.
    pub fn handle(&mut self, message: RasterizerMessage, receiver: &BridgeReceiver) -> bool {
        self.stats.messages += 1;
        match message {
            RasterizerMessage::RegisterWrite { id, value } => {
                self.stats.register_writes += 1;
                if self.regs.set(id, value) {
                    self.rasterizer.notify_register_changed(&self.regs, id);
                }
            }
            RasterizerMessage::Triangle(vertices) => {
                self.stats.triangles += 1;
                let [v0, v1, v2] = &*vertices;
                self.rasterizer.add_triangle(v0, v1, v2);
            }
            RasterizerMessage::DrawBatch => {
                self.stats.draws += 1;
                self.rasterizer.draw_triangles(&self.regs);
            }
            RasterizerMessage::PreRead { addr, size } => self.rasterizer.notify_pre_read(addr, size),
            RasterizerMessage::Flush { addr, size } => self.rasterizer.notify_flush(addr, size),
            RasterizerMessage::FlushAll => self.rasterizer.flush_all_surfaces(),
            RasterizerMessage::Reset => self.rasterizer.reset(&self.regs),
            RasterizerMessage::Sync(token) => receiver.signal_sync(token),
            RasterizerMessage::Shutdown => return false,
        }
        true
    }

    /// Process messages until shutdown or disconnect
    pub fn run(&mut self, receiver: &BridgeReceiver) {
        while let Some(message) = receiver.recv() {
            if !self.handle(message, receiver) {
                break;
            }
        }
        // Late sync markers would otherwise block their senders forever
        for message in receiver.drain() {
            if let RasterizerMessage::Sync(token) = message {
                receiver.signal_sync(token);
            }
        }
    }
}

/// Handle to a running rasterizer thread
pub struct RasterizerThread {
    sender: BridgeSender,
    handle: Option<JoinHandle<ThreadStats>>,
}

impl RasterizerThread {
    /// Start the thread, build the backend with `factory` and initialize it.
    ///
    /// Returns once initialization finished; an initialization failure is
    /// returned here and the thread exits.
    pub fn spawn(
        factory: BackendFactory,
        memory: Arc<dyn GuestMemory>,
        config: GpuConfig,
        shader_dump_dir: Option<PathBuf>,
    ) -> Result<Self, EmulatorError> {
        let (sender, receiver) = create_bridge();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), EmulatorError>>(1);

        let handle = thread::Builder::new()
            .name("rasterizer".into())
            .spawn(move || {
                let shaders = match shader_dump_dir {
                    Some(dir) => ShaderCache::with_dump_dir(dir),
                    None => ShaderCache::new(),
                };
                let rasterizer = Rasterizer::new(factory(), memory, &config).with_shader_cache(shaders);
                let mut worker = RasterizerWorker::new(rasterizer);

                if let Err(e) = worker.init() {
                    let _ = ready_tx.send(Err(e));
                    return ThreadStats::default();
                }
                receiver.connect();
                let _ = ready_tx.send(Ok(()));

                tracing::info!("Rasterizer thread running");
                worker.run(&receiver);
                receiver.disconnect();

                let stats = worker.stats();
                tracing::info!(
                    "Rasterizer thread stopped: {} messages, {} triangles, {} draws",
                    stats.messages,
                    stats.triangles,
                    stats.draws
                );
                stats
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                sender,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(VideoError::Backend("rasterizer thread exited during startup".into()).into())
            }
        }
    }

    /// A new sender for this thread's bridge
    pub fn sender(&self) -> BridgeSender {
        self.sender.clone()
    }

    /// Stop the thread after it has processed everything already queued
    pub fn join(mut self) -> ThreadStats {
        self.stop()
    }

    fn stop(&mut self) -> ThreadStats {
        let Some(handle) = self.handle.take() else {
            return ThreadStats::default();
        };
        self.sender.send(RasterizerMessage::Shutdown);
        match handle.join() {
            Ok(stats) => stats,
            Err(_) => {
                tracing::error!("Rasterizer thread panicked");
                ThreadStats::default()
            }
        }
    }
}

impl Drop for RasterizerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::NullBackend;
    use crate::pica::index;
    use op_memory::MemoryManager;

    fn null_factory() -> BackendFactory {
        Box::new(|| Box::new(NullBackend::new()) as Box<dyn GraphicsBackend>)
    }

    #[test]
    fn test_spawn_and_join() {
        let memory = MemoryManager::new();
        let thread = RasterizerThread::spawn(null_factory(), memory, GpuConfig::default(), None).unwrap();
        let sender = thread.sender();
        assert!(sender.is_connected());

        assert!(sender.write_register(index::CULL_MODE, 1));
        assert!(sender.sync());

        let stats = thread.join();
        assert_eq!(stats.register_writes, 1);
        assert!(!sender.is_connected());
        assert!(!sender.sync());
    }

    #[test]
    fn test_worker_applies_register_writes() {
        let memory = MemoryManager::new();
        let rasterizer: Rasterizer<dyn GraphicsBackend> =
            Rasterizer::new(Box::new(NullBackend::new()), memory, &GpuConfig::default());
        let mut worker = RasterizerWorker::new(rasterizer);
        worker.init().unwrap();

        let (_sender, receiver) = create_bridge();
        assert!(worker.handle(RasterizerMessage::RegisterWrite { id: index::CULL_MODE, value: 1 }, &receiver));
        assert_eq!(worker.regs().get(index::CULL_MODE), 1);
        assert!(worker.rasterizer().pipeline_state().cull.enabled);

        assert!(worker.handle(RasterizerMessage::RegisterWrite { id: 0x1000, value: 1 }, &receiver));
        assert!(!worker.handle(RasterizerMessage::Shutdown, &receiver));
        assert_eq!(worker.stats().register_writes, 2);
    }

    #[test]
    fn test_init_failure_reported() {
        let memory = MemoryManager::new();
        let factory: BackendFactory = Box::new(|| {
            let mut backend = NullBackend::new();
            backend.fail_init(true);
            Box::new(backend) as Box<dyn GraphicsBackend>
        });
        assert!(RasterizerThread::spawn(factory, memory, GpuConfig::default(), None).is_err());
    }
}
