//! Rasterizer bridge - message channel from the guest GPU emulation to the
//! rasterizer thread
//!
//! The sender side is cheap to clone and may be used from any thread. The
//! receiver side is owned by the thread that drives the [`Rasterizer`].
//!
//! [`Rasterizer`]: crate::rasterizer::Rasterizer

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::vertex::OutputVertex;

/// Initial capacity of the message queue
pub const BRIDGE_QUEUE_CAPACITY: usize = 4096;

/// Work for the rasterizer thread
#[derive(Debug, Clone)]
pub enum RasterizerMessage {
    /// A PICA register was written
    RegisterWrite { id: u32, value: u32 },
    /// Append a triangle to the current batch
    Triangle(Box<[OutputVertex; 3]>),
    /// Draw the current batch
    DrawBatch,
    /// The guest is about to read `[addr, addr + size)`
    PreRead { addr: u32, size: u32 },
    /// The guest wrote `[addr, addr + size)`
    Flush { addr: u32, size: u32 },
    /// Write every dirty surface back to guest memory
    FlushAll,
    /// Resync all host state from the register file
    Reset,
    /// Completion marker, see [`BridgeSender::sync`]
    Sync(u64),
    /// Stop the rasterizer thread
    Shutdown,
}

/// State shared by both bridge ends
struct Shared {
    queue: Mutex<VecDeque<RasterizerMessage>>,
    /// Signalled when a message is queued
    queue_condvar: Condvar,
    connected: AtomicBool,
    /// Last issued sync token
    sync_issued: AtomicU64,
    /// Last sync token the receiver reached
    sync_completed: Mutex<u64>,
    sync_condvar: Condvar,
}

/// The sender side of the bridge
#[derive(Clone)]
pub struct BridgeSender {
    shared: Arc<Shared>,
}

impl BridgeSender {
    fn push(&self, message: RasterizerMessage) -> bool {
        if !self.shared.connected.load(Ordering::Acquire) {
            return false;
        }

        let mut queue = self.shared.queue.lock();
        queue.push_back(message);
        self.shared.queue_condvar.notify_one();
        true
    }

    /// Queue a message. Returns false when no receiver is connected.
    pub fn send(&self, message: RasterizerMessage) -> bool {
        self.push(message)
    }

    pub fn write_register(&self, id: u32, value: u32) -> bool {
        self.push(RasterizerMessage::RegisterWrite { id, value })
    }

    pub fn add_triangle(&self, v0: OutputVertex, v1: OutputVertex, v2: OutputVertex) -> bool {
        self.push(RasterizerMessage::Triangle(Box::new([v0, v1, v2])))
    }

    pub fn draw_batch(&self) -> bool {
        self.push(RasterizerMessage::DrawBatch)
    }

    /// Queue a flush-before-read and wait until guest memory holds the result
    pub fn pre_read(&self, addr: u32, size: u32) -> bool {
        self.push(RasterizerMessage::PreRead { addr, size }) && self.sync()
    }

    pub fn flush(&self, addr: u32, size: u32) -> bool {
        self.push(RasterizerMessage::Flush { addr, size })
    }

    pub fn flush_all(&self) -> bool {
        self.push(RasterizerMessage::FlushAll)
    }

    pub fn reset(&self) -> bool {
        self.push(RasterizerMessage::Reset)
    }

    /// Block until every message queued before this call has executed
    pub fn sync(&self) -> bool {
        let token = self.shared.sync_issued.fetch_add(1, Ordering::AcqRel) + 1;
        if !self.push(RasterizerMessage::Sync(token)) {
            return false;
        }

        let mut completed = self.shared.sync_completed.lock();
        while *completed < token {
            if !self.shared.connected.load(Ordering::Acquire) {
                return false;
            }
            self.shared.sync_condvar.wait(&mut completed);
        }
        true
    }

    /// Check if a receiver is connected
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Messages waiting to be processed
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

/// The receiver side of the bridge
pub struct BridgeReceiver {
    shared: Arc<Shared>,
}

impl BridgeReceiver {
    /// Try to receive a message (non-blocking)
    pub fn try_recv(&self) -> Option<RasterizerMessage> {
        self.shared.queue.lock().pop_front()
    }

    /// Wait for the next message. Returns `None` once disconnected and drained.
    pub fn recv(&self) -> Option<RasterizerMessage> {
        let mut queue = self.shared.queue.lock();
        loop {
            if let Some(message) = queue.pop_front() {
                return Some(message);
            }
            if !self.shared.connected.load(Ordering::Acquire) {
                return None;
            }
            self.shared.queue_condvar.wait(&mut queue);
        }
    }

    /// Drain all pending messages
    pub fn drain(&self) -> Vec<RasterizerMessage> {
        self.shared.queue.lock().drain(..).collect()
    }

    /// Signal that the sync marker `token` was reached
    pub fn signal_sync(&self, token: u64) {
        let mut completed = self.shared.sync_completed.lock();
        *completed = (*completed).max(token);
        self.shared.sync_condvar.notify_all();
    }

    /// Mark the bridge as connected
    pub fn connect(&self) {
        self.shared.connected.store(true, Ordering::Release);
        tracing::info!("Rasterizer bridge connected");
    }

    /// Mark the bridge as disconnected and wake every waiter
    pub fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::Release);
        {
            let _queue = self.shared.queue.lock();
            self.shared.queue_condvar.notify_all();
        }
        let _completed = self.shared.sync_completed.lock();
        self.shared.sync_condvar.notify_all();
        tracing::info!("Rasterizer bridge disconnected");
    }
}

/// Create a new bridge pair (sender, receiver)
pub fn create_bridge() -> (BridgeSender, BridgeReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(BRIDGE_QUEUE_CAPACITY)),
        queue_condvar: Condvar::new(),
        connected: AtomicBool::new(false),
        sync_issued: AtomicU64::new(0),
        sync_completed: Mutex::new(0),
        sync_condvar: Condvar::new(),
    });

    (
        BridgeSender {
            shared: Arc::clone(&shared),
        },
        BridgeReceiver { shared },
    )
}
