//! PICA200 hardware rasterizer for oxidized-pica
//!
//! Turns guest GPU register state and transformed vertices into host draw
//! calls, caching guest surfaces as host textures and guest pipeline
//! configurations as host shader programs.

pub mod backend;
pub mod bridge;
pub mod color;
pub mod format;
pub mod pica;
pub mod rasterizer;
pub mod shader;
pub mod state;
pub mod surface_cache;
pub mod texel;
pub mod thread;
pub mod tiling;
pub mod vertex;

pub use backend::GraphicsBackend;
pub use bridge::{create_bridge, BridgeReceiver, BridgeSender, RasterizerMessage};
pub use pica::Regs;
pub use rasterizer::Rasterizer;
pub use surface_cache::SurfaceCache;
pub use thread::RasterizerThread;
pub use vertex::OutputVertex;
