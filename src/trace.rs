//! GPU command traces
//!
//! A trace is a JSON array of commands, each tagged by `op`:
//!
//! ```json
//! [
//!   { "op": "write_register", "id": 285, "value": 50331648 },
//!   { "op": "fill_memory", "addr": 402653184, "size": 16384, "value": 0 },
//!   { "op": "triangle", "vertices": [ { "pos": [-1, -1, 0.5, 1] }, { "pos": [1, -1, 0.5, 1] }, { "pos": [0, 1, 0.5, 1] } ] },
//!   { "op": "draw" },
//!   { "op": "read_memory", "addr": 402653184, "size": 16384, "output": "color.bin" }
//! ]
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use op_memory::{GuestMemory, MemoryManager};
use op_video::format::SurfaceFormat;
use op_video::{tiling, BridgeSender, OutputVertex, Regs};
use serde::Deserialize;

/// One vertex as produced by the vertex shader
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct TraceVertex {
    pub pos: [f32; 4],
    pub color: [f32; 4],
    pub tc0: [f32; 2],
    pub tc1: [f32; 2],
    pub tc2: [f32; 2],
}

impl From<TraceVertex> for OutputVertex {
    fn from(v: TraceVertex) -> Self {
        OutputVertex {
            pos: v.pos,
            color: v.color,
            tc0: v.tc0,
            tc1: v.tc1,
            tc2: v.tc2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TraceCommand {
    WriteRegister { id: u32, value: u32 },
    WriteMemory { addr: u32, data: Vec<u8> },
    FillMemory { addr: u32, size: u32, value: u8 },
    Triangle { vertices: [TraceVertex; 3] },
    Draw,
    PreRead { addr: u32, size: u32 },
    Flush { addr: u32, size: u32 },
    FlushAll,
    Reset,
    ReadMemory { addr: u32, size: u32, output: PathBuf },
}

/// Parse a trace from JSON text
pub fn parse(json: &str) -> Result<Vec<TraceCommand>> {
    serde_json::from_str(json).context("invalid trace")
}

/// Load a trace file
pub fn load(path: &Path) -> Result<Vec<TraceCommand>> {
    let json = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse(&json).with_context(|| format!("in {}", path.display()))
}

/// Plays trace commands into a rasterizer thread, acting as the guest CPU
pub struct Replay {
    memory: Arc<MemoryManager>,
    sender: BridgeSender,
    /// Guest view of the register file
    regs: Regs,
    executed: usize,
}

impl Replay {
    pub fn new(memory: Arc<MemoryManager>, sender: BridgeSender) -> Self {
        Self {
            memory,
            sender,
            regs: Regs::new(),
            executed: 0,
        }
    }

    /// Number of commands executed so far
    pub fn executed(&self) -> usize {
        self.executed
    }

    pub fn run(&mut self, commands: &[TraceCommand]) -> Result<()> {
        for (i, command) in commands.iter().enumerate() {
            self.execute(command).with_context(|| format!("trace command {} ({:?})", i, command))?;
        }
        Ok(())
    }

    fn send(&self, queued: bool) -> Result<()> {
        if !queued {
            bail!("rasterizer thread is not running");
        }
        Ok(())
    }

    pub fn execute(&mut self, command: &TraceCommand) -> Result<()> {
        tracing::trace!("{:?}", command);
        match command {
            TraceCommand::WriteRegister { id, value } => {
                self.regs.set(*id, *value);
                self.send(self.sender.write_register(*id, *value))?;
            }
            TraceCommand::WriteMemory { addr, data } => {
                self.write_memory(*addr, data.len() as u32, |mem| mem.write_physical(*addr, data))?;
            }
            TraceCommand::FillMemory { addr, size, value } => {
                self.write_memory(*addr, *size, |mem| mem.fill(*addr, *size as usize, *value))?;
            }
            TraceCommand::Triangle { vertices } => {
                let [v0, v1, v2] = (*vertices).map(OutputVertex::from);
                self.send(self.sender.add_triangle(v0, v1, v2))?;
            }
            TraceCommand::Draw => self.send(self.sender.draw_batch())?,
            TraceCommand::PreRead { addr, size } => self.send(self.sender.pre_read(*addr, *size))?,
            TraceCommand::Flush { addr, size } => self.send(self.sender.flush(*addr, *size))?,
            TraceCommand::FlushAll => self.send(self.sender.flush_all())?,
            TraceCommand::Reset => self.send(self.sender.reset())?,
            TraceCommand::ReadMemory { addr, size, output } => {
                let data = self.read_memory(*addr, *size)?;
                std::fs::write(output, data).with_context(|| format!("failed to write {}", output.display()))?;
            }
        }
        self.executed += 1;
        Ok(())
    }

    /// Guest CPU write: wait for the rasterizer to go idle, write, then report the write
    fn write_memory<F>(&self, addr: u32, size: u32, write: F) -> Result<()>
    where
        F: FnOnce(&MemoryManager) -> std::result::Result<(), op_core::MemoryError>,
    {
        self.send(self.sender.sync())?;
        write(&self.memory)?;
        self.send(self.sender.flush(addr, size))
    }

    /// Guest CPU read: flush rendered data in the range first
    pub fn read_memory(&self, addr: u32, size: u32) -> Result<Vec<u8>> {
        self.send(self.sender.pre_read(addr, size))?;
        Ok(self.memory.read_vec(addr, size as usize)?)
    }

    /// Guest bytes of the current color buffer, after writing back rendered data
    pub fn read_color_buffer(&self) -> Result<Vec<u8>> {
        let fb = self.regs.framebuffer();
        let Some(format) = fb.color_format else {
            bail!("color buffer format is not set");
        };
        if fb.color_address == 0 || fb.width == 0 {
            bail!("no color buffer configured");
        }
        let format = SurfaceFormat::from_color_format(format);
        let size = tiling::tiled_size(fb.width, fb.height, format.bits_per_pixel())
            .with_context(|| format!("color buffer {}x{} is too large", fb.width, fb.height))?;
        self.read_memory(fb.color_address, size)
    }
}
