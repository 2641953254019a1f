//! Core types for the oxidized-pica rasterizer
//!
//! This crate provides the error taxonomy, configuration, and logging
//! infrastructure shared by the memory and video crates.

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{AccessKind, EmulatorError, MemoryError, Result, VideoError};
pub use logging::init_logging;
