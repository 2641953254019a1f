//! Configuration system for the oxidized-pica rasterizer

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::EmulatorError;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub gpu: GpuConfig,
    pub paths: PathConfig,
    pub debug: DebugConfig,
}

/// GPU settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub backend: GpuBackend,
    /// When disabled every rasterizer notification is ignored
    pub use_hw_renderer: bool,
    /// Number of vertices reserved up front for the triangle batch
    pub vertex_batch_reserve: usize,
}

/// GPU backend type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum GpuBackend {
    #[default]
    Vulkan,
    Null,
}

/// Path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub shader_dump_dir: PathBuf,
}

/// Debug settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
    pub log_to_file: bool,
    pub log_path: PathBuf,
    /// Write the GLSL of every newly generated shader variant to `shader_dump_dir`
    pub dump_shaders: bool,
    /// Enable Vulkan validation layers
    pub validation: bool,
}

/// Logging level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

// Default implementations

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            backend: GpuBackend::default(),
            use_hw_renderer: true,
            vertex_batch_reserve: 3 * 1024,
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("oxidized-pica");

        Self {
            shader_dump_dir: base.join("shader_dump"),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_to_file: false,
            log_path: PathBuf::from("oxidized-pica.log"),
            dump_shaders: false,
            validation: false,
        }
    }
}

impl Config {
    /// Load configuration from the default location, or create it if it doesn't exist
    pub fn load() -> Result<Self, EmulatorError> {
        let path = Self::config_path();

        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self, EmulatorError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| EmulatorError::Config(e.to_string()))
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<(), EmulatorError> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| EmulatorError::Config(e.to_string()))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("oxidized-pica")
            .join("config.toml")
    }
}
