//! Shader variant cache

use std::collections::HashMap;
use std::path::PathBuf;

use op_core::error::VideoError;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::config::PipelineConfig;
use super::glsl::{generate_fragment_shader, generate_vertex_shader};
use super::uniform::UniformData;
use crate::backend::{GraphicsBackend, ProgramHandle};

/// A compiled program for one pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderVariant {
    pub program: ProgramHandle,
    /// Size of the `shader_data` block the program reads
    pub uniform_block_size: usize,
}

/// Programs keyed by [`PipelineConfig`]. Variants live until [`clear`](ShaderCache::clear).
#[derive(Debug, Default)]
pub struct ShaderCache {
    variants: HashMap<PipelineConfig, ShaderVariant>,
    dump_dir: Option<PathBuf>,
}

impl ShaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also write the source of every new variant to `dir`
    pub fn with_dump_dir(dir: PathBuf) -> Self {
        Self {
            variants: HashMap::new(),
            dump_dir: Some(dir),
        }
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn get(&self, config: &PipelineConfig) -> Option<&ShaderVariant> {
        self.variants.get(config)
    }

    /// Return the variant for `config`, generating and compiling it on a miss
    pub fn get_or_create<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        config: &PipelineConfig,
    ) -> Result<&ShaderVariant, VideoError> {
        if !self.variants.contains_key(config) {
            debug!("Creating new shader ({} cached)", self.variants.len());
            let vertex = generate_vertex_shader();
            let fragment = generate_fragment_shader(config);
            self.dump(&vertex, &fragment);

            let program = backend.create_program(&vertex, &fragment)?;
            self.variants.insert(
                *config,
                ShaderVariant {
                    program,
                    uniform_block_size: std::mem::size_of::<UniformData>(),
                },
            );
        }
        Ok(&self.variants[config])
    }

    fn dump(&self, vertex: &str, fragment: &str) {
        let Some(dir) = &self.dump_dir else {
            return;
        };
        let name = format!("{:016x}", xxh3_64(fragment.as_bytes()));
        let result = std::fs::create_dir_all(dir)
            .and_then(|_| std::fs::write(dir.join(format!("{}.vert", name)), vertex))
            .and_then(|_| std::fs::write(dir.join(format!("{}.frag", name)), fragment));
        if let Err(e) = result {
            warn!("Failed to dump shader to {}: {}", dir.display(), e);
        }
    }

    /// Release every program
    pub fn clear<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) {
        for (_, variant) in self.variants.drain() {
            backend.delete_program(variant.program);
        }
    }
}
