// instance.rs — compiled units and the id-keyed instance registry

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::RwLock;

use softcompute_common::shader_abi::EntryPoint;
use softcompute_common::CompileError;

use crate::backend::{BackendKind, CompilationBackend, CompileRequest, CompiledArtifact, ShaderSource};
use crate::config::EngineConfig;
use crate::dll_engine::DllEngine;
use crate::jit_engine::JitEngine;
use crate::symbols::SymbolResolver;

/// The only shader type the engine compiles.
pub const COMPUTE_SHADER_TYPE: &str = "comp";

// ============================================================
// ShaderInstance — one compiled unit
// ============================================================

/// A successfully compiled unit. Holding it keeps the code alive; dropping
/// the last handle releases it through its backend.
pub struct ShaderInstance {
    kind: BackendKind,
    artifact: Box<dyn CompiledArtifact>,
}

impl ShaderInstance {
    pub fn new(kind: BackendKind, artifact: Box<dyn CompiledArtifact>) -> Self {
        Self { kind, artifact }
    }

    pub fn entry_point(&self) -> EntryPoint {
        self.artifact.entry_point()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    pub fn unresolved_symbols(&self) -> &[String] {
        self.artifact.unresolved_symbols()
    }
}

impl std::fmt::Debug for ShaderInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderInstance")
            .field("kind", &self.kind)
            .field("entry", &self.entry_point())
            .finish()
    }
}

// ============================================================
// ShaderEngine — backend plus registry
// ============================================================

/// Compiles shader units through one backend and keeps at most one live
/// unit per id.
///
/// Lookups and replacements go through one lock, so a reader sees either the
/// old unit or the new one. A replaced unit is released once the last
/// outstanding `Arc` from `get` is gone.
pub struct ShaderEngine {
    backend: Box<dyn CompilationBackend>,
    entry_symbol: String,
    instances: RwLock<HashMap<u32, Arc<ShaderInstance>>>,
}

impl ShaderEngine {
    /// Engine with the backend the configuration selects.
    pub fn new(config: &EngineConfig) -> Result<Self, CompileError> {
        let backend: Box<dyn CompilationBackend> = match config.backend {
            BackendKind::Jit => Box::new(JitEngine::new(SymbolResolver::with_runtime(
                config.symbol_mode,
                config.abort_on_unresolved,
            ))),
            BackendKind::Dll => Box::new(DllEngine::new(config.symbol_mode)),
            BackendKind::Custom(name) => {
                return Err(CompileError::BackendConstructionFailed(format!(
                    "backend `{}` must be supplied with ShaderEngine::with_backend",
                    name
                )))
            }
        };
        Ok(Self::with_backend(backend, &config.entry_symbol))
    }

    pub fn with_backend(backend: Box<dyn CompilationBackend>, entry_symbol: &str) -> Self {
        Self {
            backend,
            entry_symbol: entry_symbol.to_string(),
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn entry_symbol(&self) -> &str {
        &self.entry_symbol
    }

    /// Compile one unit without registering it. Any type other than
    /// [`COMPUTE_SHADER_TYPE`] is refused before the backend sees it.
    pub fn compile_unit(
        &self,
        type_tag: &str,
        search_paths: &[PathBuf],
        options: &str,
        source: &ShaderSource,
    ) -> Result<ShaderInstance, CompileError> {
        if type_tag != COMPUTE_SHADER_TYPE {
            error!("Unknown shader type `{}`", type_tag);
            return Err(CompileError::UnknownShaderType(type_tag.to_string()));
        }

        let request = CompileRequest {
            source,
            options,
            search_paths,
            entry_symbol: &self.entry_symbol,
        };
        match self.backend.compile(&request) {
            Ok(artifact) => Ok(ShaderInstance::new(self.backend.kind(), artifact)),
            Err(e) => {
                error!("[{}] {}: {}", self.backend.kind(), source.describe(), e);
                Err(e)
            }
        }
    }

    /// Store `unit` under `id`, releasing whatever was there before.
    pub fn register(&self, id: u32, unit: ShaderInstance) -> Arc<ShaderInstance> {
        let unit = Arc::new(unit);
        let evicted = self.instances.write().insert(id, Arc::clone(&unit));
        if let Some(old) = evicted {
            warn!("Shader id {} already registered; releasing the previous instance", id);
            // released outside the lock
            drop(old);
        }
        unit
    }

    /// Compile and register. On failure the id keeps whatever it held.
    pub fn compile(
        &self,
        type_tag: &str,
        id: u32,
        search_paths: &[PathBuf],
        options: &str,
        source: &ShaderSource,
    ) -> Result<Arc<ShaderInstance>, CompileError> {
        let unit = self.compile_unit(type_tag, search_paths, options, source)?;
        info!("Shader {} compiled ({})", id, self.backend.kind());
        Ok(self.register(id, unit))
    }

    pub fn get(&self, id: u32) -> Option<Arc<ShaderInstance>> {
        self.instances.read().get(&id).cloned()
    }

    /// Unregister `id`; the unit is released once no caller holds it.
    pub fn remove(&self, id: u32) -> Option<Arc<ShaderInstance>> {
        self.instances.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }
}

// ============================================================
// Tests
// ============================================================
