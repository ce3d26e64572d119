//! Shader compilation backends, symbol sandboxing and the instance registry.

pub mod backend;
pub mod config;
pub mod dll_engine;
pub mod instance;
pub mod jit_engine;
pub mod symbols;

pub use backend::{BackendKind, CompilationBackend, CompileRequest, CompiledArtifact, ShaderSource};
pub use config::EngineConfig;
pub use instance::{ShaderEngine, ShaderInstance, COMPUTE_SHADER_TYPE};
pub use symbols::{ResolutionMode, SymbolResolver};
