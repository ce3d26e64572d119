// backend.rs — the pluggable compilation backend
//
// A backend turns shader source (or a prebuilt module path) into a native
// entry point. The artifact it returns owns whatever the code lives in; the
// code is released when the artifact is dropped, on every path.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use softcompute_common::shader_abi::EntryPoint;
use softcompute_common::CompileError;

/// Which strategy produced a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// In-process compile and JIT link.
    Jit,
    /// Build-or-load a shared module through the platform loader.
    Dll,
    /// Anything supplied by the embedding application.
    Custom(&'static str),
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Jit => f.write_str("jit"),
            BackendKind::Dll => f.write_str("dll"),
            BackendKind::Custom(name) => f.write_str(name),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jit" => Ok(BackendKind::Jit),
            "dll" | "so" | "dylib" => Ok(BackendKind::Dll),
            other => Err(format!("unknown backend `{}` (expected jit or dll)", other)),
        }
    }
}

/// Shader input: a path on disk or the source text itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShaderSource {
    Path(PathBuf),
    Text(String),
}

impl ShaderSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        ShaderSource::Path(path.into())
    }

    pub fn text(text: impl Into<String>) -> Self {
        ShaderSource::Text(text.into())
    }

    /// Short description for log lines.
    pub fn describe(&self) -> String {
        match self {
            ShaderSource::Path(p) => p.display().to_string(),
            ShaderSource::Text(t) => format!("<{} bytes of source>", t.len()),
        }
    }
}

/// Everything a backend needs for one compile.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    pub source: &'a ShaderSource,
    /// Free-form compiler option string, backend specific.
    pub options: &'a str,
    pub search_paths: &'a [PathBuf],
    pub entry_symbol: &'a str,
}

/// Compiled code kept alive for as long as the artifact lives.
pub trait CompiledArtifact: Send + Sync {
    fn entry_point(&self) -> EntryPoint;

    /// Names bound to the lazy-resolution trap instead of a real target.
    fn unresolved_symbols(&self) -> &[String] {
        &[]
    }
}

/// A strategy turning source into a native entry point.
pub trait CompilationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn compile(&self, request: &CompileRequest<'_>) -> Result<Box<dyn CompiledArtifact>, CompileError>;
}

/// Locate `path` directly or under one of the search paths.
pub fn find_in_search_paths(path: &Path, search_paths: &[PathBuf]) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    if path.is_absolute() {
        return None;
    }
    search_paths
        .iter()
        .map(|dir| dir.join(path))
        .find(|candidate| candidate.is_file())
}

// ============================================================
// Tests
// ============================================================
