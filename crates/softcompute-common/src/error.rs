//! Error types shared by every compilation backend.
//!
//! [`CompileError`] is what a backend, the instance registry and the link
//! step return. [`ErrorClass`] folds the variants back onto the coarse
//! categories callers branch on (usage mistakes, compile and link failures,
//! sandbox violations, I/O).

use std::path::PathBuf;

use thiserror::Error;

/// Coarse category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad arguments; nothing was changed.
    Usage,
    /// The frontend rejected or could not process the source.
    Compile,
    /// The entry point could not be produced from compiled code.
    Link,
    /// Compiled code referenced a name outside the allow-list.
    SymbolResolution,
    /// A file or the platform loader failed.
    Io,
}

#[derive(Error, Debug)]
pub enum CompileError {
    /// Only compute shaders are accepted.
    #[error("Unknown shader type `{0}` (expected \"comp\")")]
    UnknownShaderType(String),

    #[error("File not found in the search path: {}", .path.display())]
    FileNotFound { path: PathBuf },

    #[error("Compile failed: {0}")]
    CompileFailed(String),

    #[error("Cannot find entry symbol `{symbol}`: {detail}")]
    SymbolNotFound { symbol: String, detail: String },

    #[error("Failed to construct compilation backend: {0}")]
    BackendConstructionFailed(String),

    /// Names referenced by compiled code that the resolver refused.
    #[error("Unresolved external symbol(s): {}", .0.join(", "))]
    UnresolvedSymbols(Vec<String>),

    /// The platform loader refused the module; `detail` is its error text.
    #[error("Cannot find/open shader module {} ({detail})", .path.display())]
    Load { path: PathBuf, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CompileError::UnknownShaderType(_) => ErrorClass::Usage,
            CompileError::CompileFailed(_) => ErrorClass::Compile,
            CompileError::SymbolNotFound { .. } | CompileError::BackendConstructionFailed(_) => {
                ErrorClass::Link
            }
            CompileError::UnresolvedSymbols(_) => ErrorClass::SymbolResolution,
            CompileError::FileNotFound { .. } | CompileError::Load { .. } | CompileError::Io(_) => {
                ErrorClass::Io
            }
        }
    }
}
