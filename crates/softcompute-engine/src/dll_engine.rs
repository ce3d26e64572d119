// dll_engine.rs — build-or-load compiled shader modules
// Loads a shared module through the platform loader and resolves the entry
// symbol in it. Source text is first built into a temporary module by an
// installed ModuleBuilder.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use libloading::{Library, Symbol};
use log::{debug, info, warn};

use softcompute_common::shader_abi::EntryPoint;
use softcompute_common::CompileError;

use crate::backend::{
    find_in_search_paths, BackendKind, CompilationBackend, CompileRequest, CompiledArtifact,
    ShaderSource,
};
use crate::symbols::ResolutionMode;

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Turns procedural source text into a shared module at `output`.
///
/// This is how an external toolchain plugs into the module backend; without
/// one, only prebuilt module paths can be loaded.
pub trait ModuleBuilder: Send + Sync {
    fn build(
        &self,
        source: &str,
        options: &str,
        search_paths: &[PathBuf],
        output: &Path,
    ) -> Result<(), String>;
}

/// Unique path in the temp directory for a freshly built module.
pub fn temp_module_path() -> PathBuf {
    std::env::temp_dir().join(format!(
        "softcompute_{}_{}{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed),
        std::env::consts::DLL_SUFFIX
    ))
}

// ============================================================
// DllArtifact — wrapper for a loaded module
// ============================================================

pub struct DllArtifact {
    /// The loaded library handle - must be kept alive while `entry` is used
    library: Option<Library>,
    entry: EntryPoint,
    /// Backing file that could not be removed right after loading
    pending_delete: Option<PathBuf>,
}

impl CompiledArtifact for DllArtifact {
    fn entry_point(&self) -> EntryPoint {
        self.entry
    }
}

impl Drop for DllArtifact {
    fn drop(&mut self) {
        // Unload first: some platforms refuse to delete a mapped module.
        drop(self.library.take());
        if let Some(path) = self.pending_delete.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("[DLL] removed {}", path.display()),
                Err(e) => warn!("[DLL] cannot remove {}: {}", path.display(), e),
            }
        }
    }
}

// ============================================================
// DllEngine
// ============================================================

/// The dynamic-module compilation backend.
pub struct DllEngine {
    mode: ResolutionMode,
    builder: Option<Box<dyn ModuleBuilder>>,
}

impl DllEngine {
    /// Strict mode binds every symbol at load time, lazy mode on first call.
    pub fn new(mode: ResolutionMode) -> Self {
        Self { mode, builder: None }
    }

    pub fn with_builder(mut self, builder: Box<dyn ModuleBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    #[cfg(unix)]
    fn open(&self, path: &Path) -> Result<Library, libloading::Error> {
        use libloading::os::unix::{Library as UnixLibrary, RTLD_LAZY, RTLD_LOCAL, RTLD_NOW};

        let binding = match self.mode {
            ResolutionMode::Strict => RTLD_NOW,
            ResolutionMode::Lazy => RTLD_LAZY,
        };
        unsafe { UnixLibrary::open(Some(path), binding | RTLD_LOCAL) }.map(Into::into)
    }

    #[cfg(not(unix))]
    fn open(&self, path: &Path) -> Result<Library, libloading::Error> {
        unsafe { Library::new(path) }
    }

    /// Load `path`; a bare relative name is retried once from the current
    /// directory, since the loader would otherwise search only system paths.
    fn load(&self, path: &Path) -> Result<(Library, PathBuf), CompileError> {
        match self.open(path) {
            Ok(library) => Ok((library, path.to_path_buf())),
            Err(first) => {
                if path.is_absolute() || path.to_string_lossy().starts_with('.') {
                    return Err(CompileError::Load {
                        path: path.to_path_buf(),
                        detail: first.to_string(),
                    });
                }
                let local = Path::new(".").join(path);
                debug!("[DLL] {} ({}); retrying as {}", path.display(), first, local.display());
                self.open(&local)
                    .map(|library| (library, local.clone()))
                    .map_err(|e| CompileError::Load {
                        path: path.to_path_buf(),
                        detail: e.to_string(),
                    })
            }
        }
    }

    fn build(&self, text: &str, request: &CompileRequest<'_>) -> Result<PathBuf, CompileError> {
        let builder = self.builder.as_ref().ok_or_else(|| {
            CompileError::CompileFailed(
                "source text needs a module builder; pass a prebuilt module path instead".to_string(),
            )
        })?;
        let output = temp_module_path();
        debug!("[DLL] building module {}", output.display());
        if let Err(e) = builder.build(text, request.options, request.search_paths, &output) {
            // A failed build may still leave a partial file behind.
            let _ = std::fs::remove_file(&output);
            return Err(CompileError::CompileFailed(e));
        }
        Ok(output)
    }
}

impl CompilationBackend for DllEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Dll
    }

    fn compile(&self, request: &CompileRequest<'_>) -> Result<Box<dyn CompiledArtifact>, CompileError> {
        let (path, built) = match request.source {
            ShaderSource::Path(path) => {
                if path.as_os_str().is_empty() {
                    return Err(CompileError::FileNotFound { path: path.clone() });
                }
                let path = find_in_search_paths(path, request.search_paths).unwrap_or_else(|| path.clone());
                (path, false)
            }
            ShaderSource::Text(text) => (self.build(text, request)?, true),
        };

        let loaded = self.load(&path);
        let (library, loaded_path) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                if built {
                    let _ = std::fs::remove_file(&path);
                }
                return Err(e);
            }
        };

        let entry = {
            let symbol: Result<Symbol<*mut c_void>, _> =
                unsafe { library.get(request.entry_symbol.as_bytes()) };
            match symbol {
                Ok(sym) => EntryPoint::new(*sym).ok_or_else(|| CompileError::SymbolNotFound {
                    symbol: request.entry_symbol.to_string(),
                    detail: "symbol resolved to null".to_string(),
                }),
                Err(e) => Err(CompileError::SymbolNotFound {
                    symbol: request.entry_symbol.to_string(),
                    detail: e.to_string(),
                }),
            }
        };
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                drop(library);
                if built {
                    let _ = std::fs::remove_file(&loaded_path);
                }
                return Err(e);
            }
        };

        // The mapped code stays resident once loaded; the file is no longer needed.
        let pending_delete = match std::fs::remove_file(&loaded_path) {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    "[DLL] cannot remove {} yet ({}); retrying on release",
                    loaded_path.display(),
                    e
                );
                Some(loaded_path.clone())
            }
        };

        info!(
            "[DLL] loaded {} -> {} @ {:p}",
            loaded_path.display(),
            request.entry_symbol,
            entry.as_ptr()
        );

        Ok(Box::new(DllArtifact {
            library: Some(library),
            entry,
            pending_delete,
        }))
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use softcompute_common::ErrorClass;

    fn compile(engine: &DllEngine, source: ShaderSource, entry: &str) -> Result<Box<dyn CompiledArtifact>, CompileError> {
        engine.compile(&CompileRequest {
            source: &source,
            options: "",
            search_paths: &[],
            entry_symbol: entry,
        })
    }

    /// A system shared library to stand in for a compiled module.
    #[cfg(target_os = "linux")]
    fn system_libm() -> Option<PathBuf> {
        [
            "/lib/x86_64-linux-gnu/libm.so.6",
            "/usr/lib/x86_64-linux-gnu/libm.so.6",
            "/lib/aarch64-linux-gnu/libm.so.6",
            "/usr/lib/aarch64-linux-gnu/libm.so.6",
            "/lib64/libm.so.6",
            "/usr/lib64/libm.so.6",
            "/usr/lib/libm.so.6",
            "/lib/libm.so.6",
        ]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
    }

    #[cfg(target_os = "linux")]
    fn copy_of_libm() -> Option<PathBuf> {
        let src = system_libm()?;
        let dst = temp_module_path();
        std::fs::copy(src, &dst).ok()?;
        Some(dst)
    }

    #[test]
    fn test_empty_path() {
        let err = compile(&DllEngine::new(ResolutionMode::Strict), ShaderSource::path(""), "softcompute_main")
            .err()
            .unwrap();
        assert!(matches!(err, CompileError::FileNotFound { .. }));
    }

    #[test]
    fn test_missing_module_reports_loader_text() {
        let err = compile(
            &DllEngine::new(ResolutionMode::Strict),
            ShaderSource::path("no_such_softcompute_module.so"),
            "softcompute_main",
        )
        .err()
        .unwrap();
        assert_eq!(err.class(), ErrorClass::Io);
        match err {
            CompileError::Load { detail, .. } => assert!(!detail.is_empty()),
            other => panic!("expected Load, got {:?}", other),
        }
    }

    #[test]
    fn test_text_without_builder() {
        let err = compile(
            &DllEngine::new(ResolutionMode::Strict),
            ShaderSource::text("void softcompute_main() {}"),
            "softcompute_main",
        )
        .err()
        .unwrap();
        assert!(matches!(err, CompileError::CompileFailed(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_load_resolves_entry_and_removes_file() {
        let Some(path) = copy_of_libm() else { return };
        let artifact = compile(&DllEngine::new(ResolutionMode::Strict), ShaderSource::Path(path.clone()), "cos").unwrap();
        assert!(!path.exists());

        let cos: extern "C" fn(f64) -> f64 = unsafe { std::mem::transmute(artifact.entry_point().as_ptr()) };
        assert_eq!(cos(0.0), 1.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_bare_relative_name_loads_from_current_dir() {
        let Some(libm) = system_libm() else { return };
        let bare = PathBuf::from(format!("softcompute_bare_{}{}", std::process::id(), std::env::consts::DLL_SUFFIX));
        std::fs::copy(libm, &bare).unwrap();

        let result = compile(&DllEngine::new(ResolutionMode::Strict), ShaderSource::Path(bare.clone()), "cos");
        let left_behind = bare.exists();
        if left_behind {
            let _ = std::fs::remove_file(&bare);
        }
        assert!(result.is_ok());
        assert!(!left_behind);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_missing_entry_symbol() {
        let Some(path) = copy_of_libm() else { return };
        let err = compile(&DllEngine::new(ResolutionMode::Lazy), ShaderSource::Path(path.clone()), "softcompute_main")
            .err()
            .unwrap();
        assert_eq!(err.class(), ErrorClass::Link);
        let _ = std::fs::remove_file(path);
    }

    #[cfg(target_os = "linux")]
    struct CopyBuilder(PathBuf);

    #[cfg(target_os = "linux")]
    impl ModuleBuilder for CopyBuilder {
        fn build(&self, source: &str, _: &str, _: &[PathBuf], output: &Path) -> Result<(), String> {
            if source.contains("error") {
                return Err(format!("{}: syntax error", output.display()));
            }
            std::fs::copy(&self.0, output).map(|_| ()).map_err(|e| e.to_string())
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_builder_output_is_loaded() {
        let Some(libm) = system_libm() else { return };
        let engine = DllEngine::new(ResolutionMode::Strict).with_builder(Box::new(CopyBuilder(libm)));

        let artifact = compile(&engine, ShaderSource::text("fine"), "cos").unwrap();
        let cos: extern "C" fn(f64) -> f64 = unsafe { std::mem::transmute(artifact.entry_point().as_ptr()) };
        assert_eq!(cos(0.0), 1.0);

        let err = compile(&engine, ShaderSource::text("error"), "cos").err().unwrap();
        assert!(matches!(err, CompileError::CompileFailed(_)));
    }
}
