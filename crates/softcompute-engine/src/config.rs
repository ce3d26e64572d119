// config.rs — typed engine configuration built from cvars

use std::path::PathBuf;

use log::warn;

use softcompute_common::cvar::{CvarContext, CVAR_LATCH};
use softcompute_common::shader_abi::ENTRY_SYMBOL;

use crate::backend::BackendKind;
use crate::symbols::ResolutionMode;

/// Engine cvar names and their defaults.
pub const CVAR_BACKEND: (&str, &str) = ("sc_backend", "jit");
pub const CVAR_SYMBOLS: (&str, &str) = ("sc_symbols", "strict");
pub const CVAR_ABORT_ON_UNRESOLVED: (&str, &str) = ("sc_abort_on_unresolved", "1");
pub const CVAR_ENTRY: (&str, &str) = ("sc_entry", ENTRY_SYMBOL);
pub const CVAR_OPTIONS: (&str, &str) = ("sc_options", "");
pub const CVAR_INCLUDE: (&str, &str) = ("sc_include", "");
pub const CVAR_VERBOSE: (&str, &str) = ("sc_verbose", "0");

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub backend: BackendKind,
    pub symbol_mode: ResolutionMode,
    /// Strict mode only: abort the process instead of failing the compile.
    pub abort_on_unresolved: bool,
    pub entry_symbol: String,
    pub compiler_options: String,
    pub search_paths: Vec<PathBuf>,
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Jit,
            symbol_mode: ResolutionMode::Strict,
            abort_on_unresolved: true,
            entry_symbol: ENTRY_SYMBOL.to_string(),
            compiler_options: String::new(),
            search_paths: Vec::new(),
            verbose: false,
        }
    }
}

impl EngineConfig {
    /// Register every engine cvar with its default.
    pub fn register_cvars(cvars: &mut CvarContext) {
        cvars.get(CVAR_BACKEND.0, CVAR_BACKEND.1, CVAR_LATCH);
        cvars.get(CVAR_SYMBOLS.0, CVAR_SYMBOLS.1, CVAR_LATCH);
        cvars.get(CVAR_ABORT_ON_UNRESOLVED.0, CVAR_ABORT_ON_UNRESOLVED.1, 0);
        cvars.get(CVAR_ENTRY.0, CVAR_ENTRY.1, 0);
        cvars.get(CVAR_OPTIONS.0, CVAR_OPTIONS.1, 0);
        cvars.get(CVAR_INCLUDE.0, CVAR_INCLUDE.1, 0);
        cvars.get(CVAR_VERBOSE.0, CVAR_VERBOSE.1, 0);
    }

    /// Build the config from cvars. Invalid values are reported and replaced
    /// by their defaults.
    pub fn from_cvars(cvars: &CvarContext) -> Self {
        let defaults = Self::default();

        let backend = match cvars.find_var(CVAR_BACKEND.0) {
            Some(var) => var.string.parse().unwrap_or_else(|e| {
                warn!("{}: {}; using {}", CVAR_BACKEND.0, e, defaults.backend);
                defaults.backend
            }),
            None => defaults.backend,
        };

        let symbol_mode = match cvars.find_var(CVAR_SYMBOLS.0) {
            Some(var) => var.string.parse().unwrap_or_else(|e| {
                warn!("{}: {}; using {}", CVAR_SYMBOLS.0, e, defaults.symbol_mode);
                defaults.symbol_mode
            }),
            None => defaults.symbol_mode,
        };

        let abort_on_unresolved = match cvars.find_var(CVAR_ABORT_ON_UNRESOLVED.0) {
            Some(var) => var.as_bool(),
            None => defaults.abort_on_unresolved,
        };

        let entry_symbol = match cvars.variable_string(CVAR_ENTRY.0).trim() {
            "" => defaults.entry_symbol,
            name => name.to_string(),
        };

        let search_paths = cvars
            .variable_string(CVAR_INCLUDE.0)
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();

        Self {
            backend,
            symbol_mode,
            abort_on_unresolved,
            entry_symbol,
            compiler_options: cvars.variable_string(CVAR_OPTIONS.0).to_string(),
            search_paths,
            verbose: cvars.variable_bool(CVAR_VERBOSE.0),
        }
    }
}
