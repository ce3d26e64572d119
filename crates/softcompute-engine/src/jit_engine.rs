// jit_engine.rs — in-process compile and JIT link through Cranelift
//
// Procedural shader source is Cranelift IR text. One compile parses every
// function in the text, checks each external reference against the symbol
// resolver, defines the functions in a fresh JIT module and hands back the
// finalized address of the entry function. The module (and its executable
// memory) is owned by the returned artifact.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use cranelift_codegen::ir::{self, ExternalName, UserExternalName, UserFuncName};
use cranelift_codegen::isa::{self, OwnedTargetIsa};
use cranelift_codegen::settings::{self, Configurable, SetError};
use cranelift_codegen::CodegenError;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module, ModuleError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use softcompute_common::shader_abi::EntryPoint;
use softcompute_common::CompileError;

use crate::backend::{
    find_in_search_paths, BackendKind, CompilationBackend, CompileRequest, CompiledArtifact,
    ShaderSource,
};
use crate::symbols::{unresolved_trap_address, SymbolResolver};

// ============================================================
// One-time host target setup
// ============================================================

/// Host target detection runs at most once per process, whichever thread gets
/// there first. Later compiles only proceed if it succeeded, and each builds
/// its own ISA builder since settings are applied to it in place.
static HOST_ISA: OnceLock<Result<(), String>> = OnceLock::new();

fn host_isa_builder() -> Result<isa::Builder, CompileError> {
    let detected = HOST_ISA.get_or_init(|| {
        debug!("[JIT] detecting host target");
        cranelift_native::builder().map(|_| ()).map_err(|e| e.to_string())
    });
    let construction_failed =
        |e: &str| CompileError::BackendConstructionFailed(format!("host target: {}", e));
    detected.as_ref().map_err(|e| construction_failed(e.as_str()))?;
    cranelift_native::builder().map_err(|e| construction_failed(&e.to_string()))
}

// ============================================================
// Invocation — the synthesized compiler command line
// ============================================================

/// One compile job: fixed baseline settings, caller options, include dirs.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// `(name, value)` codegen settings in application order.
    pub settings: Vec<(String, String)>,
    pub include_dirs: Vec<PathBuf>,
    /// Bare tokens found among the options. Each one is another input.
    pub extra_inputs: Vec<String>,
}

impl Invocation {
    const BASELINE: [(&'static str, &'static str); 4] = [
        ("enable_verifier", "true"),
        ("is_pic", "false"),
        ("use_colocated_libcalls", "false"),
        ("opt_level", "speed"),
    ];

    pub fn new(options: &str, search_paths: &[PathBuf]) -> Self {
        let mut inv = Self {
            settings: Self::BASELINE
                .iter()
                .map(|&(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            include_dirs: Vec::new(),
            extra_inputs: Vec::new(),
        };

        let mut tokens = options.split_whitespace();
        while let Some(tok) = tokens.next() {
            match tok {
                "-O0" => inv.set("opt_level", "none"),
                "-O1" | "-O2" | "-O3" => inv.set("opt_level", "speed"),
                "-Os" => inv.set("opt_level", "speed_and_size"),
                "-I" => match tokens.next() {
                    Some(dir) => inv.include_dirs.push(PathBuf::from(dir)),
                    None => warn!("[JIT] `-I` without a directory ignored"),
                },
                t if t.starts_with("-I") => inv.include_dirs.push(PathBuf::from(&t[2..])),
                t if t.starts_with('-') => warn!("[JIT] unsupported option `{}` ignored", t),
                t => match t.split_once('=') {
                    Some((name, value)) if !name.is_empty() => inv.set(name, value),
                    _ => inv.extra_inputs.push(t.to_string()),
                },
            }
        }

        inv.include_dirs.extend(search_paths.iter().cloned());
        inv
    }

    fn set(&mut self, name: &str, value: &str) {
        match self.settings.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value.to_string(),
            None => self.settings.push((name.to_string(), value.to_string())),
        }
    }

    /// Number of compile jobs this command line describes.
    pub fn job_count(&self) -> usize {
        1 + self.extra_inputs.len()
    }

    /// The command line as a log line.
    pub fn describe(&self) -> String {
        let mut out: Vec<String> = self.settings.iter().map(|(n, v)| format!("{}={}", n, v)).collect();
        out.extend(self.include_dirs.iter().map(|d| format!("-I{}", d.display())));
        out.extend(self.extra_inputs.iter().cloned());
        out.join(" ")
    }

    /// Apply the settings and build the target ISA. Names the shared flags
    /// do not know are tried as target-specific settings.
    fn build_isa(&self) -> Result<OwnedTargetIsa, CompileError> {
        let mut isa_builder = host_isa_builder()?;
        let mut flags = settings::builder();

        for (name, value) in &self.settings {
            // Stack checks call a host helper that is not on the allow-list.
            if name == "enable_probestack" && value != "false" {
                return Err(CompileError::CompileFailed(format!(
                    "setting `{}={}` is not supported: stack checks call outside the symbol allow-list",
                    name, value
                )));
            }
            match flags.set(name, value) {
                Ok(()) => {}
                Err(SetError::BadName(_)) => isa_builder.set(name, value).map_err(|e| {
                    CompileError::CompileFailed(format!("setting `{}={}`: {}", name, value, e))
                })?,
                Err(e) => {
                    return Err(CompileError::CompileFailed(format!(
                        "setting `{}={}`: {}",
                        name, value, e
                    )))
                }
            }
        }

        isa_builder
            .finish(settings::Flags::new(flags))
            .map_err(|e| CompileError::BackendConstructionFailed(e.to_string()))
    }
}

// ============================================================
// Artifact
// ============================================================

/// A finalized JIT module and the entry address inside it.
pub struct JitArtifact {
    module: Option<JITModule>,
    entry: EntryPoint,
    unresolved: Vec<String>,
}

// The module is never touched again after finalization; only the immutable
// code it owns is shared, and it is freed exactly once in Drop.
unsafe impl Send for JitArtifact {}
unsafe impl Sync for JitArtifact {}

impl CompiledArtifact for JitArtifact {
    fn entry_point(&self) -> EntryPoint {
        self.entry
    }

    fn unresolved_symbols(&self) -> &[String] {
        &self.unresolved
    }
}

impl Drop for JitArtifact {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            debug!("[JIT] releasing module for entry {:p}", self.entry.as_ptr());
            // No entry pointer from this module may be called afterwards; the
            // registry only drops a unit once nobody holds it.
            unsafe { module.free_memory() };
        }
    }
}

// ============================================================
// JitEngine
// ============================================================

/// The in-process compilation backend.
pub struct JitEngine {
    resolver: SymbolResolver,
}

impl JitEngine {
    pub fn new(resolver: SymbolResolver) -> Self {
        Self { resolver }
    }

    fn load_source(source: &ShaderSource, include_dirs: &[PathBuf]) -> Result<String, CompileError> {
        match source {
            ShaderSource::Text(text) => Ok(text.clone()),
            ShaderSource::Path(path) => {
                let found = find_in_search_paths(path, include_dirs)
                    .ok_or_else(|| CompileError::FileNotFound { path: path.clone() })?;
                debug!("[JIT] reading {}", found.display());
                Ok(std::fs::read_to_string(found)?)
            }
        }
    }
}

fn function_name(func: &ir::Function) -> String {
    func.name.to_string().trim_start_matches('%').to_string()
}

fn module_error(name: &str, err: ModuleError) -> CompileError {
    match err {
        ModuleError::Compilation(CodegenError::Verifier(errors)) => {
            CompileError::CompileFailed(format!("function `{}` failed verification:\n{}", name, errors))
        }
        other => CompileError::CompileFailed(format!("function `{}`: {}", name, other)),
    }
}

/// Where an external reference in the parsed IR points.
enum ExtTarget {
    Local(String),
    Import(String),
    Keep,
}

/// An IR entity naming something outside its own function.
#[derive(Clone, Copy)]
enum RefSite {
    Call(ir::FuncRef),
    Symbol(ir::GlobalValue),
}

impl JitEngine {
    /// Sort one external name into local, import or untouched, recording
    /// names the allow-list does not cover.
    fn classify(
        &self,
        func: &ir::Function,
        name: &ExternalName,
        local_names: &HashSet<String>,
        unresolved: &mut Vec<String>,
    ) -> Result<ExtTarget, CompileError> {
        let mut check = |name: String| {
            if !self.resolver.is_allowed(&name) && !unresolved.contains(&name) {
                unresolved.push(name);
            }
        };
        match name {
            ExternalName::TestCase(name) => {
                let name = name.to_string().trim_start_matches('%').to_string();
                if local_names.contains(&name) {
                    return Ok(ExtTarget::Local(name));
                }
                check(name.clone());
                Ok(ExtTarget::Import(name))
            }
            ExternalName::LibCall(libcall) => {
                check(cranelift_module::default_libcall_names()(*libcall));
                Ok(ExtTarget::Keep)
            }
            other => Err(CompileError::CompileFailed(format!(
                "function `{}`: unsupported external reference `{}`",
                function_name(func),
                other.display(None)
            ))),
        }
    }
}

impl CompilationBackend for JitEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Jit
    }

    fn compile(&self, request: &CompileRequest<'_>) -> Result<Box<dyn CompiledArtifact>, CompileError> {
        let invocation = Invocation::new(request.options, request.search_paths);
        debug!("[JIT] invocation: {} ({} symbols)", invocation.describe(), self.resolver.mode());

        if invocation.job_count() != 1 {
            return Err(CompileError::CompileFailed(format!(
                "expected exactly one compile job, got {} (extra inputs: {})",
                invocation.job_count(),
                invocation.extra_inputs.join(", ")
            )));
        }

        let text = Self::load_source(request.source, &invocation.include_dirs)?;
        let isa = invocation.build_isa()?;

        let mut functions = cranelift_reader::parse_functions(&text)
            .map_err(|e| CompileError::CompileFailed(e.to_string()))?;
        if functions.is_empty() {
            return Err(CompileError::CompileFailed(format!(
                "no functions in {}",
                request.source.describe()
            )));
        }

        let call_conv = isa.default_call_conv();
        let local_names: HashSet<String> = functions.iter().map(function_name).collect();

        // First pass: normalize calling conventions and classify every
        // external reference before anything is linked.
        let mut unresolved: Vec<String> = Vec::new();
        let mut targets: Vec<Vec<(RefSite, ExtTarget)>> = Vec::with_capacity(functions.len());
        for func in &mut functions {
            func.signature.call_conv = call_conv;
            for sig in func.dfg.signatures.values_mut() {
                sig.call_conv = call_conv;
            }

            let mut func_targets = Vec::new();
            for (fref, ext) in func.dfg.ext_funcs.iter() {
                let target = self.classify(func, &ext.name, &local_names, &mut unresolved)?;
                func_targets.push((RefSite::Call(fref), target));
            }
            for (gv, data) in func.global_values.iter() {
                let ir::GlobalValueData::Symbol { name, tls, .. } = data else { continue };
                if *tls {
                    return Err(CompileError::CompileFailed(format!(
                        "function `{}`: thread-local symbol `{}` is not supported",
                        function_name(func),
                        name.display(None)
                    )));
                }
                let target = self.classify(func, name, &local_names, &mut unresolved)?;
                func_targets.push((RefSite::Symbol(gv), target));
            }
            targets.push(func_targets);
        }

        let entry_index = functions
            .iter()
            .position(|f| function_name(f) == request.entry_symbol)
            .ok_or_else(|| CompileError::SymbolNotFound {
                symbol: request.entry_symbol.to_string(),
                detail: format!("no such function in {}", request.source.describe()),
            })?;

        {
            let sig = &functions[entry_index].signature;
            let ok = sig.returns.is_empty()
                && sig.params.len() == 1
                && sig.params[0].value_type == isa.pointer_type();
            if !ok {
                return Err(CompileError::CompileFailed(format!(
                    "entry `{}` must have signature ({}) with no returns, found {}",
                    request.entry_symbol,
                    isa.pointer_type(),
                    sig
                )));
            }
        }

        let mut unresolved = self.resolver.check_unresolved(unresolved)?;

        // Every name the module asks for goes through the resolver. Names it
        // does not know, including libcalls inserted during codegen, are bound
        // to the trap so the host symbol table is never searched.
        let deferred: HashSet<String> = unresolved.iter().cloned().collect();
        let late: Arc<Mutex<Vec<String>>> = Arc::default();
        let lookup_late = Arc::clone(&late);
        let resolver = self.resolver.clone();
        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        builder.symbol_lookup_fn(Box::new(move |name| {
            if let Some(addr) = resolver.resolve(name) {
                return Some(addr);
            }
            if !deferred.contains(name) {
                let mut late = lookup_late.lock();
                if !late.iter().any(|n| n == name) {
                    late.push(name.to_string());
                }
            }
            Some(unresolved_trap_address())
        }));
        let mut module = JITModule::new(builder);

        let mut ids: HashMap<String, FuncId> = HashMap::new();
        for (index, func) in functions.iter().enumerate() {
            let name = function_name(func);
            let linkage = if index == entry_index { Linkage::Export } else { Linkage::Local };
            let id = module
                .declare_function(&name, linkage, &func.signature)
                .map_err(|e| module_error(&name, e))?;
            ids.insert(name, id);
        }

        // Second pass: point every reference at a module-level declaration.
        // Namespace 0 holds functions, 1 holds data.
        for (func, func_targets) in functions.iter_mut().zip(targets) {
            for (site, target) in func_targets {
                let user = match (site, target) {
                    (_, ExtTarget::Keep) => continue,
                    (_, ExtTarget::Local(name)) => UserExternalName::new(0, ids[&name].as_u32()),
                    (RefSite::Call(fref), ExtTarget::Import(name)) => {
                        let sig = func.dfg.signatures[func.dfg.ext_funcs[fref].signature].clone();
                        let id = module
                            .declare_function(&name, Linkage::Import, &sig)
                            .map_err(|e| module_error(&name, e))?;
                        UserExternalName::new(0, id.as_u32())
                    }
                    (RefSite::Symbol(_), ExtTarget::Import(name)) => {
                        let id = module
                            .declare_data(&name, Linkage::Import, false, false)
                            .map_err(|e| module_error(&name, e))?;
                        UserExternalName::new(1, id.as_u32())
                    }
                };
                let user = ExternalName::user(func.declare_imported_user_function(user));
                match site {
                    RefSite::Call(fref) => func.dfg.ext_funcs[fref].name = user,
                    RefSite::Symbol(gv) => {
                        if let ir::GlobalValueData::Symbol { name, .. } = &mut func.global_values[gv] {
                            *name = user;
                        }
                    }
                }
            }
        }

        let mut ctx = module.make_context();
        let mut entry_id = None;
        for (index, func) in functions.into_iter().enumerate() {
            let name = function_name(&func);
            let id = ids[&name];
            ctx.func = func;
            ctx.func.name = UserFuncName::user(0, id.as_u32());
            if let Err(e) = module.define_function(id, &mut ctx) {
                let err = module_error(&name, e);
                error!("[JIT] {}", err);
                return Err(err);
            }
            module.clear_context(&mut ctx);
            if index == entry_index {
                entry_id = Some(id);
            }
        }

        module
            .finalize_definitions()
            .map_err(|e| CompileError::CompileFailed(format!("finalize: {}", e)))?;

        let late = std::mem::take(&mut *late.lock());
        if !late.is_empty() {
            match self.resolver.check_unresolved(late) {
                Ok(names) => unresolved.extend(names),
                Err(e) => {
                    // Nothing from this module has been handed out yet.
                    unsafe { module.free_memory() };
                    return Err(e);
                }
            }
        }

        let entry = entry_id
            .map(|id| module.get_finalized_function(id))
            .and_then(|ptr| EntryPoint::new(ptr.cast()))
            .ok_or_else(|| CompileError::SymbolNotFound {
                symbol: request.entry_symbol.to_string(),
                detail: "entry address is null".to_string(),
            })?;

        info!(
            "[JIT] compiled {} -> {} @ {:p}",
            request.source.describe(),
            request.entry_symbol,
            entry.as_ptr()
        );

        Ok(Box::new(JitArtifact {
            module: Some(module),
            entry,
            unresolved,
        }))
    }
}

// ============================================================
// Tests
// ============================================================
