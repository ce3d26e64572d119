//! Symbol resolution for compiled shader code.
//!
//! Compiled code never sees the host process's symbol table. Every external
//! name it references is looked up here, in an allow-list that maps the name
//! to a trusted native implementation (the math and memory routines shader
//! code and the code generator's libcalls need). Anything else is
//! unresolved:
//!
//! - [`ResolutionMode::Strict`]: linking fails; with `abort_on_unresolved`
//!   the process aborts, treating the reference as an escape attempt.
//! - [`ResolutionMode::Lazy`]: the name is bound to a trap. Calling it marks
//!   the current thread, and the dispatch loop turns the mark into an error
//!   after the invocation returns.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use log::{debug, error, warn};

use softcompute_common::CompileError;

/// What happens to a name outside the allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionMode {
    #[default]
    Strict,
    Lazy,
}

impl fmt::Display for ResolutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionMode::Strict => f.write_str("strict"),
            ResolutionMode::Lazy => f.write_str("lazy"),
        }
    }
}

impl FromStr for ResolutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" | "now" => Ok(ResolutionMode::Strict),
            "lazy" => Ok(ResolutionMode::Lazy),
            other => Err(format!("unknown symbol mode `{}` (expected strict or lazy)", other)),
        }
    }
}

/// Allow-list resolver for external names in compiled code.
#[derive(Debug, Clone)]
pub struct SymbolResolver {
    mode: ResolutionMode,
    abort_on_unresolved: bool,
    /// name -> address of the trusted implementation
    allowed: HashMap<String, usize>,
}

impl SymbolResolver {
    /// Resolver with an empty allow-list.
    pub fn new(mode: ResolutionMode, abort_on_unresolved: bool) -> Self {
        Self {
            mode,
            abort_on_unresolved,
            allowed: HashMap::new(),
        }
    }

    /// Resolver pre-populated with the shader runtime (math, memory).
    pub fn with_runtime(mode: ResolutionMode, abort_on_unresolved: bool) -> Self {
        let mut resolver = Self::new(mode, abort_on_unresolved);
        for (name, addr) in runtime::symbols() {
            resolver.allow(name, addr);
        }
        resolver
    }

    pub fn mode(&self) -> ResolutionMode {
        self.mode
    }

    /// Add or replace a trusted implementation.
    pub fn allow(&mut self, name: &str, addr: *const u8) {
        self.allowed.insert(name.to_string(), addr as usize);
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowed.contains_key(name)
    }

    pub fn resolve(&self, name: &str) -> Option<*const u8> {
        let addr = self.allowed.get(name).map(|&a| a as *const u8);
        match addr {
            Some(_) => debug!("resolved `{}` from the allow-list", name),
            None => debug!("`{}` is not on the allow-list", name),
        }
        addr
    }

    /// Apply the policy to names that failed resolution.
    ///
    /// Returns the names to bind to the lazy trap (empty in strict mode).
    pub fn check_unresolved(&self, unresolved: Vec<String>) -> Result<Vec<String>, CompileError> {
        if unresolved.is_empty() {
            return Ok(unresolved);
        }

        match self.mode {
            ResolutionMode::Lazy => {
                warn!(
                    "[SymbolResolver] deferring unresolved symbol(s) to execution time: {}",
                    unresolved.join(", ")
                );
                Ok(unresolved)
            }
            ResolutionMode::Strict => {
                error!(
                    "[SymbolResolver] compiled code references symbol(s) outside the allow-list: {}",
                    unresolved.join(", ")
                );
                if self.abort_on_unresolved {
                    error!("[SymbolResolver] aborting");
                    std::process::abort();
                }
                Err(CompileError::UnresolvedSymbols(unresolved))
            }
        }
    }
}

// ============================================================
// Lazy-resolution trap
// ============================================================

thread_local! {
    static UNRESOLVED_CALL: Cell<bool> = const { Cell::new(false) };
}

extern "C" fn unresolved_symbol_trap() -> u64 {
    UNRESOLVED_CALL.with(|c| c.set(true));
    0
}

/// Address every lazily unresolved name is bound to.
pub fn unresolved_trap_address() -> *const u8 {
    unresolved_symbol_trap as *const u8
}

/// Whether compiled code on this thread hit the trap since the last call.
pub fn take_unresolved_call() -> bool {
    UNRESOLVED_CALL.with(|c| c.replace(false))
}

// ============================================================
// Trusted runtime
// ============================================================

mod runtime {
    use std::ptr;

    macro_rules! unary {
        ($ty:ty; $($sym:literal => $name:ident = $method:ident;)*) => {
            $(extern "C" fn $name(x: $ty) -> $ty { x.$method() })*
            pub(super) const FN_TABLE: &[(&str, extern "C" fn($ty) -> $ty)] = &[$(($sym, $name)),*];
        };
    }

    mod f32_unary {
        unary! { f32;
            "sinf" => rt_sinf = sin;
            "cosf" => rt_cosf = cos;
            "tanf" => rt_tanf = tan;
            "asinf" => rt_asinf = asin;
            "acosf" => rt_acosf = acos;
            "atanf" => rt_atanf = atan;
            "sinhf" => rt_sinhf = sinh;
            "coshf" => rt_coshf = cosh;
            "tanhf" => rt_tanhf = tanh;
            "expf" => rt_expf = exp;
            "exp2f" => rt_exp2f = exp2;
            "logf" => rt_logf = ln;
            "log2f" => rt_log2f = log2;
            "log10f" => rt_log10f = log10;
            "sqrtf" => rt_sqrtf = sqrt;
            "fabsf" => rt_fabsf = abs;
            "floorf" => rt_floorf = floor;
            "ceilf" => rt_ceilf = ceil;
            "truncf" => rt_truncf = trunc;
            "roundf" => rt_roundf = round;
            "nearbyintf" => rt_nearbyintf = round_ties_even;
        }
    }

    mod f64_unary {
        unary! { f64;
            "sqrt" => rt_sqrt = sqrt;
            "floor" => rt_floor = floor;
            "ceil" => rt_ceil = ceil;
            "trunc" => rt_trunc = trunc;
            "nearbyint" => rt_nearbyint = round_ties_even;
        }
    }

    extern "C" fn rt_powf(x: f32, y: f32) -> f32 {
        x.powf(y)
    }

    extern "C" fn rt_atan2f(y: f32, x: f32) -> f32 {
        y.atan2(x)
    }

    extern "C" fn rt_fmodf(x: f32, y: f32) -> f32 {
        x % y
    }

    extern "C" fn rt_fminf(x: f32, y: f32) -> f32 {
        x.min(y)
    }

    extern "C" fn rt_fmaxf(x: f32, y: f32) -> f32 {
        x.max(y)
    }

    extern "C" fn rt_fmaf(a: f32, b: f32, c: f32) -> f32 {
        a.mul_add(b, c)
    }

    extern "C" fn rt_fma(a: f64, b: f64, c: f64) -> f64 {
        a.mul_add(b, c)
    }

    unsafe extern "C" fn rt_memcpy(dst: *mut u8, src: *const u8, n: usize) -> *mut u8 {
        ptr::copy_nonoverlapping(src, dst, n);
        dst
    }

    unsafe extern "C" fn rt_memmove(dst: *mut u8, src: *const u8, n: usize) -> *mut u8 {
        ptr::copy(src, dst, n);
        dst
    }

    unsafe extern "C" fn rt_memset(dst: *mut u8, c: i32, n: usize) -> *mut u8 {
        ptr::write_bytes(dst, c as u8, n);
        dst
    }

    unsafe extern "C" fn rt_memcmp(a: *const u8, b: *const u8, n: usize) -> i32 {
        for i in 0..n {
            let (x, y) = (*a.add(i), *b.add(i));
            if x != y {
                return x as i32 - y as i32;
            }
        }
        0
    }

    /// Every trusted runtime symbol and its address.
    pub(super) fn symbols() -> Vec<(&'static str, *const u8)> {
        let mut out: Vec<(&'static str, *const u8)> = Vec::new();
        out.extend(f32_unary::FN_TABLE.iter().map(|&(n, f)| (n, f as *const u8)));
        out.extend(f64_unary::FN_TABLE.iter().map(|&(n, f)| (n, f as *const u8)));
        out.push(("powf", rt_powf as *const u8));
        out.push(("atan2f", rt_atan2f as *const u8));
        out.push(("fmodf", rt_fmodf as *const u8));
        out.push(("fminf", rt_fminf as *const u8));
        out.push(("fmaxf", rt_fmaxf as *const u8));
        out.push(("fmaf", rt_fmaf as *const u8));
        out.push(("fma", rt_fma as *const u8));
        out.push(("memcpy", rt_memcpy as *const u8));
        out.push(("memmove", rt_memmove as *const u8));
        out.push(("memset", rt_memset as *const u8));
        out.push(("memcmp", rt_memcmp as *const u8));
        out
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_allow_list() {
        let resolver = SymbolResolver::with_runtime(ResolutionMode::Strict, false);
        assert!(resolver.is_allowed("sqrtf"));
        assert!(resolver.is_allowed("memcpy"));
        assert!(resolver.resolve("powf").is_some());
        assert!(resolver.resolve("system").is_none());
        assert!(resolver.resolve("fork").is_none());
    }

    #[test]
    fn test_resolved_address_is_trusted_implementation() {
        let resolver = SymbolResolver::with_runtime(ResolutionMode::Strict, false);
        let addr = resolver.resolve("sqrtf").unwrap();
        let f: extern "C" fn(f32) -> f32 = unsafe { std::mem::transmute(addr) };
        assert_eq!(f(16.0), 4.0);
    }

    #[test]
    fn test_allow_custom_symbol() {
        extern "C" fn answer() -> i32 {
            42
        }
        let mut resolver = SymbolResolver::new(ResolutionMode::Strict, false);
        assert!(!resolver.is_allowed("answer"));
        resolver.allow("answer", answer as *const u8);
        assert_eq!(resolver.resolve("answer"), Some(answer as *const u8));
    }

    #[test]
    fn test_strict_rejects_unresolved() {
        let resolver = SymbolResolver::new(ResolutionMode::Strict, false);
        assert!(resolver.check_unresolved(Vec::new()).unwrap().is_empty());
        match resolver.check_unresolved(vec!["system".into()]) {
            Err(CompileError::UnresolvedSymbols(names)) => assert_eq!(names, vec!["system".to_string()]),
            other => panic!("expected UnresolvedSymbols, got {:?}", other),
        }
    }

    #[test]
    fn test_lazy_defers_unresolved() {
        let resolver = SymbolResolver::new(ResolutionMode::Lazy, true);
        let deferred = resolver.check_unresolved(vec!["system".into()]).unwrap();
        assert_eq!(deferred, vec!["system".to_string()]);
    }

    #[test]
    fn test_trap_marks_thread() {
        assert!(!take_unresolved_call());
        let trap: extern "C" fn() -> u64 = unsafe { std::mem::transmute(unresolved_trap_address()) };
        assert_eq!(trap(), 0);
        assert!(take_unresolved_call());
        assert!(!take_unresolved_call());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("Lazy".parse::<ResolutionMode>(), Ok(ResolutionMode::Lazy));
        assert_eq!("strict".parse::<ResolutionMode>(), Ok(ResolutionMode::Strict));
        assert!("maybe".parse::<ResolutionMode>().is_err());
    }
}
