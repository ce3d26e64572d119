//! Errors reported by the execution context.
//!
//! Every context operation returns `Result<_, GlError>`; a failed call leaves
//! the objects it touched in their prior state unless documented otherwise.

use thiserror::Error;

use softcompute_common::{CompileError, ErrorClass};

use crate::objects::BufferTarget;

#[derive(Error, Debug)]
pub enum GlError {
    /// Handle 0, out of range, or a deleted slot.
    #[error("invalid {kind} handle {handle}")]
    InvalidHandle { kind: &'static str, handle: u32 },

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("out of {0} handles")]
    OutOfHandles(&'static str),

    #[error("program {program} has {count} attached shader(s), linking needs exactly one")]
    AttachmentCount { program: u32, count: usize },

    #[error("range {offset}+{size} exceeds buffer {buffer} ({len} bytes)")]
    RangeOutOfBounds {
        buffer: u32,
        offset: usize,
        size: usize,
        len: usize,
    },

    #[error("no {0} installed")]
    MissingCollaborator(&'static str),

    /// A translator or transpiler rejected its input.
    #[error("{0}")]
    Collaborator(String),

    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Binding was valid when made but its buffer shrank or went away.
    #[error("{target} binding {index} no longer fits buffer {buffer}")]
    StaleBinding {
        target: BufferTarget,
        index: u32,
        buffer: u32,
    },

    /// Compiled code called a lazily unresolved symbol.
    #[error("work group ({x}, {y}) called unresolved symbol(s): {}", .names.join(", "))]
    UnresolvedAtRuntime { names: Vec<String>, x: u32, y: u32 },
}

impl GlError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GlError::Compile(e) => e.class(),
            GlError::Collaborator(_) => ErrorClass::Compile,
            GlError::UnresolvedAtRuntime { .. } => ErrorClass::SymbolResolution,
            GlError::InvalidHandle { .. }
            | GlError::InvalidValue(_)
            | GlError::InvalidOperation(_)
            | GlError::OutOfHandles(_)
            | GlError::AttachmentCount { .. }
            | GlError::RangeOutOfBounds { .. }
            | GlError::MissingCollaborator(_)
            | GlError::StaleBinding { .. } => ErrorClass::Usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        assert_eq!(GlError::AttachmentCount { program: 1, count: 2 }.class(), ErrorClass::Usage);
        assert_eq!(
            GlError::Compile(CompileError::UnresolvedSymbols(vec!["system".into()])).class(),
            ErrorClass::SymbolResolution
        );
        assert_eq!(
            GlError::UnresolvedAtRuntime { names: vec![], x: 0, y: 0 }.class(),
            ErrorClass::SymbolResolution
        );
    }

    #[test]
    fn test_messages() {
        let e = GlError::RangeOutOfBounds { buffer: 3, offset: 60, size: 8, len: 64 };
        assert_eq!(e.to_string(), "range 60+8 exceeds buffer 3 (64 bytes)");
        let e = GlError::StaleBinding { target: BufferTarget::ShaderStorage, index: 2, buffer: 1 };
        assert_eq!(e.to_string(), "shader storage binding 2 no longer fits buffer 1");
    }
}
