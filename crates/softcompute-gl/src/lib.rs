//! GL-shaped execution context over the shader engine.
//!
//! Buffers, shaders and programs are addressed by small integer handles; a
//! linked program owns a compiled unit and dispatches run its work groups
//! on the calling thread.

pub mod collab;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod objects;

pub use collab::{Reflection, ResourceInfo, ShaderTranslator, SpirvTranspiler, Transpiled, UniformInfo};
pub use context::SoftGlContext;
pub use dispatch::{execute_workgroups, DispatchStats, ShaderObject};
pub use error::GlError;
pub use objects::{BufferTarget, ShaderKind, MAX_BUFFERS, MAX_PROGRAMS, MAX_SHADERS, MAX_UNIFORMS};
