// softcompute-common — pieces shared by the engine, the GL-style context
// and the driver: config variables, errors, logging and the shader ABI.

pub mod common;
pub mod cvar;
pub mod error;
pub mod shader_abi;

pub use error::{CompileError, ErrorClass};
