// collab.rs — external collaborators the context calls but does not implement
//
// Shading-language front ends and SPIR-V transpilers live outside this crate.
// The context reaches them only through these traits.

/// A named block resource in the transpiled code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub name: String,
    pub set: u32,
    pub binding: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformInfo {
    pub name: String,
    pub location: u32,
}

/// What the transpiler learned about the shader's interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reflection {
    pub storage_blocks: Vec<ResourceInfo>,
    pub uniform_blocks: Vec<ResourceInfo>,
    pub uniforms: Vec<UniformInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transpiled {
    /// Procedural source for the compilation backend.
    pub source: String,
    pub reflection: Reflection,
}

/// Shading-language text to SPIR-V words.
pub trait ShaderTranslator: Send {
    fn translate(&self, source: &str) -> Result<Vec<u32>, String>;
}

/// SPIR-V words to procedural source plus reflection.
pub trait SpirvTranspiler: Send {
    fn transpile(&self, words: &[u32]) -> Result<Transpiled, String>;
}
