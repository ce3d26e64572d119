// objects.rs — handle pools and the objects they hold
//
// Pools have a fixed number of slots. Slot 0 is reserved so that handle 0 can
// mean "none". Allocation scans for the first free slot, O(n) in the pool
// size; deleting leaves an empty slot behind that the next allocation reuses.

use std::collections::HashMap;
use std::fmt;

use crate::collab::Reflection;
use crate::dispatch::ShaderObject;

pub const MAX_BUFFERS: usize = 64;
pub const MAX_PROGRAMS: usize = 64;
pub const MAX_SHADERS: usize = 64;
pub const MAX_UNIFORMS: usize = 64;

// ============================================================
// SlotPool
// ============================================================

#[derive(Debug)]
pub struct SlotPool<T> {
    /// `None` marks a free slot. Index 0 is never handed out.
    slots: Vec<Option<T>>,
}

impl<T> SlotPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..=capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Store `value` in the first free slot and return its handle.
    pub fn alloc(&mut self, value: T) -> Option<u32> {
        let index = self.slots.iter().skip(1).position(Option::is_none)? + 1;
        self.slots[index] = Some(value);
        Some(index as u32)
    }

    pub fn get(&self, handle: u32) -> Option<&T> {
        match handle {
            0 => None,
            h => self.slots.get(h as usize)?.as_ref(),
        }
    }

    pub fn get_mut(&mut self, handle: u32) -> Option<&mut T> {
        match handle {
            0 => None,
            h => self.slots.get_mut(h as usize)?.as_mut(),
        }
    }

    pub fn is_live(&self, handle: u32) -> bool {
        self.get(handle).is_some()
    }

    pub fn free(&mut self, handle: u32) -> Option<T> {
        match handle {
            0 => None,
            h => self.slots.get_mut(h as usize)?.take(),
        }
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

// ============================================================
// Buffers and bindings
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferTarget {
    ShaderStorage,
    Uniform,
}

impl fmt::Display for BufferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferTarget::ShaderStorage => f.write_str("shader storage"),
            BufferTarget::Uniform => f.write_str("uniform"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Buffer {
    pub data: Vec<u8>,
    pub mapped: bool,
}

/// A bound sub-range of a buffer. `offset + size` fit the buffer when bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accessor {
    pub buffer: u32,
    pub offset: usize,
    pub size: usize,
    pub bound: bool,
}

// ============================================================
// Shaders
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderKind {
    Compute,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ShaderInput {
    #[default]
    None,
    Source(String),
    /// SPIR-V words
    Binary(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompiledShader {
    /// Source already lowered to procedural form.
    Procedural(String),
    Spirv(Vec<u32>),
}

#[derive(Debug)]
pub struct Shader {
    pub kind: ShaderKind,
    pub input: ShaderInput,
    pub compiled: Option<CompiledShader>,
    pub info_log: String,
}

impl Shader {
    pub fn new(kind: ShaderKind) -> Self {
        Self {
            kind,
            input: ShaderInput::None,
            compiled: None,
            info_log: String::new(),
        }
    }
}

// ============================================================
// Programs
// ============================================================

#[derive(Default)]
pub struct Program {
    pub shaders: Vec<u32>,
    pub linked: bool,
    /// The native shader object, present once linked.
    pub object: Option<ShaderObject>,
    pub reflection: Reflection,
    /// storage block index -> binding point
    pub storage_block_bindings: HashMap<u32, u32>,
    pub info_log: String,
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("shaders", &self.shaders)
            .field("linked", &self.linked)
            .field("reflection", &self.reflection)
            .finish()
    }
}
