// shader_abi.rs — C-compatible types for the compiled shader interface
//
// Compiled shader code, whichever backend produced it, exports one C-linkage
// function taking a pointer to a ShaderFrame. The frame carries the builtin
// block and the resource tables. Binary layout must stay stable: code
// generated from IR text addresses these fields by byte offset.

use std::ffi::c_void;
use std::ptr::{self, NonNull};

use bytemuck::{Pod, Zeroable};

// ============================================================
// Constants
// ============================================================

/// Symbol looked up in compiled code when no other name is configured.
pub const ENTRY_SYMBOL: &str = "softcompute_main";

/// Byte offsets of the frame fields, for hand-written IR and for tests.
pub const FRAME_NUM_WORK_GROUPS_OFFSET: usize = 0;
pub const FRAME_WORK_GROUP_ID_OFFSET: usize = 12;
pub const FRAME_STORAGE_BUFFERS_OFFSET: usize = 24;
pub const FRAME_UNIFORM_BUFFERS_OFFSET: usize = 40;
pub const FRAME_UNIFORMS_OFFSET: usize = 56;
pub const FRAME_SIZE: usize = 72;

/// UniformValue::kind
pub const UNIFORM_KIND_NONE: u32 = 0;
pub const UNIFORM_KIND_FLOAT: u32 = 1;
pub const UNIFORM_KIND_INT: u32 = 2;

// ============================================================
// Resource tables
// ============================================================

/// One bound buffer range as seen by compiled code.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ResourceBinding {
    pub data: *mut u8,
    pub size: u64,
    pub set: u32,
    pub binding: u32,
}

impl Default for ResourceBinding {
    fn default() -> Self {
        Self {
            data: ptr::null_mut(),
            size: 0,
            set: 0,
            binding: 0,
        }
    }
}

/// Dense table of bindings: entry `i` is binding `i`, unbound entries are null.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ResourceTable {
    pub bindings: *const ResourceBinding,
    pub count: u32,
    pub reserved: u32,
}

impl Default for ResourceTable {
    fn default() -> Self {
        Self {
            bindings: ptr::null(),
            count: 0,
            reserved: 0,
        }
    }
}

impl ResourceTable {
    pub fn from_slice(bindings: &[ResourceBinding]) -> Self {
        Self {
            bindings: if bindings.is_empty() { ptr::null() } else { bindings.as_ptr() },
            count: bindings.len() as u32,
            reserved: 0,
        }
    }
}

/// A float4-or-int4 uniform slot. `bits` holds the raw 32-bit lanes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct UniformValue {
    pub bits: [u32; 4],
    pub kind: u32,
    pub count: u32,
}

impl UniformValue {
    /// 1 to 4 float lanes; extra lanes are ignored.
    pub fn from_floats(values: &[f32]) -> Self {
        let mut bits = [0u32; 4];
        for (dst, v) in bits.iter_mut().zip(values) {
            *dst = v.to_bits();
        }
        Self {
            bits,
            kind: UNIFORM_KIND_FLOAT,
            count: values.len().min(4) as u32,
        }
    }

    /// 1 to 4 int lanes; extra lanes are ignored.
    pub fn from_ints(values: &[i32]) -> Self {
        let mut bits = [0u32; 4];
        for (dst, v) in bits.iter_mut().zip(values) {
            *dst = *v as u32;
        }
        Self {
            bits,
            kind: UNIFORM_KIND_INT,
            count: values.len().min(4) as u32,
        }
    }

    pub fn as_floats(&self) -> [f32; 4] {
        self.bits.map(f32::from_bits)
    }

    pub fn as_ints(&self) -> [i32; 4] {
        self.bits.map(|b| b as i32)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UniformTable {
    pub values: *const UniformValue,
    pub count: u32,
    pub reserved: u32,
}

impl Default for UniformTable {
    fn default() -> Self {
        Self {
            values: ptr::null(),
            count: 0,
            reserved: 0,
        }
    }
}

// ============================================================
// Frame
// ============================================================

/// Everything one workgroup invocation can see.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ShaderFrame {
    pub num_work_groups: [u32; 3],
    pub work_group_id: [u32; 3],
    pub storage_buffers: ResourceTable,
    pub uniform_buffers: ResourceTable,
    pub uniforms: UniformTable,
}

/// Compiled entry: `void softcompute_main(ShaderFrame *frame)`.
pub type ShaderMainFn = unsafe extern "C" fn(frame: *mut ShaderFrame);

// ============================================================
// Entry point
// ============================================================

/// Non-null address of a compiled entry point.
///
/// Only meaningful while the unit that produced it is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint(NonNull<c_void>);

// The address is immutable code; ownership of the code stays with the unit.
unsafe impl Send for EntryPoint {}
unsafe impl Sync for EntryPoint {}

impl EntryPoint {
    /// Wrap a raw address, rejecting null.
    pub fn new(ptr: *const c_void) -> Option<Self> {
        NonNull::new(ptr as *mut c_void).map(Self)
    }

    /// Entry point for code already written in Rust against this ABI.
    pub fn from_fn(f: ShaderMainFn) -> Self {
        // Function pointers are never null.
        Self(unsafe { NonNull::new_unchecked(f as *const () as *mut c_void) })
    }

    pub fn as_ptr(self) -> *const c_void {
        self.0.as_ptr()
    }
}

/// The ABI crossing: reinterpret a compiled entry address as the shader main
/// function. Every call into compiled code goes through here.
///
/// # Safety
/// `entry` must point at code following `ShaderMainFn`'s signature and the
/// unit that owns it must outlive every call made through the result.
pub unsafe fn shader_main(entry: EntryPoint) -> ShaderMainFn {
    std::mem::transmute::<*const c_void, ShaderMainFn>(entry.as_ptr())
}

// ============================================================
// Tests
// ============================================================
