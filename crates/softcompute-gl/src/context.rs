// context.rs — SoftGlContext, a GL-shaped container for compute state
//
// Buffers, shaders and programs live in fixed handle pools; accessors bind
// buffer ranges to storage and uniform binding points. The active buffer and
// active program follow the GL bind-then-act idiom. A context has no internal
// locking: one caller drives it, others use their own context or serialize
// access externally.

use std::path::PathBuf;

use log::{debug, error, info, warn};

use softcompute_common::shader_abi::{
    ResourceBinding, ResourceTable, UniformTable, UniformValue,
};
use softcompute_common::CompileError;
use softcompute_engine::{EngineConfig, ShaderEngine, ShaderSource, COMPUTE_SHADER_TYPE};

use crate::collab::{ShaderTranslator, SpirvTranspiler};
use crate::dispatch::{execute_workgroups, DispatchStats, ShaderObject};
use crate::error::GlError;
use crate::objects::{
    Accessor, Buffer, BufferTarget, CompiledShader, Program, Shader, ShaderInput, ShaderKind,
    SlotPool, MAX_BUFFERS, MAX_PROGRAMS, MAX_SHADERS, MAX_UNIFORMS,
};

pub struct SoftGlContext {
    engine: ShaderEngine,
    compiler_options: String,
    search_paths: Vec<PathBuf>,
    translator: Option<Box<dyn ShaderTranslator>>,
    transpiler: Option<Box<dyn SpirvTranspiler>>,

    buffers: SlotPool<Buffer>,
    programs: SlotPool<Program>,
    shaders: SlotPool<Shader>,

    /// Indexed by binding point, 0..=MAX_BUFFERS.
    storage_accessors: Vec<Accessor>,
    uniform_accessors: Vec<Accessor>,
    uniforms: Vec<UniformValue>,

    active_buffer: u32,
    active_program: u32,
}

impl SoftGlContext {
    pub fn new(engine: ShaderEngine) -> Self {
        Self {
            engine,
            compiler_options: String::new(),
            search_paths: Vec::new(),
            translator: None,
            transpiler: None,
            buffers: SlotPool::new(MAX_BUFFERS),
            programs: SlotPool::new(MAX_PROGRAMS),
            shaders: SlotPool::new(MAX_SHADERS),
            storage_accessors: vec![Accessor::default(); MAX_BUFFERS + 1],
            uniform_accessors: vec![Accessor::default(); MAX_BUFFERS + 1],
            uniforms: vec![UniformValue::default(); MAX_UNIFORMS],
            active_buffer: 0,
            active_program: 0,
        }
    }

    /// Context over an engine built from `config`, with its options and
    /// search paths.
    pub fn from_config(config: &EngineConfig) -> Result<Self, CompileError> {
        let mut ctx = Self::new(ShaderEngine::new(config)?);
        ctx.compiler_options = config.compiler_options.clone();
        ctx.search_paths = config.search_paths.clone();
        Ok(ctx)
    }

    pub fn with_translator(mut self, translator: Box<dyn ShaderTranslator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn with_transpiler(mut self, transpiler: Box<dyn SpirvTranspiler>) -> Self {
        self.transpiler = Some(transpiler);
        self
    }

    pub fn engine(&self) -> &ShaderEngine {
        &self.engine
    }

    pub fn set_jit_compiler_options(&mut self, options: &str) {
        debug!("[SoftGL] compiler options: {}", options);
        self.compiler_options = options.to_string();
    }

    pub fn set_search_paths(&mut self, paths: Vec<PathBuf>) {
        self.search_paths = paths;
    }

    /// Log a failure and hand it back.
    fn fail<T>(&self, err: GlError) -> Result<T, GlError> {
        error!("[SoftGL] {}", err);
        Err(err)
    }

    // ============================================================
    // Buffers
    // ============================================================

    pub fn gen_buffers(&mut self, n: usize) -> Result<Vec<u32>, GlError> {
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            match self.buffers.alloc(Buffer::default()) {
                Some(id) => ids.push(id),
                None => {
                    for id in ids {
                        self.buffers.free(id);
                    }
                    return self.fail(GlError::OutOfHandles("buffer"));
                }
            }
        }
        Ok(ids)
    }

    /// Delete buffers; accessors into them are unbound. Handle 0 and unknown
    /// handles are skipped.
    pub fn delete_buffers(&mut self, ids: &[u32]) {
        for &id in ids {
            if self.buffers.free(id).is_none() {
                continue;
            }
            for acc in self.storage_accessors.iter_mut().chain(self.uniform_accessors.iter_mut()) {
                if acc.bound && acc.buffer == id {
                    *acc = Accessor::default();
                }
            }
            if self.active_buffer == id {
                self.active_buffer = 0;
            }
        }
    }

    /// Select the buffer later data calls act on; 0 clears the selection.
    pub fn bind_buffer(&mut self, target: BufferTarget, id: u32) -> Result<(), GlError> {
        if id != 0 && !self.buffers.is_live(id) {
            return self.fail(GlError::InvalidHandle { kind: "buffer", handle: id });
        }
        debug!("[SoftGL] bind {} buffer {}", target, id);
        self.active_buffer = id;
        Ok(())
    }

    fn active_buffer_mut(&mut self, target: BufferTarget) -> Result<(u32, &mut Buffer), GlError> {
        let id = self.active_buffer;
        match self.buffers.get_mut(id) {
            Some(buffer) => Ok((id, buffer)),
            None => {
                let err = GlError::InvalidOperation(format!("no {} buffer bound", target));
                error!("[SoftGL] {}", err);
                Err(err)
            }
        }
    }

    /// Resize the active buffer to `size` bytes, filled from `data` or zeroed.
    pub fn buffer_data(&mut self, target: BufferTarget, size: usize, data: Option<&[u8]>) -> Result<(), GlError> {
        if let Some(d) = data {
            if d.len() != size {
                return self.fail(GlError::InvalidValue(format!(
                    "buffer data is {} bytes, size says {}",
                    d.len(),
                    size
                )));
            }
        }
        let (id, buffer) = self.active_buffer_mut(target)?;
        if buffer.mapped {
            return self.fail(GlError::InvalidOperation(format!("buffer {} is mapped", id)));
        }
        buffer.data.clear();
        match data {
            Some(d) => buffer.data.extend_from_slice(d),
            None => buffer.data.resize(size, 0),
        }
        Ok(())
    }

    pub fn buffer_sub_data(&mut self, target: BufferTarget, offset: usize, data: &[u8]) -> Result<(), GlError> {
        let (id, buffer) = self.active_buffer_mut(target)?;
        let len = buffer.data.len();
        match offset.checked_add(data.len()) {
            Some(end) if end <= len => {
                buffer.data[offset..end].copy_from_slice(data);
                Ok(())
            }
            _ => self.fail(GlError::RangeOutOfBounds { buffer: id, offset, size: data.len(), len }),
        }
    }

    pub fn get_buffer_sub_data(&mut self, target: BufferTarget, offset: usize, out: &mut [u8]) -> Result<(), GlError> {
        let (id, buffer) = self.active_buffer_mut(target)?;
        let len = buffer.data.len();
        match offset.checked_add(out.len()) {
            Some(end) if end <= len => {
                out.copy_from_slice(&buffer.data[offset..end]);
                Ok(())
            }
            _ => self.fail(GlError::RangeOutOfBounds { buffer: id, offset, size: out.len(), len }),
        }
    }

    /// Direct access to the active buffer's bytes until `unmap_buffer`.
    pub fn map_buffer(&mut self, target: BufferTarget) -> Result<&mut [u8], GlError> {
        let (id, buffer) = self.active_buffer_mut(target)?;
        if buffer.mapped {
            let err = GlError::InvalidOperation(format!("buffer {} is already mapped", id));
            error!("[SoftGL] {}", err);
            return Err(err);
        }
        buffer.mapped = true;
        Ok(buffer.data.as_mut_slice())
    }

    /// False if the buffer was not mapped.
    pub fn unmap_buffer(&mut self, target: BufferTarget) -> Result<bool, GlError> {
        let (_, buffer) = self.active_buffer_mut(target)?;
        Ok(std::mem::replace(&mut buffer.mapped, false))
    }

    // ============================================================
    // Binding points
    // ============================================================

    fn accessors_mut(&mut self, target: BufferTarget) -> &mut Vec<Accessor> {
        match target {
            BufferTarget::ShaderStorage => &mut self.storage_accessors,
            BufferTarget::Uniform => &mut self.uniform_accessors,
        }
    }

    pub fn accessor(&self, target: BufferTarget, index: u32) -> Option<Accessor> {
        let table = match target {
            BufferTarget::ShaderStorage => &self.storage_accessors,
            BufferTarget::Uniform => &self.uniform_accessors,
        };
        table.get(index as usize).copied()
    }

    /// Bind `size` bytes of `buffer` at `offset` to binding point `index`.
    /// A range past the end of the buffer is rejected with nothing changed.
    /// Buffer 0 unbinds the point.
    pub fn bind_buffer_range(
        &mut self,
        target: BufferTarget,
        index: u32,
        buffer: u32,
        offset: usize,
        size: usize,
    ) -> Result<(), GlError> {
        if index as usize > MAX_BUFFERS {
            return self.fail(GlError::InvalidValue(format!(
                "binding point {} exceeds {}",
                index, MAX_BUFFERS
            )));
        }
        if buffer == 0 {
            self.accessors_mut(target)[index as usize] = Accessor::default();
            return Ok(());
        }

        let len = match self.buffers.get(buffer) {
            Some(b) => b.data.len(),
            None => return self.fail(GlError::InvalidHandle { kind: "buffer", handle: buffer }),
        };
        match offset.checked_add(size) {
            Some(end) if end <= len => {}
            _ => return self.fail(GlError::RangeOutOfBounds { buffer, offset, size, len }),
        }

        self.accessors_mut(target)[index as usize] = Accessor {
            buffer,
            offset,
            size,
            bound: true,
        };
        debug!("[SoftGL] {} binding {} -> buffer {} [{}+{}]", target, index, buffer, offset, size);
        Ok(())
    }

    /// Bind the whole buffer as it is now.
    pub fn bind_buffer_base(&mut self, target: BufferTarget, index: u32, buffer: u32) -> Result<(), GlError> {
        let size = self.buffers.get(buffer).map_or(0, |b| b.data.len());
        self.bind_buffer_range(target, index, buffer, 0, size)
    }

    // ============================================================
    // Uniforms
    // ============================================================

    fn set_uniform(&mut self, location: i32, value: UniformValue) -> Result<(), GlError> {
        if location < 0 {
            return Ok(());
        }
        match self.uniforms.get_mut(location as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => self.fail(GlError::InvalidValue(format!(
                "uniform location {} exceeds {}",
                location,
                MAX_UNIFORMS - 1
            ))),
        }
    }

    pub fn uniform1f(&mut self, location: i32, v0: f32) -> Result<(), GlError> {
        self.set_uniform(location, UniformValue::from_floats(&[v0]))
    }

    pub fn uniform2f(&mut self, location: i32, v0: f32, v1: f32) -> Result<(), GlError> {
        self.set_uniform(location, UniformValue::from_floats(&[v0, v1]))
    }

    pub fn uniform3f(&mut self, location: i32, v0: f32, v1: f32, v2: f32) -> Result<(), GlError> {
        self.set_uniform(location, UniformValue::from_floats(&[v0, v1, v2]))
    }

    pub fn uniform4f(&mut self, location: i32, v0: f32, v1: f32, v2: f32, v3: f32) -> Result<(), GlError> {
        self.set_uniform(location, UniformValue::from_floats(&[v0, v1, v2, v3]))
    }

    pub fn uniform1i(&mut self, location: i32, v0: i32) -> Result<(), GlError> {
        self.set_uniform(location, UniformValue::from_ints(&[v0]))
    }

    pub fn uniform2i(&mut self, location: i32, v0: i32, v1: i32) -> Result<(), GlError> {
        self.set_uniform(location, UniformValue::from_ints(&[v0, v1]))
    }

    pub fn uniform3i(&mut self, location: i32, v0: i32, v1: i32, v2: i32) -> Result<(), GlError> {
        self.set_uniform(location, UniformValue::from_ints(&[v0, v1, v2]))
    }

    pub fn uniform4i(&mut self, location: i32, v0: i32, v1: i32, v2: i32, v3: i32) -> Result<(), GlError> {
        self.set_uniform(location, UniformValue::from_ints(&[v0, v1, v2, v3]))
    }

    pub fn uniform(&self, location: u32) -> Option<UniformValue> {
        self.uniforms.get(location as usize).copied()
    }

    // ============================================================
    // Shaders
    // ============================================================

    pub fn create_shader(&mut self, kind: ShaderKind) -> Result<u32, GlError> {
        match self.shaders.alloc(Shader::new(kind)) {
            Some(id) => Ok(id),
            None => self.fail(GlError::OutOfHandles("shader")),
        }
    }

    fn shader_mut(&mut self, id: u32) -> Result<&mut Shader, GlError> {
        match self.shaders.get_mut(id) {
            Some(shader) => Ok(shader),
            None => {
                let err = GlError::InvalidHandle { kind: "shader", handle: id };
                error!("[SoftGL] {}", err);
                Err(err)
            }
        }
    }

    /// Replace the shader's input with the concatenation of `parts`.
    pub fn shader_source(&mut self, id: u32, parts: &[&str]) -> Result<(), GlError> {
        let shader = self.shader_mut(id)?;
        shader.input = ShaderInput::Source(parts.concat());
        shader.compiled = None;
        Ok(())
    }

    /// Replace the shader's input with a SPIR-V binary. The byte length must
    /// be a non-zero multiple of 4.
    pub fn shader_binary(&mut self, id: u32, binary: &[u8]) -> Result<(), GlError> {
        if binary.is_empty() || binary.len() % 4 != 0 {
            return self.fail(GlError::InvalidValue(format!(
                "SPIR-V binary length {} is not a multiple of 4",
                binary.len()
            )));
        }
        let words: Vec<u32> = bytemuck::pod_collect_to_vec(binary);
        let shader = self.shader_mut(id)?;
        shader.input = ShaderInput::Binary(words);
        shader.compiled = None;
        Ok(())
    }

    /// Binary input is already compiled. Source goes through the translator
    /// when one is installed and is otherwise taken as procedural source.
    pub fn compile_shader(&mut self, id: u32) -> Result<(), GlError> {
        let input = self.shader_mut(id)?.input.clone();
        let result = match input {
            ShaderInput::None => Err(GlError::InvalidOperation(format!(
                "shader {} has neither source nor binary",
                id
            ))),
            ShaderInput::Binary(words) => Ok(CompiledShader::Spirv(words)),
            ShaderInput::Source(text) => match &self.translator {
                Some(translator) => translator
                    .translate(&text)
                    .map(CompiledShader::Spirv)
                    .map_err(GlError::Collaborator),
                None => Ok(CompiledShader::Procedural(text)),
            },
        };

        let shader = self.shader_mut(id)?;
        match result {
            Ok(compiled) => {
                shader.compiled = Some(compiled);
                shader.info_log.clear();
                Ok(())
            }
            Err(e) => {
                shader.compiled = None;
                shader.info_log = e.to_string();
                warn!("[SoftGL] shader {}: {}", id, e);
                Err(e)
            }
        }
    }

    pub fn shader_compile_status(&self, id: u32) -> bool {
        self.shaders.get(id).is_some_and(|s| s.compiled.is_some())
    }

    pub fn shader_info_log(&self, id: u32) -> Option<&str> {
        self.shaders.get(id).map(|s| s.info_log.as_str())
    }

    pub fn delete_shader(&mut self, id: u32) {
        if self.shaders.free(id).is_some() {
            debug!("[SoftGL] deleted shader {}", id);
        }
    }

    // ============================================================
    // Programs
    // ============================================================

    pub fn create_program(&mut self) -> Result<u32, GlError> {
        match self.programs.alloc(Program::default()) {
            Some(id) => Ok(id),
            None => self.fail(GlError::OutOfHandles("program")),
        }
    }

    fn program(&self, id: u32) -> Result<&Program, GlError> {
        self.programs.get(id).ok_or_else(|| {
            let err = GlError::InvalidHandle { kind: "program", handle: id };
            error!("[SoftGL] {}", err);
            err
        })
    }

    fn program_mut(&mut self, id: u32) -> Result<&mut Program, GlError> {
        match self.programs.get_mut(id) {
            Some(p) => Ok(p),
            None => {
                let err = GlError::InvalidHandle { kind: "program", handle: id };
                error!("[SoftGL] {}", err);
                Err(err)
            }
        }
    }

    pub fn attach_shader(&mut self, program: u32, shader: u32) -> Result<(), GlError> {
        if !self.shaders.is_live(shader) {
            return self.fail(GlError::InvalidHandle { kind: "shader", handle: shader });
        }
        let prog = self.program_mut(program)?;
        if prog.linked {
            return self.fail(GlError::InvalidOperation(format!("program {} is already linked", program)));
        }
        if prog.shaders.contains(&shader) {
            return self.fail(GlError::InvalidOperation(format!(
                "shader {} is already attached to program {}",
                shader, program
            )));
        }
        prog.shaders.push(shader);
        Ok(())
    }

    /// Compile the program's single shader into a unit registered under the
    /// program handle, and build its shader object.
    pub fn link_program(&mut self, id: u32) -> Result<(), GlError> {
        let result = self.link_program_inner(id);
        if let Err(e) = &result {
            error!("[SoftGL] link program {}: {}", id, e);
            if let Some(prog) = self.programs.get_mut(id) {
                prog.info_log = e.to_string();
            }
        }
        result
    }

    fn link_program_inner(&mut self, id: u32) -> Result<(), GlError> {
        let prog = self
            .programs
            .get(id)
            .ok_or(GlError::InvalidHandle { kind: "program", handle: id })?;
        if prog.linked {
            return Err(GlError::InvalidOperation(format!("program {} is already linked", id)));
        }
        if prog.shaders.len() != 1 {
            return Err(GlError::AttachmentCount { program: id, count: prog.shaders.len() });
        }

        let shader_id = prog.shaders[0];
        let shader = self
            .shaders
            .get(shader_id)
            .ok_or(GlError::InvalidHandle { kind: "shader", handle: shader_id })?;
        let (source, reflection) = match &shader.compiled {
            None => {
                return Err(GlError::InvalidOperation(format!("shader {} is not compiled", shader_id)))
            }
            Some(CompiledShader::Procedural(text)) => (text.clone(), Default::default()),
            Some(CompiledShader::Spirv(words)) => {
                let transpiler = self
                    .transpiler
                    .as_ref()
                    .ok_or(GlError::MissingCollaborator("SPIR-V transpiler"))?;
                let out = transpiler.transpile(words).map_err(GlError::Collaborator)?;
                (out.source, out.reflection)
            }
        };

        let instance = self.engine.compile(
            COMPUTE_SHADER_TYPE,
            id,
            &self.search_paths,
            &self.compiler_options,
            &ShaderSource::Text(source),
        )?;

        let prog = self
            .programs
            .get_mut(id)
            .ok_or(GlError::InvalidHandle { kind: "program", handle: id })?;
        prog.object = Some(ShaderObject::new(instance));
        prog.reflection = reflection;
        prog.linked = true;
        prog.info_log.clear();
        info!("[SoftGL] linked program {}", id);
        Ok(())
    }

    pub fn program_link_status(&self, id: u32) -> bool {
        self.programs.get(id).is_some_and(|p| p.linked)
    }

    pub fn program_info_log(&self, id: u32) -> Option<&str> {
        self.programs.get(id).map(|p| p.info_log.as_str())
    }

    /// Select the program dispatches run; 0 clears the selection.
    pub fn use_program(&mut self, id: u32) -> Result<(), GlError> {
        if id != 0 && !self.programs.is_live(id) {
            return self.fail(GlError::InvalidHandle { kind: "program", handle: id });
        }
        self.active_program = id;
        Ok(())
    }

    /// Delete the program and release its compiled unit.
    pub fn delete_program(&mut self, id: u32) {
        let Some(prog) = self.programs.free(id) else { return };
        if prog.linked {
            self.engine.remove(id);
        }
        if self.active_program == id {
            self.active_program = 0;
        }
        drop(prog);
        debug!("[SoftGL] deleted program {}", id);
    }

    /// Index of the named shader storage block.
    pub fn get_program_resource_index(&self, program: u32, name: &str) -> Result<Option<u32>, GlError> {
        let prog = self.program(program)?;
        Ok(prog
            .reflection
            .storage_blocks
            .iter()
            .position(|b| b.name == name)
            .map(|i| i as u32))
    }

    pub fn get_uniform_block_index(&self, program: u32, name: &str) -> Result<Option<u32>, GlError> {
        let prog = self.program(program)?;
        Ok(prog
            .reflection
            .uniform_blocks
            .iter()
            .position(|b| b.name == name)
            .map(|i| i as u32))
    }

    /// Location of the named uniform, or -1.
    pub fn get_uniform_location(&self, program: u32, name: &str) -> Result<i32, GlError> {
        let prog = self.program(program)?;
        Ok(prog
            .reflection
            .uniforms
            .iter()
            .find(|u| u.name == name)
            .map_or(-1, |u| u.location as i32))
    }

    /// Make storage block `block_index` read binding point `binding`.
    pub fn shader_storage_block_binding(&mut self, program: u32, block_index: u32, binding: u32) -> Result<(), GlError> {
        if binding as usize > MAX_BUFFERS {
            return self.fail(GlError::InvalidValue(format!("binding point {} exceeds {}", binding, MAX_BUFFERS)));
        }
        let prog = self.program_mut(program)?;
        if block_index as usize >= prog.reflection.storage_blocks.len() {
            return self.fail(GlError::InvalidValue(format!(
                "program {} has no storage block {}",
                program, block_index
            )));
        }
        prog.storage_block_bindings.insert(block_index, binding);
        Ok(())
    }

    // ============================================================
    // Dispatch
    // ============================================================

    pub fn dispatch_compute(&mut self, num_x: u32, num_y: u32, num_z: u32) -> Result<DispatchStats, GlError> {
        if num_z != 1 {
            return self.fail(GlError::InvalidValue(format!("num_groups_z must be 1, got {}", num_z)));
        }
        let id = self.active_program;
        if id == 0 {
            return self.fail(GlError::InvalidOperation("no active program".to_string()));
        }

        let prog = match self.programs.get_mut(id) {
            Some(p) if p.linked => p,
            _ => {
                let err = GlError::InvalidOperation(format!("program {} is not linked", id));
                error!("[SoftGL] {}", err);
                return Err(err);
            }
        };

        let mut storage = resource_bindings(&mut self.buffers, BufferTarget::ShaderStorage, &self.storage_accessors)?;
        for (&block, &point) in &prog.storage_block_bindings {
            let Some(info) = prog.reflection.storage_blocks.get(block as usize) else { continue };
            let slot = info.binding as usize;
            if storage.len() <= slot {
                storage.resize(slot + 1, ResourceBinding::default());
            }
            let acc = self.storage_accessors[point as usize];
            storage[slot] = materialize(&mut self.buffers, BufferTarget::ShaderStorage, point, &acc)?;
            storage[slot].set = info.set;
            storage[slot].binding = info.binding;
        }
        let uniform_buffers = resource_bindings(&mut self.buffers, BufferTarget::Uniform, &self.uniform_accessors)?;

        let Some(object) = prog.object.as_mut() else {
            let err = GlError::InvalidOperation(format!("program {} has no shader object", id));
            error!("[SoftGL] {}", err);
            return Err(err);
        };
        let instance = std::sync::Arc::clone(object.instance());
        let frame = object.frame_mut();
        frame.storage_buffers = ResourceTable::from_slice(&storage);
        frame.uniform_buffers = ResourceTable::from_slice(&uniform_buffers);
        frame.uniforms = UniformTable {
            values: self.uniforms.as_ptr(),
            count: self.uniforms.len() as u32,
            reserved: 0,
        };

        // The tables point into `storage`, `uniform_buffers` and the context's
        // buffers, all of which outlive the call.
        let result = unsafe {
            execute_workgroups(
                instance.entry_point(),
                frame,
                [num_x, num_y, num_z],
                instance.unresolved_symbols(),
            )
        };

        frame.storage_buffers = ResourceTable::default();
        frame.uniform_buffers = ResourceTable::default();
        frame.uniforms = UniformTable::default();

        if let Err(e) = &result {
            error!("[SoftGL] dispatch: {}", e);
        }
        result
    }

    /// Dispatch with the group counts stored as three `u32` at `offset` in
    /// the active buffer.
    pub fn dispatch_compute_indirect(&mut self, offset: usize) -> Result<DispatchStats, GlError> {
        if offset % 4 != 0 {
            return self.fail(GlError::InvalidValue(format!("indirect offset {} is not 4-byte aligned", offset)));
        }
        let mut counts = [0u8; 12];
        self.get_buffer_sub_data(BufferTarget::ShaderStorage, offset, &mut counts)?;
        let [x, y, z]: [u32; 3] = bytemuck::pod_read_unaligned(&counts);
        self.dispatch_compute(x, y, z)
    }
}

/// Dense binding table, entry `i` for binding point `i`.
fn resource_bindings(
    buffers: &mut SlotPool<Buffer>,
    target: BufferTarget,
    accessors: &[Accessor],
) -> Result<Vec<ResourceBinding>, GlError> {
    let Some(last) = accessors.iter().rposition(|a| a.bound) else {
        return Ok(Vec::new());
    };
    accessors[..=last]
        .iter()
        .enumerate()
        .map(|(i, acc)| materialize(buffers, target, i as u32, acc))
        .collect()
}

fn materialize(
    buffers: &mut SlotPool<Buffer>,
    target: BufferTarget,
    index: u32,
    acc: &Accessor,
) -> Result<ResourceBinding, GlError> {
    if !acc.bound {
        return Ok(ResourceBinding {
            binding: index,
            ..Default::default()
        });
    }
    let stale = GlError::StaleBinding { target, index, buffer: acc.buffer };
    let buffer = buffers.get_mut(acc.buffer).ok_or(stale)?;
    let range = acc.offset..acc.offset + acc.size;
    let bytes = buffer.data.get_mut(range).ok_or(GlError::StaleBinding {
        target,
        index,
        buffer: acc.buffer,
    })?;
    Ok(ResourceBinding {
        data: bytes.as_mut_ptr(),
        size: acc.size as u64,
        set: 0,
        binding: index,
    })
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use softcompute_common::shader_abi::{EntryPoint, ShaderFrame};
    use softcompute_engine::{BackendKind, CompilationBackend, CompileRequest, CompiledArtifact};

    use crate::collab::{Reflection, ResourceInfo, Transpiled, UniformInfo};

    thread_local! {
        static GROUPS: RefCell<Vec<[u32; 3]>> = const { RefCell::new(Vec::new()) };
    }

    /// Records the group id and writes it into storage binding 0 as floats.
    unsafe extern "C" fn record_groups(frame: *mut ShaderFrame) {
        let frame = &*frame;
        GROUPS.with(|g| g.borrow_mut().push(frame.work_group_id));
        if frame.storage_buffers.count > 0 {
            let b = &*frame.storage_buffers.bindings;
            let out = std::slice::from_raw_parts_mut(b.data as *mut f32, b.size as usize / 4);
            out[0] += 1.0;
        }
    }

    struct SpyArtifact(Arc<AtomicUsize>);

    impl CompiledArtifact for SpyArtifact {
        fn entry_point(&self) -> EntryPoint {
            EntryPoint::from_fn(record_groups)
        }
    }

    impl Drop for SpyArtifact {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct SpyBackend {
        compiles: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    impl CompilationBackend for SpyBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Custom("spy")
        }

        fn compile(&self, _: &CompileRequest<'_>) -> Result<Box<dyn CompiledArtifact>, CompileError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(SpyArtifact(Arc::clone(&self.released))))
        }
    }

    struct Spy {
        ctx: SoftGlContext,
        compiles: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    fn spy_context() -> Spy {
        let spy = SpyBackend::default();
        let (compiles, released) = (Arc::clone(&spy.compiles), Arc::clone(&spy.released));
        Spy {
            ctx: SoftGlContext::new(ShaderEngine::with_backend(Box::new(spy), "softcompute_main")),
            compiles,
            released,
        }
    }

    fn compiled_shader(ctx: &mut SoftGlContext) -> u32 {
        let shader = ctx.create_shader(ShaderKind::Compute).unwrap();
        ctx.shader_source(shader, &["function ", "%softcompute_main"]).unwrap();
        ctx.compile_shader(shader).unwrap();
        shader
    }

    fn linked_program(ctx: &mut SoftGlContext) -> u32 {
        let shader = compiled_shader(ctx);
        let program = ctx.create_program().unwrap();
        ctx.attach_shader(program, shader).unwrap();
        ctx.link_program(program).unwrap();
        program
    }

    fn buffer_with(ctx: &mut SoftGlContext, bytes: usize) -> u32 {
        let id = ctx.gen_buffers(1).unwrap()[0];
        ctx.bind_buffer(BufferTarget::ShaderStorage, id).unwrap();
        ctx.buffer_data(BufferTarget::ShaderStorage, bytes, None).unwrap();
        id
    }

    fn read_floats(ctx: &mut SoftGlContext, buffer: u32, n: usize) -> Vec<f32> {
        ctx.bind_buffer(BufferTarget::ShaderStorage, buffer).unwrap();
        let mut bytes = vec![0u8; n * 4];
        ctx.get_buffer_sub_data(BufferTarget::ShaderStorage, 0, &mut bytes).unwrap();
        bytemuck::pod_collect_to_vec(&bytes)
    }

    #[test]
    fn test_buffer_handles_start_at_one() {
        let mut ctx = spy_context().ctx;
        assert_eq!(ctx.gen_buffers(3).unwrap(), vec![1, 2, 3]);
        ctx.delete_buffers(&[2]);
        assert_eq!(ctx.gen_buffers(1).unwrap(), vec![2]);
    }

    #[test]
    fn test_buffer_pool_exhaustion_rolls_back() {
        let mut ctx = spy_context().ctx;
        ctx.gen_buffers(MAX_BUFFERS - 1).unwrap();
        assert!(matches!(ctx.gen_buffers(2), Err(GlError::OutOfHandles(_))));
        assert_eq!(ctx.gen_buffers(1).unwrap(), vec![MAX_BUFFERS as u32]);
    }

    #[test]
    fn test_buffer_data_and_sub_data() {
        let mut ctx = spy_context().ctx;
        let id = buffer_with(&mut ctx, 8);
        ctx.buffer_sub_data(BufferTarget::ShaderStorage, 4, &[1, 2, 3, 4]).unwrap();
        assert!(matches!(
            ctx.buffer_sub_data(BufferTarget::ShaderStorage, 6, &[0; 4]),
            Err(GlError::RangeOutOfBounds { .. })
        ));

        let mut out = [0u8; 8];
        ctx.get_buffer_sub_data(BufferTarget::ShaderStorage, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);

        let mapped = ctx.map_buffer(BufferTarget::ShaderStorage).unwrap();
        mapped[0] = 9;
        assert!(ctx.buffer_data(BufferTarget::ShaderStorage, 4, None).is_err());
        assert!(ctx.unmap_buffer(BufferTarget::ShaderStorage).unwrap());
        assert!(!ctx.unmap_buffer(BufferTarget::ShaderStorage).unwrap());
        assert_eq!(read_floats(&mut ctx, id, 2).len(), 2);

        ctx.bind_buffer(BufferTarget::ShaderStorage, 0).unwrap();
        assert!(matches!(
            ctx.buffer_data(BufferTarget::ShaderStorage, 4, None),
            Err(GlError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_bind_range_past_end_changes_nothing() {
        let mut ctx = spy_context().ctx;
        let id = buffer_with(&mut ctx, 64);
        ctx.bind_buffer_range(BufferTarget::ShaderStorage, 1, id, 0, 32).unwrap();
        let before = ctx.accessor(BufferTarget::ShaderStorage, 1).unwrap();

        let err = ctx.bind_buffer_range(BufferTarget::ShaderStorage, 1, id, 48, 32).err().unwrap();
        assert!(matches!(err, GlError::RangeOutOfBounds { offset: 48, size: 32, len: 64, .. }));
        assert_eq!(ctx.accessor(BufferTarget::ShaderStorage, 1).unwrap(), before);

        assert!(ctx.bind_buffer_range(BufferTarget::Uniform, 0, id, usize::MAX, 2).is_err());
        assert!(!ctx.accessor(BufferTarget::Uniform, 0).unwrap().bound);
    }

    #[test]
    fn test_deleting_buffer_unbinds_accessors() {
        let mut ctx = spy_context().ctx;
        let id = buffer_with(&mut ctx, 16);
        ctx.bind_buffer_base(BufferTarget::ShaderStorage, 0, id).unwrap();
        ctx.delete_buffers(&[id]);
        assert!(!ctx.accessor(BufferTarget::ShaderStorage, 0).unwrap().bound);
    }

    #[test]
    fn test_uniforms() {
        let mut ctx = spy_context().ctx;
        ctx.uniform3f(2, 1.0, 2.0, 3.0).unwrap();
        ctx.uniform2i(3, -4, 5).unwrap();
        ctx.uniform1f(-1, 9.0).unwrap();
        assert!(ctx.uniform1i(MAX_UNIFORMS as i32, 1).is_err());

        let v = ctx.uniform(2).unwrap();
        assert_eq!(v.count, 3);
        assert_eq!(v.as_floats(), [1.0, 2.0, 3.0, 0.0]);
        assert_eq!(ctx.uniform(3).unwrap().as_ints()[..2], [-4, 5]);
    }

    #[test]
    fn test_shader_binary_length_checked() {
        let mut ctx = spy_context().ctx;
        let shader = ctx.create_shader(ShaderKind::Compute).unwrap();
        assert!(matches!(ctx.shader_binary(shader, &[1, 2, 3]), Err(GlError::InvalidValue(_))));
        assert!(ctx.shader_binary(shader, &[]).is_err());

        ctx.shader_binary(shader, &0x0723_0203u32.to_le_bytes()).unwrap();
        ctx.compile_shader(shader).unwrap();
        assert!(ctx.shader_compile_status(shader));
    }

    #[test]
    fn test_compile_without_input_is_reported() {
        let mut ctx = spy_context().ctx;
        let shader = ctx.create_shader(ShaderKind::Compute).unwrap();
        assert!(ctx.compile_shader(shader).is_err());
        assert!(!ctx.shader_compile_status(shader));
        assert!(!ctx.shader_info_log(shader).unwrap().is_empty());
    }

    #[test]
    fn test_new_source_resets_compiled_state() {
        let mut ctx = spy_context().ctx;
        let shader = compiled_shader(&mut ctx);
        ctx.shader_source(shader, &["other"]).unwrap();
        assert!(!ctx.shader_compile_status(shader));
    }

    #[test]
    fn test_link_needs_exactly_one_shader() {
        let spy = spy_context();
        let mut ctx = spy.ctx;

        let empty = ctx.create_program().unwrap();
        let err = ctx.link_program(empty).err().unwrap();
        assert!(matches!(err, GlError::AttachmentCount { count: 0, .. }));
        assert!(!ctx.program_link_status(empty));

        let two = ctx.create_program().unwrap();
        let (a, b) = (compiled_shader(&mut ctx), compiled_shader(&mut ctx));
        ctx.attach_shader(two, a).unwrap();
        ctx.attach_shader(two, b).unwrap();
        assert!(matches!(ctx.link_program(two), Err(GlError::AttachmentCount { count: 2, .. })));
        assert!(!ctx.program_link_status(two));
        assert!(!ctx.program_info_log(two).unwrap().is_empty());

        assert_eq!(spy.compiles.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_link_needs_compiled_shader() {
        let mut ctx = spy_context().ctx;
        let shader = ctx.create_shader(ShaderKind::Compute).unwrap();
        ctx.shader_source(shader, &["x"]).unwrap();
        let program = ctx.create_program().unwrap();
        ctx.attach_shader(program, shader).unwrap();
        assert!(matches!(ctx.link_program(program), Err(GlError::InvalidOperation(_))));
    }

    #[test]
    fn test_link_registers_unit_under_program_id() {
        let spy = spy_context();
        let mut ctx = spy.ctx;
        let program = linked_program(&mut ctx);
        assert!(ctx.program_link_status(program));
        assert!(ctx.engine().get(program).is_some());
        assert!(matches!(ctx.link_program(program), Err(GlError::InvalidOperation(_))));

        ctx.delete_program(program);
        assert!(ctx.engine().get(program).is_none());
        assert_eq!(spy.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_order_and_bindings() {
        let mut ctx = spy_context().ctx;
        let program = linked_program(&mut ctx);
        let out = buffer_with(&mut ctx, 16);
        ctx.bind_buffer_base(BufferTarget::ShaderStorage, 0, out).unwrap();
        ctx.use_program(program).unwrap();

        GROUPS.with(|g| g.borrow_mut().clear());
        let stats = ctx.dispatch_compute(2, 2, 1).unwrap();
        assert_eq!(stats.groups, 4);
        let seen = GROUPS.with(|g| g.borrow_mut().drain(..).collect::<Vec<_>>());
        assert_eq!(seen, vec![[0, 0, 0], [1, 0, 0], [0, 1, 0], [1, 1, 0]]);
        assert_eq!(read_floats(&mut ctx, out, 1), vec![4.0]);
    }

    #[test]
    fn test_dispatch_preconditions() {
        let mut ctx = spy_context().ctx;
        assert!(matches!(ctx.dispatch_compute(1, 1, 1), Err(GlError::InvalidOperation(_))));

        let program = linked_program(&mut ctx);
        ctx.use_program(program).unwrap();
        assert!(matches!(ctx.dispatch_compute(1, 1, 2), Err(GlError::InvalidValue(_))));

        let unlinked = ctx.create_program().unwrap();
        ctx.use_program(unlinked).unwrap();
        assert!(matches!(ctx.dispatch_compute(1, 1, 1), Err(GlError::InvalidOperation(_))));
    }

    #[test]
    fn test_shrunk_buffer_is_stale_at_dispatch() {
        let mut ctx = spy_context().ctx;
        let program = linked_program(&mut ctx);
        let out = buffer_with(&mut ctx, 64);
        ctx.bind_buffer_range(BufferTarget::ShaderStorage, 0, out, 32, 32).unwrap();
        ctx.buffer_data(BufferTarget::ShaderStorage, 16, None).unwrap();
        ctx.use_program(program).unwrap();
        assert!(matches!(ctx.dispatch_compute(1, 1, 1), Err(GlError::StaleBinding { index: 0, .. })));
    }

    #[test]
    fn test_dispatch_indirect() {
        let mut ctx = spy_context().ctx;
        let program = linked_program(&mut ctx);
        let args = ctx.gen_buffers(1).unwrap()[0];
        ctx.bind_buffer(BufferTarget::ShaderStorage, args).unwrap();
        let words: [u32; 4] = [0, 3, 1, 1];
        ctx.buffer_data(BufferTarget::ShaderStorage, 16, Some(bytemuck::cast_slice(&words))).unwrap();
        ctx.use_program(program).unwrap();

        assert_eq!(ctx.dispatch_compute_indirect(4).unwrap().groups, 3);
        assert!(ctx.dispatch_compute_indirect(2).is_err());
        assert!(ctx.dispatch_compute_indirect(8).is_err());
    }

    struct UpperTranslator;

    impl ShaderTranslator for UpperTranslator {
        fn translate(&self, source: &str) -> Result<Vec<u32>, String> {
            if source.is_empty() {
                return Err("empty translation unit".into());
            }
            Ok(source.bytes().map(u32::from).collect())
        }
    }

    struct ReflectingTranspiler;

    impl SpirvTranspiler for ReflectingTranspiler {
        fn transpile(&self, words: &[u32]) -> Result<Transpiled, String> {
            Ok(Transpiled {
                source: format!("{} words", words.len()),
                reflection: Reflection {
                    storage_blocks: vec![
                        ResourceInfo { name: "Input".into(), set: 0, binding: 1 },
                        ResourceInfo { name: "Output".into(), set: 0, binding: 0 },
                    ],
                    uniform_blocks: vec![ResourceInfo { name: "Params".into(), set: 0, binding: 0 }],
                    uniforms: vec![UniformInfo { name: "scale".into(), location: 4 }],
                },
            })
        }
    }

    #[test]
    fn test_binary_link_needs_transpiler() {
        let mut ctx = spy_context().ctx.with_translator(Box::new(UpperTranslator));
        let shader = compiled_shader(&mut ctx);
        let program = ctx.create_program().unwrap();
        ctx.attach_shader(program, shader).unwrap();
        assert!(matches!(ctx.link_program(program), Err(GlError::MissingCollaborator(_))));
    }

    /// Fails every link with the words it was handed.
    struct EchoWords;

    impl SpirvTranspiler for EchoWords {
        fn transpile(&self, words: &[u32]) -> Result<Transpiled, String> {
            Err(format!("{:08x?}", words))
        }
    }

    #[test]
    fn test_shader_binary_bytes_become_little_endian_words() {
        let mut ctx = spy_context().ctx.with_transpiler(Box::new(EchoWords));
        let shader = ctx.create_shader(ShaderKind::Compute).unwrap();
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x01, 0x00, 0x00, 0x00];
        ctx.shader_binary(shader, &bytes).unwrap();
        ctx.compile_shader(shader).unwrap();

        let program = ctx.create_program().unwrap();
        ctx.attach_shader(program, shader).unwrap();
        match ctx.link_program(program) {
            Err(GlError::Collaborator(msg)) => assert!(msg.contains("[07230203, 00000001]"), "{}", msg),
            other => panic!("unexpected link result: {:?}", other),
        }
    }

    #[test]
    fn test_translator_failure_is_logged() {
        let mut ctx = spy_context().ctx.with_translator(Box::new(UpperTranslator));
        let shader = ctx.create_shader(ShaderKind::Compute).unwrap();
        ctx.shader_source(shader, &[""]).unwrap();
        assert!(matches!(ctx.compile_shader(shader), Err(GlError::Collaborator(_))));
        assert_eq!(ctx.shader_info_log(shader), Some("empty translation unit"));
    }

    #[test]
    fn test_reflection_queries_and_block_binding() {
        let mut ctx = spy_context()
            .ctx
            .with_translator(Box::new(UpperTranslator))
            .with_transpiler(Box::new(ReflectingTranspiler));
        let program = linked_program(&mut ctx);

        assert_eq!(ctx.get_program_resource_index(program, "Output").unwrap(), Some(1));
        assert_eq!(ctx.get_program_resource_index(program, "Missing").unwrap(), None);
        assert_eq!(ctx.get_uniform_block_index(program, "Params").unwrap(), Some(0));
        assert_eq!(ctx.get_uniform_location(program, "scale").unwrap(), 4);
        assert_eq!(ctx.get_uniform_location(program, "nope").unwrap(), -1);
        assert!(ctx.shader_storage_block_binding(program, 7, 0).is_err());

        // "Output" lives at binding 0 in the code; feed it from binding point 5.
        let out = buffer_with(&mut ctx, 4);
        ctx.bind_buffer_base(BufferTarget::ShaderStorage, 5, out).unwrap();
        ctx.shader_storage_block_binding(program, 1, 5).unwrap();
        ctx.use_program(program).unwrap();
        ctx.dispatch_compute(3, 1, 1).unwrap();
        assert_eq!(read_floats(&mut ctx, out, 1), vec![3.0]);
    }

    #[test]
    fn test_delete_program_clears_active() {
        let mut ctx = spy_context().ctx;
        let program = linked_program(&mut ctx);
        ctx.use_program(program).unwrap();
        ctx.delete_program(program);
        assert!(matches!(ctx.dispatch_compute(1, 1, 1), Err(GlError::InvalidOperation(_))));
        assert!(ctx.use_program(program).is_err());
    }

    // ============================================================
    // Real compilation
    // ============================================================

    const FILL_42: &str = "
function %softcompute_main(i64) {
block0(v0: i64):
    v1 = load.i64 notrap aligned v0+24
    v2 = load.i64 notrap aligned v1
    v3 = load.i64 notrap aligned v1+8
    v4 = f32const 0x1.500000p5
    v5 = iconst.i64 0
    jump block1(v5)
block1(v6: i64):
    v7 = icmp ult v6, v3
    brif v7, block2, block3
block2:
    v8 = iadd v2, v6
    store notrap aligned v4, v8
    v9 = iadd_imm v6, 4
    jump block1(v9)
block3:
    return
}
";

    fn jit_program(ctx: &mut SoftGlContext, text: &str) -> Result<u32, GlError> {
        let shader = ctx.create_shader(ShaderKind::Compute)?;
        ctx.shader_source(shader, &[text])?;
        ctx.compile_shader(shader)?;
        let program = ctx.create_program()?;
        ctx.attach_shader(program, shader)?;
        ctx.link_program(program)?;
        Ok(program)
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn test_end_to_end_fills_42() {
        let mut ctx = SoftGlContext::from_config(&EngineConfig::default()).unwrap();
        let program = jit_program(&mut ctx, FILL_42).unwrap();

        let out = buffer_with(&mut ctx, 16 * 4);
        ctx.bind_buffer_base(BufferTarget::ShaderStorage, 0, out).unwrap();
        ctx.use_program(program).unwrap();
        ctx.dispatch_compute(1, 1, 1).unwrap();

        assert_eq!(read_floats(&mut ctx, out, 16), vec![42.0; 16]);
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn test_lazy_symbol_fails_at_dispatch() {
        let config = EngineConfig {
            symbol_mode: softcompute_engine::ResolutionMode::Lazy,
            ..EngineConfig::default()
        };
        let mut ctx = SoftGlContext::from_config(&config).unwrap();
        let program = jit_program(
            &mut ctx,
            "
function %softcompute_main(i64) {
    sig0 = (i64) -> i32
    fn0 = %system sig0
block0(v0: i64):
    v1 = call fn0(v0)
    return
}
",
        )
        .unwrap();
        ctx.use_program(program).unwrap();
        match ctx.dispatch_compute(2, 1, 1) {
            Err(GlError::UnresolvedAtRuntime { names, x, y }) => {
                assert_eq!(names, vec!["system".to_string()]);
                assert_eq!((x, y), (0, 0));
            }
            other => panic!("expected UnresolvedAtRuntime, got {:?}", other),
        }
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn test_strict_symbol_fails_link() {
        let config = EngineConfig {
            abort_on_unresolved: false,
            ..EngineConfig::default()
        };
        let mut ctx = SoftGlContext::from_config(&config).unwrap();
        let err = jit_program(
            &mut ctx,
            "
function %softcompute_main(i64) {
    sig0 = () -> i32
    fn0 = %fork sig0
block0(v0: i64):
    v1 = call fn0()
    return
}
",
        )
        .err()
        .unwrap();
        assert!(matches!(err, GlError::Compile(CompileError::UnresolvedSymbols(_))));
    }
}
