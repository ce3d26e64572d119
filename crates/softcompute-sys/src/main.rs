// main.rs — softcompute driver
//
// Usage: softcompute [+set <name> <value>]... <source>
//
// Compiles one compute shader, runs it over a width x height grid of float4
// texels bound at storage binding 0, and reports compile time, execute time
// and a checksum of the output. `.clif` sources go through the JIT, shared
// libraries through the module loader.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use log::{debug, error, info, warn};

use softcompute_common::common;
use softcompute_common::cvar::{CvarContext, CVAR_NOSET};
use softcompute_common::shader_abi::{ResourceBinding, ResourceTable, ShaderFrame, UniformTable, UniformValue};
use softcompute_engine::config::CVAR_BACKEND;
use softcompute_engine::dll_engine::temp_module_path;
use softcompute_engine::{BackendKind, EngineConfig, ShaderEngine, ShaderSource, COMPUTE_SHADER_TYPE};
use softcompute_gl::execute_workgroups;

const CVAR_WIDTH: (&str, &str) = ("sc_width", "1024");
const CVAR_HEIGHT: (&str, &str) = ("sc_height", "1024");
const CVAR_LOCAL_SIZE: (&str, &str) = ("sc_local_size", "16");
const CVAR_OUTPUT: (&str, &str) = ("sc_output", "");
const CVAR_VERSION: &str = "sc_version";

const USAGE: &str = "usage: softcompute [+set <variable> <value>]... <source.clif | module>";

enum DriverError {
    Usage(String),
    Failed(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Usage(msg) => write!(f, "{}\n{}", msg, USAGE),
            DriverError::Failed(msg) => f.write_str(msg),
        }
    }
}

impl DriverError {
    fn exit_code(&self) -> u8 {
        match self {
            DriverError::Usage(_) => 2,
            DriverError::Failed(_) => 1,
        }
    }
}

/// Grid and output settings.
struct RunConfig {
    width: u32,
    height: u32,
    local_size: u32,
    output: Option<PathBuf>,
}

impl RunConfig {
    fn from_cvars(cvars: &CvarContext) -> Result<Self, DriverError> {
        let positive = |name: &str| -> Result<u32, DriverError> {
            match cvars.variable_string(name).trim().parse::<u32>() {
                Ok(v) if v > 0 => Ok(v),
                _ => Err(DriverError::Usage(format!(
                    "{} must be a positive integer, got `{}`",
                    name,
                    cvars.variable_string(name)
                ))),
            }
        };

        let width = positive(CVAR_WIDTH.0)?;
        let height = positive(CVAR_HEIGHT.0)?;
        let local_size = positive(CVAR_LOCAL_SIZE.0)?;
        if width % local_size != 0 || height % local_size != 0 {
            return Err(DriverError::Usage(format!(
                "{}x{} is not a multiple of local size {}",
                width, height, local_size
            )));
        }

        let output = match cvars.variable_string(CVAR_OUTPUT.0).trim() {
            "" => None,
            path => Some(PathBuf::from(path)),
        };

        Ok(Self { width, height, local_size, output })
    }
}

fn register_cvars(cvars: &mut CvarContext) {
    EngineConfig::register_cvars(cvars);
    for (name, value) in [CVAR_WIDTH, CVAR_HEIGHT, CVAR_LOCAL_SIZE, CVAR_OUTPUT] {
        cvars.get(name, value, 0);
    }
    cvars.get(CVAR_VERSION, &common::version_string(), CVAR_NOSET);
}

/// Backend for a source path, from its extension.
fn backend_for(source: &Path) -> Result<BackendKind, DriverError> {
    let name = source.to_string_lossy();
    if name.ends_with(".clif") {
        Ok(BackendKind::Jit)
    } else if name.ends_with(std::env::consts::DLL_SUFFIX) {
        Ok(BackendKind::Dll)
    } else {
        Err(DriverError::Usage(format!(
            "don't know how to compile `{}` (expected .clif or {})",
            name,
            std::env::consts::DLL_SUFFIX
        )))
    }
}

/// The backend the user asked for through `sc_backend`, when it was moved
/// off its default and the source extension selects something else.
fn ignored_backend(cvars: &CvarContext, configured: BackendKind, selected: BackendKind) -> Option<BackendKind> {
    let explicit = cvars.variable_string(CVAR_BACKEND.0).trim() != CVAR_BACKEND.1;
    (explicit && configured != selected).then_some(configured)
}

/// Order-sensitive sum over the output texels.
fn checksum(texels: &[f32]) -> f64 {
    texels
        .iter()
        .enumerate()
        .map(|(i, &v)| v as f64 * ((i % 7) + 1) as f64)
        .sum()
}

fn run(args: Vec<String>) -> Result<(), DriverError> {
    let mut cvars = CvarContext::new();
    register_cvars(&mut cvars);
    let positional = cvars.apply_command_line(args).map_err(DriverError::Usage)?;
    cvars.apply_latched();

    let source = match positional.as_slice() {
        [one] => PathBuf::from(one),
        [] => return Err(DriverError::Usage("no source given".to_string())),
        more => return Err(DriverError::Usage(format!("expected one source, got {}", more.len()))),
    };

    let mut config = EngineConfig::from_cvars(&cvars);
    common::init_logging(config.verbose);
    info!("{}", cvars.variable_string(CVAR_VERSION));

    let run_config = RunConfig::from_cvars(&cvars)?;
    let selected = backend_for(&source)?;
    if let Some(ignored) = ignored_backend(&cvars, config.backend, selected) {
        warn!("{}={} ignored; {} selects {}", CVAR_BACKEND.0, ignored, source.display(), selected);
    }
    config.backend = selected;

    // The module loader deletes what it loads; hand it a copy.
    let unit_path = match config.backend {
        BackendKind::Dll => {
            let copy = temp_module_path();
            std::fs::copy(&source, &copy)
                .map_err(|e| DriverError::Failed(format!("{}: {}", source.display(), e)))?;
            debug!("loading {} from {}", source.display(), copy.display());
            copy
        }
        _ => source.clone(),
    };

    let engine = ShaderEngine::new(&config).map_err(|e| DriverError::Failed(e.to_string()))?;

    let begin = Instant::now();
    let compiled = engine.compile(
        COMPUTE_SHADER_TYPE,
        1,
        &config.search_paths,
        &config.compiler_options,
        &ShaderSource::path(unit_path.clone()),
    );
    if compiled.is_err() && unit_path != source {
        let _ = std::fs::remove_file(&unit_path);
    }
    let instance = compiled.map_err(|e| DriverError::Failed(format!("{}: {}", source.display(), e)))?;
    println!("compile time: {:.3} ms", begin.elapsed().as_secs_f64() * 1000.0);

    let RunConfig { width, height, local_size, output } = run_config;
    let mut texels = vec![0.0f32; width as usize * height as usize * 4];
    let storage = [ResourceBinding {
        data: texels.as_mut_ptr().cast(),
        size: (texels.len() * std::mem::size_of::<f32>()) as u64,
        set: 0,
        binding: 0,
    }];
    let uniforms = [UniformValue::from_ints(&[width as i32, height as i32])];

    let mut frame = ShaderFrame {
        storage_buffers: ResourceTable::from_slice(&storage),
        uniforms: UniformTable {
            values: uniforms.as_ptr(),
            count: uniforms.len() as u32,
            reserved: 0,
        },
        ..ShaderFrame::default()
    };

    // `storage` and `uniforms` outlive the dispatch, and `instance` keeps the
    // compiled code loaded.
    let stats = unsafe {
        execute_workgroups(
            instance.entry_point(),
            &mut frame,
            [width / local_size, height / local_size, 1],
            instance.unresolved_symbols(),
        )
    }
    .map_err(|e| DriverError::Failed(e.to_string()))?;
    println!("execute time: {:.3} ms", stats.elapsed_ms());
    println!("checksum: {:.6}", checksum(&texels));

    if let Some(path) = output {
        std::fs::write(&path, bytemuck::cast_slice::<f32, u8>(&texels))
            .map_err(|e| DriverError::Failed(format!("{}: {}", path.display(), e)))?;
        info!("wrote {} texels to {}", texels.len() / 4, path.display());
    }

    Ok(())
}

fn main() -> ExitCode {
    match run(std::env::args().skip(1).collect()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match &e {
                DriverError::Usage(_) => eprintln!("{}", e),
                DriverError::Failed(msg) => error!("{}", msg),
            }
            ExitCode::from(e.exit_code())
        }
    }
}
