// dispatch.rs — sequential work group execution
//
// Work groups run one after another on the calling thread: rows (y) outer,
// columns (x) inner. The frame's builtin block is rewritten before each
// invocation so every group sees its own id.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};

use softcompute_common::shader_abi::{shader_main, EntryPoint, ShaderFrame};
use softcompute_engine::symbols::take_unresolved_call;
use softcompute_engine::ShaderInstance;

use crate::error::GlError;

/// Observability only: nothing depends on these values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchStats {
    pub groups: u64,
    pub elapsed: Duration,
}

impl DispatchStats {
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

/// The native shader object a linked program owns: its compiled unit and
/// the frame handed to every invocation.
pub struct ShaderObject {
    instance: Arc<ShaderInstance>,
    frame: Box<ShaderFrame>,
}

impl ShaderObject {
    pub fn new(instance: Arc<ShaderInstance>) -> Self {
        Self {
            instance,
            frame: Box::default(),
        }
    }

    pub fn instance(&self) -> &Arc<ShaderInstance> {
        &self.instance
    }

    pub fn frame_mut(&mut self) -> &mut ShaderFrame {
        &mut self.frame
    }
}

/// Invoke `entry` once per work group of a `groups[0] x groups[1]` grid.
///
/// Only `groups[2] == 1` is supported. `unresolved` names the lazily bound
/// symbols of the unit, for the error raised if compiled code calls one.
///
/// # Safety
/// `entry` must follow the shader ABI and stay valid for the whole call, and
/// every resource pointer in `frame` must be valid for its stated size.
pub unsafe fn execute_workgroups(
    entry: EntryPoint,
    frame: &mut ShaderFrame,
    groups: [u32; 3],
    unresolved: &[String],
) -> Result<DispatchStats, GlError> {
    let [num_x, num_y, num_z] = groups;
    if num_z != 1 {
        return Err(GlError::InvalidValue(format!(
            "num_groups_z must be 1, got {}",
            num_z
        )));
    }

    let main = shader_main(entry);
    frame.num_work_groups = groups;
    take_unresolved_call();

    debug!("dispatch {} x {} x {}", num_x, num_y, num_z);
    let begin = Instant::now();
    for y in 0..num_y {
        for x in 0..num_x {
            frame.work_group_id = [x, y, 0];
            main(&mut *frame);

            if take_unresolved_call() {
                return Err(GlError::UnresolvedAtRuntime {
                    names: unresolved.to_vec(),
                    x,
                    y,
                });
            }
        }
    }

    let stats = DispatchStats {
        groups: num_x as u64 * num_y as u64,
        elapsed: begin.elapsed(),
    };
    info!("execute time: {:.3} ms", stats.elapsed_ms());
    Ok(stats)
}
