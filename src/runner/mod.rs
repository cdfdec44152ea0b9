//! Runner module - run stage of the toolchain invoker
//!
//! Runs the built program (or the interpreter on the source) once, with the
//! caller's stdin, and turns the raw sandbox outcome into an `ExecutionResult`.
//!
//! The runner module does NOT:
//! - Compare outputs or grade anything
//! - Retry a run that crossed a limit

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::compiler::BinaryHandle;
use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::sandbox::{RawOutcome, Workspace};
use crate::types::ExecutionResult;

impl From<RawOutcome> for ExecutionResult {
    fn from(outcome: RawOutcome) -> Self {
        Self {
            exit_code: outcome.effective_exit_code(),
            output_truncated: outcome.output_truncated(),
            stdout: outcome.stdout.to_string_lossy(),
            stderr: outcome.stderr.to_string_lossy(),
            timed_out: outcome.timed_out,
            out_of_memory: outcome.out_of_memory,
            cancelled: outcome.cancelled,
            signal: outcome.signal,
            duration_ms: outcome.duration.as_millis() as u64,
            memory_peak_bytes: outcome.memory_peak_bytes,
            warnings: Vec::new(),
        }
    }
}

/// Run the program once in the workspace
pub async fn run(
    workspace: &mut dyn Workspace,
    binary: &BinaryHandle,
    limits: &ResourceLimits,
    stdin: Option<&[u8]>,
    cancel: &CancellationToken,
) -> Result<ExecutionResult, SandboxError> {
    debug!(
        "[{}] Running {:?} (cpu {}s, wall {}s, memory {} bytes)",
        workspace.token(),
        binary.command.to_vec(),
        limits.cpu_seconds,
        limits.wall_seconds,
        limits.memory_bytes
    );

    let outcome = workspace
        .execute(&binary.command, limits, stdin, cancel)
        .await?;
    Ok(outcome.into())
}
