//! Compiler module - compile stage of the toolchain invoker
//!
//! Writes the submission into the workspace and runs the language's compile
//! command, if it has one, under the compile limits. A rejected build carries
//! the compiler's diagnostics verbatim and stops the job before the run stage.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CompileError, SandboxError};
use crate::languages::LanguageConfig;
use crate::limits::ResourceLimits;
use crate::sandbox::{CommandSpec, RawOutcome, Workspace};

/// What the run stage executes: the built binary or the interpreter on the source
#[derive(Debug, Clone)]
pub struct BinaryHandle {
    pub command: CommandSpec,
}

impl BinaryHandle {
    pub fn for_language(config: &LanguageConfig) -> Self {
        Self {
            command: CommandSpec::from_vec(&config.run_command)
                .with_address_space_limit(config.limit_address_space),
        }
    }
}

/// Result of the compile stage
#[derive(Debug)]
pub enum CompileOutcome {
    Ready(BinaryHandle),
    Rejected(CompileError),
    /// The job was cancelled while the compiler ran
    Cancelled(RawOutcome),
}

/// Write the source verbatim to the language's fixed path. Empty source is written as-is.
pub async fn write_source(
    workspace: &dyn Workspace,
    config: &LanguageConfig,
    source: &str,
) -> Result<(), SandboxError> {
    workspace
        .write_file(&config.source_file, source.as_bytes())
        .await
}

/// Compile source code inside the workspace
pub async fn compile(
    workspace: &mut dyn Workspace,
    config: &LanguageConfig,
    source: &str,
    limits: &ResourceLimits,
    cancel: &CancellationToken,
) -> Result<CompileOutcome, SandboxError> {
    write_source(workspace, config, source).await?;

    let compile_cmd = match &config.compile_command {
        Some(cmd) => cmd,
        None => {
            // Interpreted language, no compilation needed
            return Ok(CompileOutcome::Ready(BinaryHandle::for_language(config)));
        }
    };

    debug!(
        "[{}] Compiling {} with {:?}",
        workspace.token(),
        config.language,
        compile_cmd
    );

    let cmd = CommandSpec::from_vec(compile_cmd).with_address_space_limit(config.limit_address_space);
    let outcome = workspace.execute(&cmd, limits, None, cancel).await?;

    if outcome.cancelled {
        return Ok(CompileOutcome::Cancelled(outcome));
    }
    if outcome.is_success() {
        return Ok(CompileOutcome::Ready(BinaryHandle::for_language(config)));
    }
    Ok(CompileOutcome::Rejected(CompileError::new(diagnostics(&outcome))))
}

/// Compiler stderr, else stdout, else a message describing how the compiler ended
pub fn diagnostics(outcome: &RawOutcome) -> String {
    if !outcome.stderr.bytes.is_empty() {
        return outcome.stderr.to_string_lossy();
    }
    if !outcome.stdout.bytes.is_empty() {
        return outcome.stdout.to_string_lossy();
    }

    if outcome.timed_out {
        "Compilation timed out".to_string()
    } else if outcome.out_of_memory {
        "Compiler ran out of memory".to_string()
    } else if outcome.signal.is_some() {
        "Compiler crashed".to_string()
    } else {
        format!(
            "Compilation failed with exit code {}",
            outcome.effective_exit_code()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::{Language, LanguageTable};
    use crate::limits::CapturedOutput;

    fn failed(exit_code: Option<i32>, signal: Option<i32>) -> RawOutcome {
        RawOutcome {
            exit_code,
            signal,
            ..Default::default()
        }
    }

    #[test]
    fn test_diagnostics_prefers_stderr_verbatim() {
        let mut outcome = failed(Some(1), None);
        outcome.stderr = CapturedOutput::from_bytes(b"main.c:1:1: error: expected ';'\n".to_vec(), 1024);
        outcome.stdout = CapturedOutput::from_bytes(b"ignored".to_vec(), 1024);
        assert_eq!(diagnostics(&outcome), "main.c:1:1: error: expected ';'\n");
    }

    #[test]
    fn test_diagnostics_falls_back_to_stdout() {
        let mut outcome = failed(Some(1), None);
        outcome.stdout = CapturedOutput::from_bytes(b"Main.java:3: error".to_vec(), 1024);
        assert_eq!(diagnostics(&outcome), "Main.java:3: error");
    }

    #[test]
    fn test_diagnostics_synthesized() {
        assert_eq!(
            diagnostics(&failed(Some(4), None)),
            "Compilation failed with exit code 4"
        );
        assert_eq!(diagnostics(&failed(None, Some(11))), "Compiler crashed");

        let mut timed_out = failed(None, Some(9));
        timed_out.timed_out = true;
        assert_eq!(diagnostics(&timed_out), "Compilation timed out");
    }

    #[test]
    fn test_binary_handle_uses_run_command() {
        let table = LanguageTable::embedded().unwrap();
        let java = table.get(Language::Java).unwrap();

        let handle = BinaryHandle::for_language(java);
        assert_eq!(handle.command.program, "java");
        assert!(!handle.command.limit_address_space);
    }
}
