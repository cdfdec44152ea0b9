//! One-shot runner: compile and run a single source file and print the result as JSON.
//!
//! Exit status: 0 when the program ran and succeeded, 1 on a compile error or a
//! failed run, 2 when the job could not be carried out.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use coderun::config::SandboxBackend;
use coderun::sandbox::{
    IsolateBoundary, IsolationBoundary, NetworkPolicy, ProcessBoundary, ProcessBoundaryConfig,
};
use coderun::{
    Coordinator, ExecError, JobOutcome, Language, LanguageTable, LimitOverrides, LimitPolicy,
    Submission,
};

#[derive(Parser, Debug)]
#[command(name = "coderun", version, about = "Run one source file in a sandbox")]
struct Args {
    /// Source file to compile and run
    file: PathBuf,

    /// Language name or alias; detected from the file extension when omitted
    #[arg(short, long)]
    language: Option<String>,

    /// File fed to the program's stdin
    #[arg(long)]
    stdin_file: Option<PathBuf>,

    /// CPU time limit in seconds
    #[arg(long)]
    cpu_seconds: Option<u64>,

    /// Memory limit in MiB
    #[arg(long)]
    memory_mb: Option<u64>,

    /// Wall-clock limit in seconds
    #[arg(long)]
    wall_seconds: Option<u64>,

    /// Captured output cap per stream, in bytes
    #[arg(long)]
    output_bytes: Option<usize>,

    /// Sandbox backend: process or isolate
    #[arg(long, env = "SANDBOX_BACKEND", default_value = "process")]
    backend: SandboxBackend,

    /// Worker id selecting the isolate box range
    #[arg(long, env = "WORKER_ID", default_value_t = 0)]
    worker_id: u32,

    /// Directory for per-job workspaces (process backend)
    #[arg(long, env = "WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,

    /// Delegated cgroup v2 directory (process backend)
    #[arg(long, env = "CGROUP_ROOT")]
    cgroup_root: Option<PathBuf>,

    /// Network policy: deny, best_effort or allow (process backend)
    #[arg(long, env = "NETWORK_POLICY", default_value = "best_effort")]
    network: NetworkPolicy,

    /// Language table replacing the built-in one
    #[arg(long, env = "LANGUAGES_CONFIG")]
    languages_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("coderun=warn")),
        )
        .init();

    match run(Args::parse()).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            let report = json!({ "status": "system_error", "error_message": format!("{:#}", e) });
            println!("{}", report);
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let languages = match &args.languages_config {
        Some(path) => LanguageTable::load(path)?,
        None => LanguageTable::embedded()?,
    };
    let language = detect_language(&args, &languages)?;

    let source = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let memory_bytes = args
        .memory_mb
        .map(|mb| {
            mb.checked_mul(coderun::limits::MIB)
                .ok_or_else(|| ExecError::InvalidLimits(format!("{} MiB is too large", mb)))
        })
        .transpose()?;
    let mut submission = Submission::new(language, source).with_limits(LimitOverrides {
        cpu_seconds: args.cpu_seconds,
        memory_bytes,
        wall_seconds: args.wall_seconds,
        output_bytes: args.output_bytes,
    });
    if let Some(path) = &args.stdin_file {
        let stdin = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        submission = submission.with_stdin(stdin);
    }

    let boundary = build_boundary(&args).await?;
    let coordinator = Coordinator::new(boundary, Arc::new(languages), LimitPolicy::default());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let outcome = coordinator.execute(submission, cancel).await?;
    let (report, code) = match &outcome {
        JobOutcome::Executed(result) => {
            let status = if result.cancelled { "cancelled" } else { "completed" };
            let code = if result.is_success() { 0 } else { 1 };
            (json!({ "status": status, "result": result }), code)
        }
        JobOutcome::CompileFailed(err) => (
            json!({ "status": "compile_error", "compile_output": err.diagnostics }),
            1,
        ),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::from(code))
}

fn detect_language(args: &Args, languages: &LanguageTable) -> Result<Language, ExecError> {
    let requested = match &args.language {
        Some(name) => name.clone(),
        None => {
            let ext = args
                .file
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default();
            Language::from_extension(ext)
                .map(|l| l.name().to_string())
                .ok_or_else(|| {
                    ExecError::UnsupportedLanguage(format!(
                        "cannot detect a language for {}",
                        args.file.display()
                    ))
                })?
        }
    };
    languages
        .resolve(&requested)
        .ok_or(ExecError::UnsupportedLanguage(requested))
}

async fn build_boundary(args: &Args) -> Result<Arc<dyn IsolationBoundary>> {
    match args.backend {
        SandboxBackend::Process => {
            let root = args
                .workspace_root
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("coderun"));
            let boundary = ProcessBoundary::new(
                ProcessBoundaryConfig::new(root)
                    .with_network(args.network)
                    .with_cgroup_root(args.cgroup_root.clone()),
            )
            .await
            .context("Failed to prepare the process sandbox")?;
            Ok(Arc::new(boundary))
        }
        SandboxBackend::Isolate => {
            let boundary = IsolateBoundary::new(args.worker_id)
                .await
                .context("Failed to prepare the isolate sandbox")?;
            Ok(Arc::new(boundary))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_env_file_supplies_sandbox_options() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "NETWORK_POLICY=deny\nWORKSPACE_ROOT=/srv/coderun-cli").unwrap();
        dotenvy::from_path(file.path()).unwrap();

        let args = Args::try_parse_from(["coderun", "main.c"]).unwrap();
        assert_eq!(args.network, NetworkPolicy::Deny);
        assert_eq!(args.workspace_root, Some(PathBuf::from("/srv/coderun-cli")));

        // Flags still win over the environment
        let args = Args::try_parse_from(["coderun", "main.c", "--network", "allow"]).unwrap();
        assert_eq!(args.network, NetworkPolicy::Allow);
    }
}
