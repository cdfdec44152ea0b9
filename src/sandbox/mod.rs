//! Sandbox module - Isolation boundary
//!
//! Every job gets its own workspace: a scratch directory plus the process
//! groups started in it. A workspace is acquired from an [`IsolationBoundary`],
//! used for the compile and run stages, and torn down on every exit path.
//!
//! Backends:
//! - `process`: native confinement (sessions, rlimits, cgroup v2, user, mount,
//!   PID and network namespaces, read-only filesystem outside the workspace)
//! - `isolate_box`: one isolate box per job
//!
//! The sandbox module does NOT:
//! - Know about languages or compilation
//! - Interpret results beyond raw exit status and limit flags

pub mod cgroup;
mod confine;
pub mod isolate_box;
pub mod meta;
pub mod monitor;
pub mod process;
mod supervise;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CleanupIncomplete, ConfigError, SandboxError};
use crate::languages::is_plain_file_name;
use crate::limits::{CapturedOutput, ResourceLimits};

pub use isolate_box::{ensure_cgroups_available, IsolateBoundary};
pub use process::{ProcessBoundary, ProcessBoundaryConfig};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

/// Unique identifier of one job's workspace
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobToken(String);

impl JobToken {
    /// Allocate a token unique within this host: worker pid plus a process-wide counter
    pub fn generate() -> Self {
        let n = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        Self(format!("job-{}-{}", std::process::id(), n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network access granted to sandboxed processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// Fresh network namespace per process; startup fails if unavailable
    Deny,
    /// Try to deny, log and continue if the host does not allow it
    BestEffort,
    Allow,
}

impl FromStr for NetworkPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deny" => Ok(NetworkPolicy::Deny),
            "best_effort" | "best-effort" => Ok(NetworkPolicy::BestEffort),
            "allow" => Ok(NetworkPolicy::Allow),
            _ => Err(ConfigError::invalid(
                "NETWORK_POLICY",
                s,
                "expected deny, best_effort or allow",
            )),
        }
    }
}

impl fmt::Display for NetworkPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkPolicy::Deny => "deny",
            NetworkPolicy::BestEffort => "best_effort",
            NetworkPolicy::Allow => "allow",
        };
        f.write_str(name)
    }
}

/// Command specification for execution inside a workspace
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment variables (key=value) on top of the sandbox base environment
    pub env: Vec<String>,
    /// Apply RLIMIT_AS as a memory backstop
    pub limit_address_space: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            limit_address_space: true,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env = env.into_iter().map(|e| e.into()).collect();
        self
    }

    pub fn with_address_space_limit(mut self, enabled: bool) -> Self {
        self.limit_address_space = enabled;
        self
    }

    /// Create from a command vector (first element is program, rest are args)
    pub fn from_vec(cmd: &[String]) -> Self {
        let mut iter = cmd.iter();
        let program = iter.next().cloned().unwrap_or_default();
        Self::new(program).with_args(iter.cloned())
    }

    /// Convert to a vector of strings (program + args)
    pub fn to_vec(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.iter().cloned());
        v
    }

    /// Split `env` entries into (key, value) pairs, skipping malformed ones
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|e| e.split_once('='))
    }
}

/// Raw outcome of one process launch (no interpretation)
#[derive(Debug, Clone, Default)]
pub struct RawOutcome {
    /// Exit code when the process exited normally
    pub exit_code: Option<i32>,
    /// Terminating signal when killed
    pub signal: Option<i32>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub timed_out: bool,
    pub out_of_memory: bool,
    pub cancelled: bool,
    pub duration: Duration,
    pub memory_peak_bytes: Option<u64>,
}

impl RawOutcome {
    /// Exit code, or 128 + signal for a killed process
    pub fn effective_exit_code(&self) -> i32 {
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => -1,
        }
    }

    pub fn output_truncated(&self) -> bool {
        self.stdout.truncated || self.stderr.truncated
    }

    /// Exited with status 0 and no limit was crossed
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
            && !self.timed_out
            && !self.out_of_memory
            && !self.cancelled
            && !self.output_truncated()
    }
}

/// Warnings collected while tearing a workspace down
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    pub warnings: Vec<CleanupIncomplete>,
}

impl TeardownReport {
    pub fn warn(&mut self, workspace: &JobToken, detail: impl Into<String>) {
        let warning = CleanupIncomplete {
            workspace: workspace.to_string(),
            detail: detail.into(),
        };
        warn!("{}", warning);
        self.warnings.push(warning);
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// A confinement mechanism that hands out per-job workspaces
#[async_trait]
pub trait IsolationBoundary: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create a fresh workspace for `token`
    async fn acquire(&self, token: &JobToken) -> Result<Box<dyn Workspace>, SandboxError>;
}

/// One job's scratch directory and the processes started in it
#[async_trait]
pub trait Workspace: Send + Sync {
    fn token(&self) -> &JobToken;

    /// Host path of the directory processes run in
    fn path(&self) -> &Path;

    /// Write a file into the workspace. `name` must be a plain file name.
    async fn write_file(&self, name: &str, contents: &[u8]) -> Result<(), SandboxError> {
        if !is_plain_file_name(name) {
            return Err(SandboxError::IsolationBreach(format!(
                "refusing to write {:?} outside workspace {}",
                name,
                self.token()
            )));
        }
        tokio::fs::write(self.path().join(name), contents).await?;
        Ok(())
    }

    /// Run a command in the workspace under `limits`
    async fn execute(
        &mut self,
        cmd: &CommandSpec,
        limits: &ResourceLimits,
        stdin: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<RawOutcome, SandboxError>;

    /// Kill everything still running and remove the workspace
    async fn teardown(self: Box<Self>) -> TeardownReport;
}

/// Scoped workspace: torn down by `release()`, or in the background when dropped
pub struct WorkspaceGuard {
    workspace: Option<Box<dyn Workspace>>,
}

impl WorkspaceGuard {
    pub async fn acquire(
        boundary: &dyn IsolationBoundary,
        token: &JobToken,
    ) -> Result<Self, SandboxError> {
        let workspace = boundary.acquire(token).await?;
        debug!("Acquired workspace {} at {}", token, workspace.path().display());
        Ok(Self {
            workspace: Some(workspace),
        })
    }

    pub fn workspace(&mut self) -> Result<&mut dyn Workspace, SandboxError> {
        match self.workspace.as_mut() {
            Some(workspace) => Ok(&mut **workspace),
            None => Err(SandboxError::Setup("workspace already released".into())),
        }
    }

    /// Tear the workspace down and return the cleanup warnings
    pub async fn release(mut self) -> TeardownReport {
        match self.workspace.take() {
            Some(workspace) => workspace.teardown().await,
            None => TeardownReport::default(),
        }
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        let Some(workspace) = self.workspace.take() else {
            return;
        };

        // Best-effort cleanup - cannot be async in Drop
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let token = workspace.token().clone();
                    let report = workspace.teardown().await;
                    debug!(
                        "Background teardown of {} finished ({} warnings)",
                        token,
                        report.warnings.len()
                    );
                });
            }
            // Workspace implementations kill their processes synchronously on drop
            Err(_) => drop(workspace),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        let a = JobToken::generate();
        let b = JobToken::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(&format!("job-{}-", std::process::id())));
    }

    #[test]
    fn test_network_policy_parse() {
        assert_eq!("deny".parse::<NetworkPolicy>().unwrap(), NetworkPolicy::Deny);
        assert_eq!(
            "Best-Effort".parse::<NetworkPolicy>().unwrap(),
            NetworkPolicy::BestEffort
        );
        assert!("open".parse::<NetworkPolicy>().is_err());
        assert_eq!(NetworkPolicy::BestEffort.to_string(), "best_effort");
    }

    #[test]
    fn test_command_spec_from_vec() {
        let cmd = CommandSpec::from_vec(&["java".to_string(), "-cp".to_string(), ".".to_string()])
            .with_env(["JAVA_TOOL_OPTIONS=-Xss8m", "BROKEN"]);
        assert_eq!(cmd.program, "java");
        assert_eq!(cmd.args, vec!["-cp", "."]);
        assert_eq!(cmd.to_vec().len(), 3);
        assert_eq!(
            cmd.env_pairs().collect::<Vec<_>>(),
            vec![("JAVA_TOOL_OPTIONS", "-Xss8m")]
        );
    }

    #[test]
    fn test_effective_exit_code() {
        let mut outcome = RawOutcome {
            exit_code: Some(42),
            ..Default::default()
        };
        assert_eq!(outcome.effective_exit_code(), 42);

        outcome.exit_code = None;
        outcome.signal = Some(9);
        assert_eq!(outcome.effective_exit_code(), 137);
        assert!(!outcome.is_success());
    }
}
