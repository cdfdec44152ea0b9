//! Native process backend
//!
//! Each workspace is a fresh directory under the workspace root. Every stage
//! runs in its own session with rlimits applied, joins the job cgroup when one
//! is configured, and runs inside private user, mount and PID namespaces where
//! only the workspace is writable. A private network namespace is added unless
//! the network policy allows access.
//!
//! Without a cgroup the process-tree watchdog enforces the memory and process
//! caps. It always samples CPU time, which tells a CPU-limit kill apart from
//! any other SIGKILL.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cgroup::{CgroupRoot, JobCgroup};
use super::confine::{
    is_confinement_failure, Confinement, MountJail, SUPERVISOR_LEVELS, SUPERVISOR_PROCESSES,
};
use super::monitor::TreeLimits;
use super::supervise::{supervise, StopReason, Supervision, TreeWatch};
use super::{
    CommandSpec, IsolationBoundary, JobToken, NetworkPolicy, RawOutcome, TeardownReport,
    Workspace,
};
use crate::error::SandboxError;
use crate::limits::ResourceLimits;

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Clone)]
pub struct ProcessBoundaryConfig {
    /// Directory under which per-job workspaces are created
    pub workspace_root: PathBuf,
    /// Delegated cgroup v2 directory; `None` leaves memory and process caps to the watchdog
    pub cgroup_root: Option<PathBuf>,
    pub network: NetworkPolicy,
    /// Wait between SIGTERM and SIGKILL during teardown
    pub kill_grace: Duration,
    /// Process-tree sampling interval
    pub poll_interval: Duration,
}

impl ProcessBoundaryConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            cgroup_root: None,
            network: NetworkPolicy::Deny,
            kill_grace: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
        }
    }

    pub fn with_network(mut self, network: NetworkPolicy) -> Self {
        self.network = network;
        self
    }

    pub fn with_cgroup_root(mut self, root: Option<PathBuf>) -> Self {
        self.cgroup_root = root;
        self
    }
}

pub struct ProcessBoundary {
    root: PathBuf,
    cgroups: Option<CgroupRoot>,
    network: NetworkPolicy,
    kill_grace: Duration,
    poll_interval: Duration,
}

impl ProcessBoundary {
    /// Prepare the workspace root and check that the requested confinement works on this host
    pub async fn new(config: ProcessBoundaryConfig) -> Result<Self, SandboxError> {
        tokio::fs::create_dir_all(&config.workspace_root).await?;
        let root = tokio::fs::canonicalize(&config.workspace_root).await?;

        let cgroups = config
            .cgroup_root
            .as_deref()
            .map(CgroupRoot::open)
            .transpose()?;

        let unavailable = |e: io::Error| {
            SandboxError::Setup(format!(
                "namespace confinement unavailable (network: {}): {}",
                config.network, e
            ))
        };
        match config.network {
            NetworkPolicy::BestEffort => {
                if let Err(e) = probe_confinement(&root, NetworkPolicy::Deny).await {
                    warn!(
                        "Network namespaces unavailable, sandboxed processes keep network access: {}",
                        e
                    );
                    probe_confinement(&root, NetworkPolicy::Allow)
                        .await
                        .map_err(unavailable)?;
                }
            }
            policy => probe_confinement(&root, policy).await.map_err(unavailable)?,
        }

        info!(
            "Process sandbox ready (root: {}, cgroups: {}, network: {})",
            root.display(),
            cgroups
                .as_ref()
                .map(|c| c.path().display().to_string())
                .unwrap_or_else(|| "off".to_string()),
            config.network
        );

        Ok(Self {
            root,
            cgroups,
            network: config.network,
            kill_grace: config.kill_grace,
            poll_interval: config.poll_interval,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Run a trivial process under the full confinement to see whether the host allows it
async fn probe_confinement(dir: &Path, network: NetworkPolicy) -> io::Result<()> {
    let mut command = Command::new("/bin/sh");
    command
        .args(["-c", "exit 0"])
        .current_dir(dir)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    Confinement::new(
        &ResourceLimits::default(),
        false,
        network,
        MountJail::new(dir)?,
    )
    .install(&mut command);

    let status = command.status().await?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("probe exited with {}", status)))
    }
}

#[async_trait]
impl IsolationBoundary for ProcessBoundary {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn acquire(&self, token: &JobToken) -> Result<Box<dyn Workspace>, SandboxError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", token))
            .tempdir_in(&self.root)?;

        let path = tokio::fs::canonicalize(dir.path()).await?;
        if path.parent() != Some(self.root.as_path()) {
            return Err(SandboxError::IsolationBreach(format!(
                "workspace {} resolved outside {}",
                path.display(),
                self.root.display()
            )));
        }
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700)).await?;

        let cgroup = match &self.cgroups {
            Some(root) => {
                let cgroup = root.create(token)?;
                debug!("Created cgroup {}", cgroup.path().display());
                Some(cgroup)
            }
            None => None,
        };

        Ok(Box::new(ProcessWorkspace {
            token: token.clone(),
            dir: Some(dir),
            path,
            cgroup,
            groups: Vec::new(),
            network: self.network,
            kill_grace: self.kill_grace,
            poll_interval: self.poll_interval,
        }))
    }
}

pub struct ProcessWorkspace {
    token: JobToken,
    dir: Option<TempDir>,
    path: PathBuf,
    cgroup: Option<JobCgroup>,
    /// Process groups started in this workspace
    groups: Vec<i32>,
    network: NetworkPolicy,
    kill_grace: Duration,
    poll_interval: Duration,
}

impl ProcessWorkspace {
    fn resolve_program(&self, program: &str) -> PathBuf {
        match program.strip_prefix("./") {
            Some(local) => self.path.join(local),
            None => PathBuf::from(program),
        }
    }

    fn live_groups(&self) -> Vec<i32> {
        self.groups
            .iter()
            .copied()
            .filter(|&pgid| killpg(Pid::from_raw(pgid), None).is_ok())
            .collect()
    }

    fn signal_groups(groups: &[i32], signal: Signal) {
        for &pgid in groups {
            let _ = killpg(Pid::from_raw(pgid), signal);
        }
    }

    /// Poll until every group is gone or `timeout` passes; returns the survivors
    async fn wait_for_groups(&self, timeout: Duration) -> Vec<i32> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let alive = self.live_groups();
            if alive.is_empty() || tokio::time::Instant::now() >= deadline {
                return alive;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn spawn_error(program: &str, err: io::Error) -> SandboxError {
    if is_confinement_failure(&err) {
        SandboxError::IsolationBreach(format!("confinement could not be applied to {}", program))
    } else if err.kind() == io::ErrorKind::NotFound {
        SandboxError::ToolchainMissing(program.to_string())
    } else {
        SandboxError::Io(err)
    }
}

#[async_trait]
impl Workspace for ProcessWorkspace {
    fn token(&self) -> &JobToken {
        &self.token
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn execute(
        &mut self,
        cmd: &CommandSpec,
        limits: &ResourceLimits,
        stdin: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<RawOutcome, SandboxError> {
        let mut command = Command::new(self.resolve_program(&cmd.program));
        command
            .args(&cmd.args)
            .current_dir(&self.path)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", &self.path)
            .env("TMPDIR", &self.path)
            .env("LANG", "C.UTF-8")
            .envs(cmd.env_pairs())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let jail = MountJail::new(&self.path)?;
        let mut confinement =
            Confinement::new(limits, cmd.limit_address_space, self.network, jail);
        if let Some(cgroup) = &self.cgroup {
            cgroup.apply_limits(&ResourceLimits {
                max_processes: limits.max_processes.saturating_add(SUPERVISOR_PROCESSES),
                ..*limits
            })?;
            confinement = confinement.with_cgroup(cgroup.procs_file()?);
        }
        confinement.install(&mut command);

        debug!("[{}] Running {:?}", self.token, cmd.to_vec());
        let child = command
            .spawn()
            .map_err(|e| spawn_error(&cmd.program, e))?;

        // setsid() in the child makes its pid the process group id
        let pgid = child
            .id()
            .map(|pid| pid as i32)
            .ok_or_else(|| SandboxError::Setup("spawned child has no pid".into()))?;
        self.groups.push(pgid);

        let cgroup = self.cgroup.as_ref();
        // The cgroup enforces memory and process caps when there is one
        let watchdog_enforces = cgroup.is_none();
        let supervised = supervise(
            child,
            Supervision {
                limits,
                stdin,
                cancel,
                watch: Some(TreeWatch {
                    interval: self.poll_interval,
                    supervisor_levels: SUPERVISOR_LEVELS,
                    limits: TreeLimits {
                        memory_bytes: watchdog_enforces.then_some(limits.memory_bytes),
                        max_processes: watchdog_enforces.then_some(limits.max_processes),
                    },
                }),
                kill_grace: self.kill_grace,
            },
            |_| {
                let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
                if let Some(cgroup) = cgroup {
                    cgroup.kill_all();
                }
            },
        )
        .await?;

        let oom_kills = self
            .cgroup
            .as_mut()
            .map(|cgroup| cgroup.take_oom_kills())
            .unwrap_or(0);
        let memory_peak_bytes = self
            .cgroup
            .as_ref()
            .and_then(|cgroup| cgroup.memory_peak())
            .or(supervised.watch_peak);

        let signal = supervised.signal();
        // memory.peak spans every stage of the job, so only the watchdog peak is compared
        let out_of_memory = supervised.stop == Some(StopReason::Memory)
            || oom_kills > 0
            || (watchdog_enforces
                && supervised
                    .watch_peak
                    .is_some_and(|peak| peak >= limits.memory_bytes));
        // SIGXCPU at the soft CPU limit, SIGKILL at the hard one. Any other
        // SIGKILL (the program's own, the host OOM killer) is not a timeout.
        let cpu_spent = supervised
            .cpu_peak
            .is_some_and(|cpu| cpu >= Duration::from_secs(limits.cpu_seconds));
        let cpu_exceeded = signal == Some(Signal::SIGXCPU as i32)
            || (signal == Some(Signal::SIGKILL as i32)
                && supervised.stop.is_none()
                && !out_of_memory
                && cpu_spent);
        if supervised.stop == Some(StopReason::ProcessLimit) {
            debug!(
                "[{}] Stopped after exceeding {} processes",
                self.token, limits.max_processes
            );
        }
        let timed_out = supervised.stop == Some(StopReason::WallClock) || cpu_exceeded;

        Ok(RawOutcome {
            exit_code: supervised.exit_code(),
            signal,
            timed_out,
            out_of_memory,
            cancelled: supervised.stop == Some(StopReason::Cancelled),
            duration: supervised.duration,
            memory_peak_bytes,
            stdout: supervised.stdout,
            stderr: supervised.stderr,
        })
    }

    async fn teardown(self: Box<Self>) -> TeardownReport {
        let mut this = self;
        let mut report = TeardownReport::default();

        let alive = this.live_groups();
        if !alive.is_empty() {
            Self::signal_groups(&alive, Signal::SIGTERM);
            let stubborn = this.wait_for_groups(this.kill_grace).await;
            if !stubborn.is_empty() {
                Self::signal_groups(&stubborn, Signal::SIGKILL);
                let survivors = this.wait_for_groups(this.kill_grace).await;
                if !survivors.is_empty() {
                    report.warn(
                        &this.token,
                        format!("process groups {:?} survived SIGKILL", survivors),
                    );
                }
            }
        }
        this.groups.clear();

        if let Some(cgroup) = this.cgroup.take() {
            cgroup.kill_all();
            let deadline = tokio::time::Instant::now() + this.kill_grace;
            while !cgroup.is_empty() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            if let Err(e) = cgroup.remove() {
                report.warn(
                    &this.token,
                    format!("cgroup {} not removed: {}", cgroup.path().display(), e),
                );
            }
        }

        if let Some(dir) = this.dir.take() {
            if let Err(e) = dir.close() {
                report.warn(&this.token, format!("workspace removal failed: {}", e));
            }
        }
        if tokio::fs::try_exists(&this.path).await.unwrap_or(true) {
            report.warn(
                &this.token,
                format!("workspace {} still present", this.path.display()),
            );
        }

        debug!("[{}] Workspace torn down", this.token);
        report
    }
}

impl Drop for ProcessWorkspace {
    fn drop(&mut self) {
        // Only reached when teardown did not run
        Self::signal_groups(&self.groups, Signal::SIGKILL);
        if let Some(cgroup) = self.cgroup.take() {
            cgroup.kill_all();
            let _ = cgroup.remove();
        }
    }
}
