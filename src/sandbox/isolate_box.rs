//! Isolate box management
//!
//! One isolate box per job. The box id comes from the worker's own range so
//! several workers can share a host, and ids are never handed to two live jobs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::meta::{parse_meta, IsolateStatus};
use super::supervise::{supervise, StopReason, Supervision};
use super::{CommandSpec, IsolationBoundary, JobToken, RawOutcome, TeardownReport, Workspace};
use crate::error::SandboxError;
use crate::limits::{ResourceLimits, KIB};

const BOXES_PER_WORKER: u32 = 1000;

/// Box ids currently held by live workspaces
type BoxRegistry = Arc<Mutex<HashSet<u32>>>;

/// Check whether isolate can initialise a box with cgroups
async fn probe_cgroups(box_id: u32) -> bool {
    let box_id_str = box_id.to_string();
    let test_result = Command::new("isolate")
        .args(["--box-id", &box_id_str, "--cg", "--init"])
        .output()
        .await;

    // Cleanup
    let _ = Command::new("isolate")
        .args(["--box-id", &box_id_str, "--cg", "--cleanup"])
        .output()
        .await;

    matches!(test_result, Ok(r) if r.status.success())
}

/// Ensure cgroups are available; return an error otherwise
pub fn ensure_cgroups_available(boundary: &IsolateBoundary) -> Result<(), SandboxError> {
    if boundary.uses_cgroups() {
        Ok(())
    } else {
        Err(SandboxError::Setup("Isolate cgroup support is required but not available. Install isolate with cgroup support and ensure cgroups are enabled.".into()))
    }
}

pub struct IsolateBoundary {
    worker_id: u32,
    counter: AtomicU32,
    in_use: BoxRegistry,
    use_cgroups: bool,
}

impl IsolateBoundary {
    pub async fn new(worker_id: u32) -> Result<Self, SandboxError> {
        let version = Command::new("isolate").arg("--version").output().await;
        match version {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                return Err(SandboxError::Setup(format!(
                    "isolate --version failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )))
            }
            Err(_) => return Err(SandboxError::ToolchainMissing("isolate".into())),
        }

        let mut boundary = Self {
            worker_id,
            counter: AtomicU32::new(0),
            in_use: Arc::new(Mutex::new(HashSet::new())),
            use_cgroups: false,
        };

        let probe_box = boundary.allocate_box_id()?;
        boundary.use_cgroups = probe_cgroups(probe_box).await;
        release_box_id(&boundary.in_use, probe_box);

        if !boundary.use_cgroups {
            warn!("isolate cgroup support unavailable, memory is limited by address space only");
        }
        info!(
            "Isolate sandbox ready (worker {}, box range {}..{}, cgroups: {})",
            worker_id,
            boundary.box_offset(),
            boundary.box_offset() + BOXES_PER_WORKER,
            boundary.use_cgroups
        );

        Ok(boundary)
    }

    pub fn uses_cgroups(&self) -> bool {
        self.use_cgroups
    }

    fn box_offset(&self) -> u32 {
        // Isolate only supports box IDs 0-9999: each worker (0-9) gets a range of 1000
        (self.worker_id % 10) * BOXES_PER_WORKER
    }

    /// Next free box id in this worker's range
    fn allocate_box_id(&self) -> Result<u32, SandboxError> {
        let mut in_use = self
            .in_use
            .lock()
            .map_err(|_| SandboxError::Setup("box registry poisoned".into()))?;

        for _ in 0..BOXES_PER_WORKER {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            let box_id = self.box_offset() + n % BOXES_PER_WORKER;
            if in_use.insert(box_id) {
                return Ok(box_id);
            }
        }
        Err(SandboxError::Setup(format!(
            "all {} isolate boxes of worker {} are busy",
            BOXES_PER_WORKER, self.worker_id
        )))
    }
}

fn release_box_id(registry: &BoxRegistry, box_id: u32) {
    if let Ok(mut in_use) = registry.lock() {
        in_use.remove(&box_id);
    }
}

fn box_args(box_id: u32, use_cgroups: bool, action: &str) -> Vec<String> {
    let mut args = vec!["--box-id".to_string(), box_id.to_string()];
    if use_cgroups {
        args.push("--cg".to_string());
    }
    args.push(action.to_string());
    args
}

#[async_trait]
impl IsolationBoundary for IsolateBoundary {
    fn name(&self) -> &'static str {
        "isolate"
    }

    async fn acquire(&self, token: &JobToken) -> Result<Box<dyn Workspace>, SandboxError> {
        let box_id = self.allocate_box_id()?;

        match init_box(box_id, self.use_cgroups).await {
            Ok(work_dir) => {
                info!("[{}] Initialized isolate box {} at {}", token, box_id, work_dir.display());
                Ok(Box::new(IsolateWorkspace {
                    token: token.clone(),
                    box_id,
                    work_dir,
                    use_cgroups: self.use_cgroups,
                    registry: self.in_use.clone(),
                    released: false,
                }))
            }
            Err(e) => {
                release_box_id(&self.in_use, box_id);
                Err(e)
            }
        }
    }
}

/// Create a clean box and return its working directory
async fn init_box(box_id: u32, use_cgroups: bool) -> Result<PathBuf, SandboxError> {
    // Clean up any existing box
    let _ = Command::new("isolate")
        .args(box_args(box_id, use_cgroups, "--cleanup"))
        .output()
        .await;

    let output = Command::new("isolate")
        .args(box_args(box_id, use_cgroups, "--init"))
        .output()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SandboxError::Setup(format!(
            "Failed to initialize isolate box {}: {}",
            box_id,
            stderr.trim()
        )));
    }

    let box_path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let work_dir = tokio::fs::canonicalize(Path::new(&box_path).join("box")).await?;

    // isolate lays boxes out as <root>/<box id>/box
    let expected = Path::new(&box_id.to_string()).join("box");
    if !work_dir.ends_with(&expected) {
        return Err(SandboxError::IsolationBreach(format!(
            "isolate box {} resolved to {}",
            box_id,
            work_dir.display()
        )));
    }
    Ok(work_dir)
}

pub struct IsolateWorkspace {
    token: JobToken,
    box_id: u32,
    work_dir: PathBuf,
    use_cgroups: bool,
    registry: BoxRegistry,
    released: bool,
}

impl IsolateWorkspace {
    fn run_args(&self, cmd: &CommandSpec, limits: &ResourceLimits, meta_file: &Path) -> Vec<String> {
        let memory_limit_kb = limits.memory_bytes / KIB;
        // Status lines would otherwise land in the program's stderr
        let mut args = vec![
            "--box-id".to_string(),
            self.box_id.to_string(),
            "--silent".to_string(),
        ];

        if self.use_cgroups {
            args.push("--cg".to_string());
            args.push(format!("--cg-mem={}", memory_limit_kb));
        } else if cmd.limit_address_space {
            args.push(format!("--mem={}", memory_limit_kb));
        }

        args.extend([
            format!("--time={}", limits.cpu_seconds),
            format!("--wall-time={}", limits.wall_seconds),
            format!("--meta={}", meta_file.display()),
            format!("--processes={}", limits.max_processes),
            format!("--open-files={}", limits.max_open_files),
            format!("--fsize={}", limits.max_file_size_bytes / KIB),
            // Mount directories needed for runtime
            "--dir=/usr".to_string(),
            "--dir=/lib".to_string(),
            "--dir=/lib64:maybe".to_string(),
            "--dir=/etc:noexec".to_string(),
            "--env=PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
            "--env=HOME=/box".to_string(),
            "--env=TMPDIR=/tmp".to_string(),
            "--env=LANG=C.UTF-8".to_string(),
        ]);
        args.extend(cmd.env_pairs().map(|(k, v)| format!("--env={}={}", k, v)));

        args.push("--run".to_string());
        args.push("--".to_string());

        // Prepend /usr/bin/ to bare program names; isolate does no PATH lookup
        if cmd.program.contains('/') {
            args.push(cmd.program.clone());
        } else {
            args.push(format!("/usr/bin/{}", cmd.program));
        }
        args.extend(cmd.args.iter().cloned());
        args
    }

    fn release(&mut self) {
        if !self.released {
            release_box_id(&self.registry, self.box_id);
            self.released = true;
        }
    }
}

#[async_trait]
impl Workspace for IsolateWorkspace {
    fn token(&self) -> &JobToken {
        &self.token
    }

    fn path(&self) -> &Path {
        &self.work_dir
    }

    async fn execute(
        &mut self,
        cmd: &CommandSpec,
        limits: &ResourceLimits,
        stdin: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<RawOutcome, SandboxError> {
        let meta_file = tempfile::NamedTempFile::new()?;
        let args = self.run_args(cmd, limits, meta_file.path());
        debug!("[{}] Running isolate with args: {:?}", self.token, args);

        let child = Command::new("isolate")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SandboxError::ToolchainMissing("isolate".into()),
                _ => SandboxError::Io(e),
            })?;
        let isolate_pid = child.id().map(|pid| Pid::from_raw(pid as i32));

        // isolate enforces the wall clock itself; the outer timer is a backstop
        let outer = ResourceLimits {
            wall_seconds: limits.wall_seconds + 1,
            ..*limits
        };
        let supervised = supervise(
            child,
            Supervision {
                limits: &outer,
                stdin,
                cancel,
                watch: None,
                kill_grace: std::time::Duration::from_secs(1),
            },
            |running| {
                // isolate kills the box on SIGTERM
                if let (true, Some(pid)) = (running, isolate_pid) {
                    let _ = kill(pid, Signal::SIGTERM);
                }
            },
        )
        .await?;

        let meta_content = tokio::fs::read_to_string(meta_file.path())
            .await
            .unwrap_or_default();
        let meta = parse_meta(&meta_content);

        if meta.status == IsolateStatus::InternalError {
            return Err(SandboxError::Setup(format!(
                "isolate internal error: {}",
                meta.message.unwrap_or_default()
            )));
        }

        let memory_peak_bytes = (meta.memory_kb > 0).then_some(meta.memory_kb * KIB);
        let signal = meta.signal();
        let stopped_early = supervised.stop.is_some();

        Ok(RawOutcome {
            exit_code: match (stopped_early, signal) {
                (false, None) => Some(meta.exit_code),
                _ => None,
            },
            signal: signal.or_else(|| supervised.signal()),
            timed_out: meta.status == IsolateStatus::TimeOut
                || supervised.stop == Some(StopReason::WallClock),
            out_of_memory: meta.oom_killed
                || memory_peak_bytes.is_some_and(|peak| peak >= limits.memory_bytes),
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

        let output = Command::new("isolate")
            .args(box_args(this.box_id, this.use_cgroups, "--cleanup"))
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                info!("Cleaned up isolate box {}", this.box_id);
            }
            Ok(output) => report.warn(
                &this.token,
                format!(
                    "isolate --cleanup of box {} failed: {}",
                    this.box_id,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ),
            Err(e) => report.warn(&this.token, format!("isolate --cleanup not run: {}", e)),
        }

        if tokio::fs::try_exists(&this.work_dir).await.unwrap_or(true) {
            report.warn(
                &this.token,
                format!("box directory {} still present", this.work_dir.display()),
            );
        }

        this.release();
        report
    }
}

impl Drop for IsolateWorkspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Only reached when teardown did not run
        let _ = std::process::Command::new("isolate")
            .args(box_args(self.box_id, self.use_cgroups, "--cleanup"))
            .output();
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boundary(worker_id: u32) -> IsolateBoundary {
        IsolateBoundary {
            worker_id,
            counter: AtomicU32::new(0),
            in_use: Arc::new(Mutex::new(HashSet::new())),
            use_cgroups: true,
        }
    }

    fn workspace(use_cgroups: bool) -> IsolateWorkspace {
        IsolateWorkspace {
            token: JobToken::generate(),
            box_id: 3042,
            work_dir: PathBuf::from("/var/local/lib/isolate/3042/box"),
            use_cgroups,
            registry: Arc::new(Mutex::new(HashSet::new())),
            released: true,
        }
    }

    #[test]
    fn test_box_ids_stay_in_worker_range() {
        let boundary = boundary(13);
        let first = boundary.allocate_box_id().unwrap();
        let second = boundary.allocate_box_id().unwrap();
        assert_eq!(first, 3000);
        assert_eq!(second, 3001);
    }

    #[test]
    fn test_busy_box_ids_are_skipped() {
        let boundary = boundary(0);
        let held = boundary.allocate_box_id().unwrap();

        // wrap the counter around to the held id
        boundary.counter.store(BOXES_PER_WORKER, Ordering::Relaxed);
        let next = boundary.allocate_box_id().unwrap();
        assert_eq!(held, 0);
        assert_eq!(next, 1);

        release_box_id(&boundary.in_use, held);
        boundary.counter.store(0, Ordering::Relaxed);
        assert_eq!(boundary.allocate_box_id().unwrap(), 0);
    }

    #[test]
    fn test_exhausted_range_is_an_error() {
        let boundary = boundary(1);
        for _ in 0..BOXES_PER_WORKER {
            boundary.allocate_box_id().unwrap();
        }
        assert!(boundary.allocate_box_id().is_err());
    }

    #[test]
    fn test_run_args_with_cgroups() {
        let ws = workspace(true);
        let limits = ResourceLimits {
            cpu_seconds: 2,
            wall_seconds: 4,
            memory_bytes: 64 * 1024 * 1024,
            ..Default::default()
        };
        let cmd = CommandSpec::new("python3")
            .with_args(["main.py"])
            .with_env(["PYTHONHASHSEED=0"]);

        let args = ws.run_args(&cmd, &limits, Path::new("/tmp/meta.txt"));
        assert!(args.contains(&"--cg-mem=65536".to_string()));
        assert!(args.contains(&"--time=2".to_string()));
        assert!(args.contains(&"--wall-time=4".to_string()));
        assert!(args.contains(&"--meta=/tmp/meta.txt".to_string()));
        assert!(args.contains(&"--env=PYTHONHASHSEED=0".to_string()));
        assert_eq!(&args[args.len() - 2..], ["/usr/bin/python3", "main.py"]);
    }

    #[test]
    fn test_run_args_keep_isolate_quiet() {
        let ws = workspace(false);
        let limits = ResourceLimits::default();
        let args = ws.run_args(&CommandSpec::new("./main"), &limits, Path::new("/tmp/m"));

        let silent = args.iter().position(|a| a == "--silent").expect("--silent missing");
        let run = args.iter().position(|a| a == "--run").unwrap();
        assert!(silent < run);
    }

    #[test]
    fn test_run_args_without_cgroups() {
        let ws = workspace(false);
        let limits = ResourceLimits::default();

        let args = ws.run_args(&CommandSpec::new("./main"), &limits, Path::new("/tmp/m"));
        assert!(!args.iter().any(|a| a.starts_with("--cg")));
        assert!(args.contains(&"--mem=262144".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("./main"));

        let java = CommandSpec::new("java").with_address_space_limit(false);
        let args = ws.run_args(&java, &limits, Path::new("/tmp/m"));
        assert!(!args.iter().any(|a| a.starts_with("--mem")));
    }
}
