//! Supervision of one spawned child: stdin feeding, capped output capture,
//! wall clock, cancellation and the process-tree watchdog.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::monitor::{watch_tree, Exceeded, TreeLimits, TreePeaks};
use crate::error::SandboxError;
use crate::limits::{read_capped, CapturedOutput, ResourceLimits};

/// Why supervision stopped the child before it exited on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    WallClock,
    Memory,
    ProcessLimit,
    OutputCap,
    Cancelled,
}

/// Process-tree sampling for one stage
#[derive(Debug, Clone, Copy)]
pub(crate) struct TreeWatch {
    pub interval: Duration,
    /// Levels below the child that belong to the stage supervisor
    pub supervisor_levels: usize,
    pub limits: TreeLimits,
}

pub(crate) struct Supervision<'a> {
    pub limits: &'a ResourceLimits,
    pub stdin: Option<&'a [u8]>,
    pub cancel: &'a CancellationToken,
    pub watch: Option<TreeWatch>,
    /// How long to wait for the child and its pipes after the kill
    pub kill_grace: Duration,
}

#[derive(Debug)]
pub(crate) struct Supervised {
    pub status: Option<ExitStatus>,
    pub stop: Option<StopReason>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub duration: Duration,
    /// Highest resident memory of the tree seen by the watchdog
    pub watch_peak: Option<u64>,
    /// CPU time of the busiest process, as last sampled
    pub cpu_peak: Option<Duration>,
}

impl Supervised {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|status| status.code())
    }

    pub fn signal(&self) -> Option<i32> {
        self.status.and_then(|status| status.signal())
    }
}

/// Drive `child` to completion. `terminate` must kill everything the child started;
/// it runs once the child exits or is stopped, with `true` when the child itself
/// is still running.
pub(crate) async fn supervise<F>(
    mut child: Child,
    opts: Supervision<'_>,
    terminate: F,
) -> Result<Supervised, SandboxError>
where
    F: Fn(bool),
{
    let started = Instant::now();
    let pid = child.id();
    let limits = opts.limits;
    let overflow = Arc::new(Notify::new());

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Setup("stdout not piped".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SandboxError::Setup("stderr not piped".into()))?;
    let stdout_task = tokio::spawn(read_capped(stdout, limits.output_bytes, overflow.clone()));
    let stderr_task = tokio::spawn(read_capped(stderr, limits.output_bytes, overflow.clone()));

    // Dropping the pipe gives the child EOF on stdin
    let stdin_task = match (child.stdin.take(), opts.stdin) {
        (Some(mut pipe), Some(data)) if !data.is_empty() => {
            let data = data.to_vec();
            Some(tokio::spawn(async move {
                // EPIPE is expected when the program exits without reading
                let _ = pipe.write_all(&data).await;
                let _ = pipe.shutdown().await;
            }))
        }
        _ => None,
    };

    let peaks = TreePeaks::default();
    let tree_watch = async {
        match (opts.watch, pid) {
            (Some(watch), Some(pid)) => {
                watch_tree(
                    pid,
                    watch.supervisor_levels,
                    watch.limits,
                    watch.interval,
                    &peaks,
                )
                .await
            }
            _ => std::future::pending().await,
        }
    };

    let (status, stop) = tokio::select! {
        status = child.wait() => (Some(status?), None),
        _ = tokio::time::sleep(limits.wall_time()) => (None, Some(StopReason::WallClock)),
        _ = opts.cancel.cancelled() => (None, Some(StopReason::Cancelled)),
        exceeded = tree_watch => match exceeded {
            Exceeded::Memory => (None, Some(StopReason::Memory)),
            Exceeded::Processes => (None, Some(StopReason::ProcessLimit)),
        },
        _ = overflow.notified() => (None, Some(StopReason::OutputCap)),
    };
    let duration = started.elapsed();

    // Leftover background processes die with the stage
    terminate(stop.is_some());

    let status = match status {
        Some(status) => Some(status),
        None => {
            debug!("Stopped pid {:?}: {:?}", pid, stop);
            match tokio::time::timeout(opts.kill_grace, child.wait()).await {
                Ok(status) => Some(status?),
                Err(_) => {
                    warn!("pid {:?} survived the group kill, killing directly", pid);
                    let _ = child.start_kill();
                    tokio::time::timeout(opts.kill_grace, child.wait())
                        .await
                        .ok()
                        .and_then(|status| status.ok())
                }
            }
        }
    };

    if let Some(task) = stdin_task {
        task.abort();
    }
    let stdout = collect(stdout_task, opts.kill_grace, "stdout").await;
    let stderr = collect(stderr_task, opts.kill_grace, "stderr").await;

    let watch_peak = peaks.resident_bytes();
    let cpu_peak = opts.watch.map(|_| peaks.max_cpu());

    Ok(Supervised {
        status,
        stop,
        stdout,
        stderr,
        duration,
        watch_peak,
        cpu_peak,
    })
}

async fn collect(
    task: JoinHandle<std::io::Result<CapturedOutput>>,
    grace: Duration,
    stream: &str,
) -> CapturedOutput {
    let abort = task.abort_handle();
    match tokio::time::timeout(grace, task).await {
        Ok(Ok(Ok(captured))) => captured,
        Ok(Ok(Err(e))) => {
            warn!("Reading {} failed: {}", stream, e);
            CapturedOutput::default()
        }
        Ok(Err(e)) => {
            warn!("{} reader task failed: {}", stream, e);
            CapturedOutput::default()
        }
        Err(_) => {
            // Something outside the process group still holds the pipe
            warn!("{} still open after the kill, discarding", stream);
            abort.abort();
            CapturedOutput::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_sh(script: &str) -> Child {
        Command::new("/bin/sh")
            .args(["-c", script])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    fn options<'a>(
        limits: &'a ResourceLimits,
        stdin: Option<&'a [u8]>,
        cancel: &'a CancellationToken,
    ) -> Supervision<'a> {
        Supervision {
            limits,
            stdin,
            cancel,
            watch: None,
            kill_grace: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_stdin_echoed_and_exit_code() {
        let limits = ResourceLimits::default();
        let cancel = CancellationToken::new();
        let child = spawn_sh("cat; echo oops >&2; exit 3");

        let result = supervise(child, options(&limits, Some(b"hello"), &cancel), |_| {})
            .await
            .unwrap();

        assert_eq!(result.stdout.bytes, b"hello");
        assert_eq!(result.stderr.bytes, b"oops\n");
        assert_eq!(result.exit_code(), Some(3));
        assert_eq!(result.stop, None);
    }

    #[tokio::test]
    async fn test_wall_clock_stop() {
        let limits = ResourceLimits {
            wall_seconds: 1,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let child = spawn_sh("exec sleep 10");
        let pid = child.id().unwrap() as i32;

        let result = supervise(child, options(&limits, None, &cancel), move |_| {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        })
        .await
        .unwrap();

        assert_eq!(result.stop, Some(StopReason::WallClock));
        assert_eq!(result.signal(), Some(9));
        assert!(result.duration < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cancellation_stop() {
        let limits = ResourceLimits::default();
        let cancel = CancellationToken::new();
        let child = spawn_sh("exec sleep 10");
        let pid = child.id().unwrap() as i32;

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = supervise(child, options(&limits, None, &cancel), move |_| {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        })
        .await
        .unwrap();

        assert_eq!(result.stop, Some(StopReason::Cancelled));
        assert!(result.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_tree_watch_stops_fork_fan_out() {
        let limits = ResourceLimits::default();
        let cancel = CancellationToken::new();
        let child = Command::new("/bin/sh")
            .args(["-c", "sleep 5 & sleep 5 & sleep 5 & wait"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pgid = child.id().unwrap() as i32;

        let mut opts = options(&limits, None, &cancel);
        opts.watch = Some(TreeWatch {
            interval: Duration::from_millis(5),
            supervisor_levels: 0,
            limits: TreeLimits {
                memory_bytes: None,
                max_processes: Some(2),
            },
        });
        let result = supervise(child, opts, move |_| {
            let _ = nix::sys::signal::killpg(
                nix::unistd::Pid::from_raw(pgid),
                nix::sys::signal::Signal::SIGKILL,
            );
        })
        .await
        .unwrap();

        assert_eq!(result.stop, Some(StopReason::ProcessLimit));
        assert!(result.cpu_peak.is_some());
        assert!(result.duration < Duration::from_secs(4));
    }
}
