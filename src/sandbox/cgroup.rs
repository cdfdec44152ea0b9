//! Cgroup v2 accounting for the process backend
//!
//! The worker is given a delegated cgroup root. Each job gets a child cgroup
//! named after its token; every process the job starts joins it before exec.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

use super::JobToken;
use crate::error::SandboxError;
use crate::limits::ResourceLimits;

/// Counters from `memory.events`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryEvents {
    pub oom: u64,
    pub oom_kill: u64,
}

pub fn parse_memory_events(content: &str) -> MemoryEvents {
    let mut events = MemoryEvents::default();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value = value.parse::<u64>().unwrap_or(0);
        match key {
            "oom" => events.oom = value,
            "oom_kill" => events.oom_kill = value,
            _ => {}
        }
    }
    events
}

/// Delegated cgroup v2 directory under which job cgroups are created
#[derive(Debug, Clone)]
pub struct CgroupRoot {
    path: PathBuf,
}

impl CgroupRoot {
    /// Open a delegated root and enable the memory and pids controllers for children
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SandboxError> {
        let path = path.as_ref().to_path_buf();

        let controllers = fs::read_to_string(path.join("cgroup.controllers")).map_err(|e| {
            SandboxError::Setup(format!("{} is not a cgroup v2 directory: {}", path.display(), e))
        })?;
        for required in ["memory", "pids"] {
            if !controllers.split_whitespace().any(|c| c == required) {
                return Err(SandboxError::Setup(format!(
                    "controller {} not delegated to {}",
                    required,
                    path.display()
                )));
            }
        }

        let subtree = path.join("cgroup.subtree_control");
        if let Err(e) = fs::write(&subtree, "+memory +pids") {
            // Already enabled is fine; anything else shows up in the check below
            debug!("Writing {} failed: {}", subtree.display(), e);
        }
        let enabled = fs::read_to_string(&subtree)?;
        if !enabled.split_whitespace().any(|c| c == "memory") {
            return Err(SandboxError::Setup(format!(
                "cannot enable the memory controller under {}",
                path.display()
            )));
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn create(&self, token: &JobToken) -> Result<JobCgroup, SandboxError> {
        let path = self.path.join(token.as_str());
        fs::create_dir(&path)
            .map_err(|e| SandboxError::Setup(format!("create cgroup {}: {}", path.display(), e)))?;
        Ok(JobCgroup {
            path,
            oom_kills_seen: 0,
        })
    }
}

/// One job's cgroup
#[derive(Debug)]
pub struct JobCgroup {
    path: PathBuf,
    oom_kills_seen: u64,
}

impl JobCgroup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Set the caps for the next stage
    pub fn apply_limits(&self, limits: &ResourceLimits) -> Result<(), SandboxError> {
        fs::write(self.path.join("memory.max"), limits.memory_bytes.to_string())?;
        fs::write(self.path.join("pids.max"), limits.max_processes.to_string())?;

        // Optional files: swap accounting may be off, oom.group needs 4.19+
        let _ = fs::write(self.path.join("memory.swap.max"), "0");
        let _ = fs::write(self.path.join("memory.oom.group"), "1");
        Ok(())
    }

    /// Write handle to `cgroup.procs`, used by the child to join before exec
    pub fn procs_file(&self) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .open(self.path.join("cgroup.procs"))
    }

    pub fn memory_events(&self) -> io::Result<MemoryEvents> {
        let content = fs::read_to_string(self.path.join("memory.events"))?;
        Ok(parse_memory_events(&content))
    }

    /// OOM kills since the previous call
    pub fn take_oom_kills(&mut self) -> u64 {
        let total = self
            .memory_events()
            .map(|events| events.oom_kill)
            .unwrap_or(self.oom_kills_seen);
        let delta = total.saturating_sub(self.oom_kills_seen);
        self.oom_kills_seen = total;
        delta
    }

    /// `memory.peak` (5.19+), falling back to `memory.current`
    pub fn memory_peak(&self) -> Option<u64> {
        ["memory.peak", "memory.current"].iter().find_map(|file| {
            fs::read_to_string(self.path.join(file))
                .ok()
                .and_then(|content| content.trim().parse::<u64>().ok())
        })
    }

    pub fn pids(&self) -> Vec<i32> {
        fs::read_to_string(self.path.join("cgroup.procs"))
            .map(|content| {
                content
                    .lines()
                    .filter_map(|line| line.trim().parse::<i32>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.pids().is_empty()
    }

    /// SIGKILL everything in the cgroup; `cgroup.kill` needs 5.14+
    pub fn kill_all(&self) {
        if fs::write(self.path.join("cgroup.kill"), "1").is_ok() {
            return;
        }
        for pid in self.pids() {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }

    pub fn remove(&self) -> io::Result<()> {
        fs::remove_dir(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_events() {
        let content = "low 0\nhigh 0\nmax 12\noom 2\noom_kill 1\noom_group_kill 0\n";
        let events = parse_memory_events(content);
        assert_eq!(events, MemoryEvents { oom: 2, oom_kill: 1 });
    }

    #[test]
    fn test_parse_memory_events_garbage() {
        assert_eq!(parse_memory_events("oom_kill\nnonsense here\n"), MemoryEvents::default());
    }

    #[test]
    fn test_open_rejects_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = CgroupRoot::open(dir.path()).unwrap_err();
        assert!(err.to_string().contains("not a cgroup v2 directory"));
    }

    #[test]
    fn test_oom_kill_delta_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let mut cgroup = JobCgroup {
            path: dir.path().to_path_buf(),
            oom_kills_seen: 0,
        };

        fs::write(dir.path().join("memory.events"), "oom 1\noom_kill 1\n").unwrap();
        assert_eq!(cgroup.take_oom_kills(), 1);
        assert_eq!(cgroup.take_oom_kills(), 0);

        fs::write(dir.path().join("memory.events"), "oom 3\noom_kill 3\n").unwrap();
        assert_eq!(cgroup.take_oom_kills(), 2);
    }

    #[test]
    fn test_memory_peak_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let cgroup = JobCgroup {
            path: dir.path().to_path_buf(),
            oom_kills_seen: 0,
        };
        assert_eq!(cgroup.memory_peak(), None);

        fs::write(dir.path().join("memory.current"), "4096\n").unwrap();
        assert_eq!(cgroup.memory_peak(), Some(4096));
    }
}
