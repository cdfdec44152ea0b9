//! Process-tree watchdog
//!
//! A stage is the tree of processes under the spawned child. The tree is rebuilt
//! from `/proc/<pid>/stat` parent links on every sample, so processes that
//! started their own session are still counted.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// The fields of `/proc/<pid>/stat` the watchdog uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: u32,
    pub ppid: u32,
    /// utime + stime, in clock ticks
    pub cpu_ticks: u64,
}

pub fn parse_stat(content: &str) -> Option<ProcStat> {
    // comm may contain spaces and parentheses, so split on the last ')'
    let (head, rest) = content.rsplit_once(')')?;
    let pid = head.split_whitespace().next()?.parse().ok()?;

    // rest starts at field 3 (state)
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let ppid = fields.get(1)?.parse().ok()?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;

    Some(ProcStat {
        pid,
        ppid,
        cpu_ticks: utime.saturating_add(stime),
    })
}

/// Resident pages not backed by a file, from `/proc/<pid>/statm`
pub fn parse_statm_anon_pages(content: &str) -> Option<u64> {
    let mut fields = content.split_whitespace().skip(1);
    let resident: u64 = fields.next()?.parse().ok()?;
    let shared: u64 = fields.next()?.parse().ok()?;
    Some(resident.saturating_sub(shared))
}

pub fn scan_processes() -> Vec<ProcStat> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };

    entries
        .flatten()
        .filter_map(|entry| {
            let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
            let content = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
            parse_stat(&content)
        })
        .collect()
}

/// Processes more than `skip` levels below `root`. `root` itself is never included.
pub fn descendants(processes: &[ProcStat], root: u32, skip: usize) -> Vec<ProcStat> {
    let mut children: HashMap<u32, Vec<&ProcStat>> = HashMap::new();
    for process in processes {
        children.entry(process.ppid).or_default().push(process);
    }

    let mut seen = HashSet::from([root]);
    let mut found = Vec::new();
    let mut level = vec![root];
    let mut depth = 0;

    while !level.is_empty() {
        depth += 1;
        let mut next = Vec::new();
        for pid in level {
            for child in children.get(&pid).into_iter().flatten() {
                if !seen.insert(child.pid) {
                    continue;
                }
                if depth > skip {
                    found.push(**child);
                }
                next.push(child.pid);
            }
        }
        level = next;
    }
    found
}

/// One sample of a process tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeUsage {
    /// Processes, not threads
    pub processes: usize,
    pub resident_bytes: u64,
    /// CPU time of the busiest single process
    pub max_cpu: Duration,
}

struct Sampler {
    page_size: u64,
    ticks_per_second: u64,
}

impl Sampler {
    fn new() -> Self {
        // SAFETY: sysconf has no preconditions
        let (page_size, ticks) = unsafe {
            (
                libc::sysconf(libc::_SC_PAGESIZE),
                libc::sysconf(libc::_SC_CLK_TCK),
            )
        };
        Self {
            page_size: u64::try_from(page_size).unwrap_or(4096).max(1),
            ticks_per_second: u64::try_from(ticks).unwrap_or(100).max(1),
        }
    }

    fn sample(&self, root: u32, skip: usize) -> TreeUsage {
        let members = descendants(&scan_processes(), root, skip);

        let anon_pages: u64 = members
            .iter()
            .filter_map(|p| fs::read_to_string(format!("/proc/{}/statm", p.pid)).ok())
            .filter_map(|content| parse_statm_anon_pages(&content))
            .sum();
        let max_ticks = members.iter().map(|p| p.cpu_ticks).max().unwrap_or(0);

        TreeUsage {
            processes: members.len(),
            resident_bytes: anon_pages.saturating_mul(self.page_size),
            max_cpu: Duration::from_micros(
                max_ticks.saturating_mul(1_000_000) / self.ticks_per_second,
            ),
        }
    }
}

/// Caps the watchdog enforces itself. `None` leaves the resource to the cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeLimits {
    pub memory_bytes: Option<u64>,
    pub max_processes: Option<u32>,
}

/// Which cap the tree crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exceeded {
    Memory,
    Processes,
}

/// Highest values seen across the samples of one stage
#[derive(Debug, Default)]
pub struct TreePeaks {
    resident_bytes: AtomicU64,
    cpu_micros: AtomicU64,
}

impl TreePeaks {
    fn record(&self, usage: &TreeUsage) {
        self.resident_bytes
            .fetch_max(usage.resident_bytes, Ordering::Relaxed);
        let micros = u64::try_from(usage.max_cpu.as_micros()).unwrap_or(u64::MAX);
        self.cpu_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn resident_bytes(&self) -> Option<u64> {
        Some(self.resident_bytes.load(Ordering::Relaxed)).filter(|&bytes| bytes > 0)
    }

    pub fn max_cpu(&self) -> Duration {
        Duration::from_micros(self.cpu_micros.load(Ordering::Relaxed))
    }
}

/// Sample the tree below `root` every `interval` and resolve once it crosses
/// one of `limits`. The first `skip` levels belong to the stage supervisor and
/// are not accounted. Never resolves when no limit is set, so it can sit in a
/// `select!` next to the exit future and still keep `peaks` current.
pub async fn watch_tree(
    root: u32,
    skip: usize,
    limits: TreeLimits,
    interval: Duration,
    peaks: &TreePeaks,
) -> Exceeded {
    let sampler = Sampler::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let usage = sampler.sample(root, skip);
        peaks.record(&usage);

        if limits
            .memory_bytes
            .is_some_and(|limit| usage.resident_bytes >= limit)
        {
            return Exceeded::Memory;
        }
        if limits
            .max_processes
            .is_some_and(|limit| usage.processes > limit as usize)
        {
            return Exceeded::Processes;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(pid: u32, ppid: u32) -> ProcStat {
        ProcStat {
            pid,
            ppid,
            cpu_ticks: pid as u64,
        }
    }

    #[test]
    fn test_parse_stat() {
        let content = "4242 (my (odd) prog) S 4200 4242 4242 0 -1 4194560 120 0 0 0 37 5 0 0 20 0 1 0 998 4603904 230 18446744073709551615\n";
        let parsed = parse_stat(content).unwrap();
        assert_eq!(parsed.pid, 4242);
        assert_eq!(parsed.ppid, 4200);
        assert_eq!(parsed.cpu_ticks, 42);
    }

    #[test]
    fn test_parse_stat_truncated() {
        assert_eq!(parse_stat("17 (sh) S 1"), None);
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn test_parse_statm_anon_pages() {
        assert_eq!(parse_statm_anon_pages("5000 1200 300 20 0 900 0\n"), Some(900));
        assert_eq!(parse_statm_anon_pages("5000"), None);
    }

    #[test]
    fn test_descendants_skip_supervisor_levels() {
        // 10 -> 11 -> 12 -> {13, 14}; 14 started its own session but keeps its parent link
        let processes = [
            stat(1, 0),
            stat(10, 1),
            stat(11, 10),
            stat(12, 11),
            stat(13, 12),
            stat(14, 12),
            stat(99, 1),
        ];

        let all: Vec<u32> = descendants(&processes, 10, 0).iter().map(|p| p.pid).collect();
        assert_eq!(all, vec![11, 12, 13, 14]);

        let program: Vec<u32> = descendants(&processes, 10, 1).iter().map(|p| p.pid).collect();
        assert_eq!(program, vec![12, 13, 14]);

        assert!(descendants(&processes, 99, 0).is_empty());
    }

    #[test]
    fn test_descendants_tolerate_parent_cycles() {
        // pid reuse between reads can produce a loop
        let processes = [stat(20, 21), stat(21, 20)];
        let found: Vec<u32> = descendants(&processes, 20, 0).iter().map(|p| p.pid).collect();
        assert_eq!(found, vec![21]);
    }

    #[tokio::test]
    async fn test_watch_trips_on_child_memory() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let peaks = TreePeaks::default();
        let limits = TreeLimits {
            memory_bytes: Some(1),
            max_processes: None,
        };

        let exceeded = tokio::time::timeout(
            Duration::from_secs(2),
            watch_tree(std::process::id(), 0, limits, Duration::from_millis(5), &peaks),
        )
        .await;
        let _ = child.kill();
        let _ = child.wait();

        assert_eq!(exceeded.expect("watchdog should trip"), Exceeded::Memory);
        assert!(peaks.resident_bytes().is_some());
    }

    #[tokio::test]
    async fn test_watch_trips_on_process_count() {
        let mut children: Vec<_> = (0..3)
            .map(|_| std::process::Command::new("sleep").arg("5").spawn().unwrap())
            .collect();
        let peaks = TreePeaks::default();
        let limits = TreeLimits {
            memory_bytes: None,
            max_processes: Some(2),
        };

        let exceeded = tokio::time::timeout(
            Duration::from_secs(2),
            watch_tree(std::process::id(), 0, limits, Duration::from_millis(5), &peaks),
        )
        .await;
        for child in &mut children {
            let _ = child.kill();
            let _ = child.wait();
        }

        assert_eq!(exceeded.expect("watchdog should trip"), Exceeded::Processes);
    }
}
