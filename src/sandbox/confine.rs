//! Child-side confinement installed between fork and exec
//!
//! The spawned child is the stage supervisor. It starts a new session, joins the
//! job cgroup, applies rlimits and enters fresh user, mount and PID namespaces,
//! plus a network namespace unless network access is allowed. Inside the mount
//! namespace every mount is remounted read-only and only the workspace stays
//! writable.
//!
//! The supervisor then forks the namespace init, which forks the program. Init
//! exits as soon as the program does, and the kernel kills whatever is left in
//! the namespace, including processes that moved to a session of their own.
//! The supervisor exits with the program's wait status, so the parent sees the
//! program's exit code or signal.
//!
//! A step that must not fail reports `ENOTRECOVERABLE` so the parent can tell a
//! confinement failure apart from an ordinary spawn error.

use std::ffi::{CStr, CString, OsStr};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::prctl;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::Signal;
use nix::unistd::{chdir, fork, setsid, ForkResult, Pid};

use super::NetworkPolicy;
use crate::limits::{ResourceLimits, MIB};

/// Raw OS error the child returns when confinement could not be applied
pub(crate) const CONFINEMENT_FAILED: i32 = Errno::ENOTRECOVERABLE as i32;

/// Processes every stage carries besides the program: supervisor and namespace init
pub(crate) const SUPERVISOR_PROCESSES: u32 = 2;

/// Levels of the stage tree between the spawned child and the program
pub(crate) const SUPERVISOR_LEVELS: usize = 1;

struct Remount {
    target: CString,
    /// Per-mount flags a user namespace is not allowed to clear
    keep: MsFlags,
    required: bool,
}

/// Read-only view of the host mounts with one writable workspace
pub(crate) struct MountJail {
    workspace: CString,
    remounts: Vec<Remount>,
}

impl MountJail {
    pub(crate) fn new(workspace: &Path) -> io::Result<Self> {
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
        Self::from_mountinfo(workspace, &mountinfo)
    }

    fn from_mountinfo(workspace: &Path, mountinfo: &str) -> io::Result<Self> {
        let mut remounts = Vec::new();
        for (target, keep) in parse_mountinfo(mountinfo) {
            let path = Path::new(OsStr::from_bytes(&target));
            if path.starts_with(workspace) {
                continue;
            }
            // proc and sysfs submounts may refuse a remount; they are kernel interfaces
            let required = !(path.starts_with("/proc") || path.starts_with("/sys"));
            remounts.push(Remount {
                target: c_path(target)?,
                keep,
                required,
            });
        }

        if !remounts.iter().any(|r| r.target.as_bytes() == b"/") {
            remounts.push(Remount {
                target: c_path(b"/".to_vec())?,
                keep: MsFlags::empty(),
                required: true,
            });
        }

        Ok(Self {
            workspace: c_path(workspace.as_os_str().as_bytes().to_vec())?,
            remounts,
        })
    }

    /// Runs in the child after the mount namespace exists. Allocates nothing.
    fn enter(&self) -> nix::Result<()> {
        mount(
            None::<&CStr>,
            c"/",
            None::<&CStr>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&CStr>,
        )?;

        // The workspace becomes its own mount, untouched by the remounts below
        mount(
            Some(self.workspace.as_c_str()),
            self.workspace.as_c_str(),
            None::<&CStr>,
            MsFlags::MS_BIND,
            None::<&CStr>,
        )?;

        for remount in &self.remounts {
            let flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY | remount.keep;
            let result = mount(
                None::<&CStr>,
                remount.target.as_c_str(),
                None::<&CStr>,
                flags,
                None::<&CStr>,
            );
            if remount.required {
                result?;
            }
        }

        // The inherited working directory still resolves through the read-only mount
        chdir(self.workspace.as_c_str())
    }
}

fn c_path(bytes: Vec<u8>) -> io::Result<CString> {
    CString::new(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Mount points and the flags to keep, from `/proc/self/mountinfo`
fn parse_mountinfo(content: &str) -> Vec<(Vec<u8>, MsFlags)> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(' ');
            let target = fields.nth(4)?;
            let options = fields.next()?;
            Some((unescape_mount_path(target), kept_flags(options)))
        })
        .collect()
}

/// The kernel writes space, tab, newline and backslash as `\ooo`
fn unescape_mount_path(field: &str) -> Vec<u8> {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(byte) = bytes.get(i + 1..i + 4).and_then(octal_byte) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn octal_byte(digits: &[u8]) -> Option<u8> {
    digits.iter().try_fold(0u32, |acc, &d| match d {
        b'0'..=b'7' => Some(acc * 8 + u32::from(d - b'0')),
        _ => None,
    })
    .and_then(|value| u8::try_from(value).ok())
}

fn kept_flags(options: &str) -> MsFlags {
    options
        .split(',')
        .fold(MsFlags::empty(), |flags, option| {
            flags
                | match option {
                    "nosuid" => MsFlags::MS_NOSUID,
                    "nodev" => MsFlags::MS_NODEV,
                    "noexec" => MsFlags::MS_NOEXEC,
                    "noatime" => MsFlags::MS_NOATIME,
                    "nodiratime" => MsFlags::MS_NODIRATIME,
                    "relatime" => MsFlags::MS_RELATIME,
                    "strictatime" => MsFlags::MS_STRICTATIME,
                    _ => MsFlags::empty(),
                }
        })
}

pub(crate) struct Confinement {
    rlimits: Vec<(Resource, u64, u64)>,
    network: NetworkPolicy,
    cgroup_procs: Option<File>,
    jail: MountJail,
}

impl Confinement {
    pub(crate) fn new(
        limits: &ResourceLimits,
        limit_address_space: bool,
        network: NetworkPolicy,
        jail: MountJail,
    ) -> Self {
        let mut rlimits = vec![
            // SIGXCPU at the cap, SIGKILL one second later
            (Resource::RLIMIT_CPU, limits.cpu_seconds, limits.cpu_seconds + 1),
            (
                Resource::RLIMIT_FSIZE,
                limits.max_file_size_bytes,
                limits.max_file_size_bytes,
            ),
            (
                Resource::RLIMIT_NOFILE,
                limits.max_open_files as u64,
                limits.max_open_files as u64,
            ),
            (Resource::RLIMIT_CORE, 0, 0),
        ];

        if limit_address_space {
            let backstop = address_space_backstop(limits.memory_bytes);
            rlimits.push((Resource::RLIMIT_AS, backstop, backstop));
        }

        Self {
            rlimits,
            network,
            cgroup_procs: None,
            jail,
        }
    }

    /// Join the job cgroup before exec through this open `cgroup.procs` handle
    pub(crate) fn with_cgroup(mut self, procs: File) -> Self {
        self.cgroup_procs = Some(procs);
        self
    }

    pub(crate) fn install(self, cmd: &mut tokio::process::Command) {
        let Confinement {
            rlimits,
            network,
            cgroup_procs,
            jail,
        } = self;

        // SAFETY: the closure only issues syscalls and allocates nothing. The
        // supervisor and init never return into the standard library.
        unsafe {
            cmd.pre_exec(move || {
                // Opened first, while RLIMIT_NOFILE is still the parent's
                let (status_read, status_write) = status_pipe().map_err(|_| confinement_failed())?;
                if !close_range(RawFd::MAX, RawFd::MAX) {
                    return Err(confinement_failed());
                }

                setsid().map_err(|_| confinement_failed())?;
                prctl::set_pdeathsig(Signal::SIGKILL).map_err(|_| confinement_failed())?;

                if let Some(procs) = cgroup_procs.as_ref() {
                    let mut procs: &File = procs;
                    procs.write_all(b"0").map_err(|_| confinement_failed())?;
                }

                for &(resource, soft, hard) in &rlimits {
                    setrlimit(resource, soft, hard).map_err(|_| confinement_failed())?;
                }

                unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID)
                    .map_err(|_| confinement_failed())?;
                match network {
                    NetworkPolicy::Allow => {}
                    NetworkPolicy::Deny => {
                        unshare(CloneFlags::CLONE_NEWNET).map_err(|_| confinement_failed())?;
                    }
                    NetworkPolicy::BestEffort => {
                        let _ = unshare(CloneFlags::CLONE_NEWNET);
                    }
                }
                jail.enter().map_err(|_| confinement_failed())?;

                match fork() {
                    Ok(ForkResult::Parent { child }) => {
                        relay_program_status(child, status_read, status_write)
                    }
                    Ok(ForkResult::Child) => run_namespace_init(status_read, status_write),
                    Err(_) => Err(confinement_failed()),
                }
            });
        }
    }
}

/// PID 1 of the stage namespace. Returns only in the program process, which then execs.
fn run_namespace_init(status_read: RawFd, status_write: RawFd) -> io::Result<()> {
    prctl::set_pdeathsig(Signal::SIGKILL).map_err(|_| confinement_failed())?;
    // SAFETY: closes a descriptor this process owns
    unsafe { libc::close(status_read) };

    // SAFETY: this process is single-threaded
    let program = match unsafe { fork() } {
        // Both pipe ends are close-on-exec
        Ok(ForkResult::Child) => return Ok(()),
        Ok(ForkResult::Parent { child }) => child,
        Err(_) => return Err(confinement_failed()),
    };

    // Includes the exec status pipe, which the parent reads until every copy is closed
    close_inherited_fds(status_write);
    if let Some(status) = wait_until(-1, program) {
        let bytes = status.to_ne_bytes();
        // SAFETY: writes from a live stack buffer
        unsafe { libc::write(status_write, bytes.as_ptr().cast(), bytes.len()) };
    }
    // Exiting init kills everything else left in the namespace
    // SAFETY: _exit skips the parent's atexit handlers
    unsafe { libc::_exit(0) }
}

/// The supervisor: wait for init, then exit the way the program did
fn relay_program_status(init: Pid, status_read: RawFd, status_write: RawFd) -> ! {
    // SAFETY: closes a descriptor this process owns
    unsafe { libc::close(status_write) };
    close_inherited_fds(status_read);

    let init_status = wait_until(init.as_raw(), init);
    let mut bytes = [0u8; 4];
    // SAFETY: reads into a live stack buffer
    let read = unsafe { libc::read(status_read, bytes.as_mut_ptr().cast(), bytes.len()) };
    let status = if read == bytes.len() as isize {
        i32::from_ne_bytes(bytes)
    } else {
        // Init died before the program; report how init went
        init_status.unwrap_or(libc::SIGKILL)
    };
    exit_with_status(status)
}

/// Reap children of `wait_on` until `target` exits; its raw wait status
fn wait_until(wait_on: libc::pid_t, target: Pid) -> Option<libc::c_int> {
    loop {
        let mut status = 0;
        // SAFETY: status points to a live stack variable
        let reaped = unsafe { libc::waitpid(wait_on, &mut status, 0) };
        if reaped == target.as_raw() {
            return Some(status);
        }
        if reaped < 0 && Errno::last() != Errno::EINTR {
            return None;
        }
    }
}

fn exit_with_status(status: libc::c_int) -> ! {
    if libc::WIFSIGNALED(status) {
        let signal = libc::WTERMSIG(status);
        // SAFETY: restores the default action and delivers the signal to ourselves
        unsafe {
            libc::signal(signal, libc::SIG_DFL);
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, signal);
            libc::sigprocmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
            libc::kill(libc::getpid(), signal);
            // Only reached for signals that do not terminate by default
            libc::_exit(128 + signal)
        }
    }

    let code = if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else {
        127
    };
    // SAFETY: _exit skips the parent's atexit handlers
    unsafe { libc::_exit(code) }
}

fn status_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: fds has room for both ends
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// close_range(2); needs Linux 5.9
fn close_range(first: RawFd, last: RawFd) -> bool {
    if first > last {
        return true;
    }
    // SAFETY: only affects this process's descriptor table
    let rc = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            first as libc::c_uint,
            last as libc::c_uint,
            0 as libc::c_uint,
        )
    };
    rc == 0
}

/// Close every descriptor above stderr except `keep`
fn close_inherited_fds(keep: RawFd) {
    close_range(3, keep - 1);
    close_range(keep + 1, RawFd::MAX);
}

/// RLIMIT_AS is virtual, so leave generous headroom over the resident limit
fn address_space_backstop(memory_bytes: u64) -> u64 {
    memory_bytes
        .saturating_mul(4)
        .max(memory_bytes.saturating_add(512 * MIB))
}

fn confinement_failed() -> io::Error {
    io::Error::from_raw_os_error(CONFINEMENT_FAILED)
}

/// Whether a spawn error came from the confinement steps above
pub(crate) fn is_confinement_failure(err: &io::Error) -> bool {
    err.raw_os_error() == Some(CONFINEMENT_FAILED)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
23 28 0:22 / /proc rw,relatime - proc proc rw
28 1 254:0 / / rw,relatime - ext4 /dev/vda rw
29 28 254:16 / /mnt/tools ro,nosuid,nodev,relatime - ext4 /dev/vdb ro
31 25 0:27 / /dev/shm rw,nosuid,nodev,noexec - tmpfs tmpfs rw
40 28 0:40 / /srv/my\\040data rw,noatime - ext4 /dev/vdc rw
41 28 0:41 / /srv/coderun/job-1 rw,relatime - tmpfs tmpfs rw
";

    fn jail() -> MountJail {
        MountJail::from_mountinfo(Path::new("/srv/coderun/job-1"), MOUNTINFO).unwrap()
    }

    fn remount<'a>(jail: &'a MountJail, target: &str) -> Option<&'a Remount> {
        jail.remounts
            .iter()
            .find(|r| r.target.as_bytes() == target.as_bytes())
    }

    #[test]
    fn test_backstop_headroom() {
        assert_eq!(address_space_backstop(64 * MIB), 576 * MIB);
        assert_eq!(address_space_backstop(1024 * MIB), 4096 * MIB);
    }

    #[test]
    fn test_cpu_hard_limit_one_second_above() {
        let limits = ResourceLimits {
            cpu_seconds: 3,
            ..Default::default()
        };
        let confinement = Confinement::new(&limits, false, NetworkPolicy::Allow, jail());

        let cpu = confinement
            .rlimits
            .iter()
            .find(|(resource, _, _)| *resource == Resource::RLIMIT_CPU)
            .unwrap();
        assert_eq!((cpu.1, cpu.2), (3, 4));
        assert!(!confinement
            .rlimits
            .iter()
            .any(|(resource, _, _)| *resource == Resource::RLIMIT_AS));
    }

    #[test]
    fn test_confinement_error_is_recognised() {
        assert!(is_confinement_failure(&confinement_failed()));
        assert!(!is_confinement_failure(&io::Error::from(io::ErrorKind::NotFound)));
    }

    #[test]
    fn test_every_mount_but_the_workspace_goes_read_only() {
        let jail = jail();
        assert_eq!(jail.workspace.as_bytes(), b"/srv/coderun/job-1");
        assert!(remount(&jail, "/srv/coderun/job-1").is_none());

        let root = remount(&jail, "/").unwrap();
        assert!(root.required);
        assert_eq!(root.keep, MsFlags::MS_RELATIME);

        let tools = remount(&jail, "/mnt/tools").unwrap();
        assert_eq!(
            tools.keep,
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_RELATIME
        );
        let shm = remount(&jail, "/dev/shm").unwrap();
        assert!(shm.required);
        assert!(shm.keep.contains(MsFlags::MS_NOEXEC));

        assert!(!remount(&jail, "/proc").unwrap().required);
        assert_eq!(
            remount(&jail, "/srv/my data").unwrap().keep,
            MsFlags::MS_NOATIME
        );
    }

    #[test]
    fn test_root_added_when_missing() {
        let jail = MountJail::from_mountinfo(Path::new("/w"), "").unwrap();
        assert_eq!(jail.remounts.len(), 1);
        assert_eq!(jail.remounts[0].target.as_bytes(), b"/");
    }

    #[test]
    fn test_unescape_mount_path() {
        assert_eq!(unescape_mount_path("/a\\040b\\134c"), b"/a b\\c");
        // Not an escape: too short or not octal
        assert_eq!(unescape_mount_path("/x\\04"), b"/x\\04");
        assert_eq!(unescape_mount_path("/x\\9aa"), b"/x\\9aa");
    }

    #[test]
    fn test_current_mount_table_parses() {
        let jail = MountJail::new(Path::new("/nonexistent-workspace")).unwrap();
        assert!(jail.remounts.iter().any(|r| r.target.as_bytes() == b"/"));
    }
}
