//! Resource limiter
//!
//! Hard ceilings applied to every process a job launches:
//! - CPU seconds, memory bytes and wall-clock seconds
//! - Captured output per stream (crossing the cap stops the process)
//! - Process count, open files and file size
//!
//! Limits are never retried. A job that crosses one is terminated and the
//! crossing is reported in its result.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;

use crate::error::ExecError;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

/// Resource caps for a single process launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU time in seconds
    pub cpu_seconds: u64,
    /// Memory ceiling in bytes
    pub memory_bytes: u64,
    /// Wall-clock time in seconds
    pub wall_seconds: u64,
    /// Captured bytes per output stream
    pub output_bytes: usize,
    /// Maximum number of processes
    pub max_processes: u32,
    /// Maximum open files
    pub max_open_files: u32,
    /// Maximum size of any file written
    pub max_file_size_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_seconds: 5,
            memory_bytes: 256 * MIB,
            wall_seconds: 10,
            output_bytes: 64 * KIB as usize,
            max_processes: 64,
            max_open_files: 256,
            max_file_size_bytes: 256 * MIB,
        }
    }
}

impl ResourceLimits {
    /// Limits for the compile stage. Compilers are trusted binaries but still bounded.
    pub fn compile_defaults() -> Self {
        Self {
            cpu_seconds: 30,
            memory_bytes: 2048 * MIB,
            wall_seconds: 60,
            output_bytes: MIB as usize,
            max_processes: 128,
            max_open_files: 256,
            max_file_size_bytes: 256 * MIB,
        }
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_secs(self.wall_seconds)
    }

    /// Reject caps that would make every launch fail immediately
    pub fn validate(&self) -> Result<(), ExecError> {
        let zero = [
            ("cpu_seconds", self.cpu_seconds == 0),
            ("memory_bytes", self.memory_bytes == 0),
            ("wall_seconds", self.wall_seconds == 0),
            ("output_bytes", self.output_bytes == 0),
            ("max_processes", self.max_processes == 0),
            ("max_open_files", self.max_open_files == 0),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ExecError::InvalidLimits(format!("{} must be positive", name)));
        }
        Ok(())
    }

    /// Clamp every cap to the corresponding ceiling
    pub fn clamp_to(&self, ceiling: &ResourceLimits) -> Self {
        Self {
            cpu_seconds: self.cpu_seconds.min(ceiling.cpu_seconds),
            memory_bytes: self.memory_bytes.min(ceiling.memory_bytes),
            wall_seconds: self.wall_seconds.min(ceiling.wall_seconds),
            output_bytes: self.output_bytes.min(ceiling.output_bytes),
            max_processes: self.max_processes.min(ceiling.max_processes),
            max_open_files: self.max_open_files.min(ceiling.max_open_files),
            max_file_size_bytes: self.max_file_size_bytes.min(ceiling.max_file_size_bytes),
        }
    }
}

/// Per-submission overrides of the recognised limit options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_bytes: Option<usize>,
}

impl LimitOverrides {
    pub fn apply(&self, base: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            cpu_seconds: self.cpu_seconds.unwrap_or(base.cpu_seconds),
            memory_bytes: self.memory_bytes.unwrap_or(base.memory_bytes),
            wall_seconds: self.wall_seconds.unwrap_or(base.wall_seconds),
            output_bytes: self.output_bytes.unwrap_or(base.output_bytes),
            ..*base
        }
    }
}

/// Limits applied by the coordinator: defaults, ceilings for overrides, and compile limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    pub defaults: ResourceLimits,
    pub ceilings: ResourceLimits,
    pub compile: ResourceLimits,
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            defaults: ResourceLimits::default(),
            ceilings: ResourceLimits {
                cpu_seconds: 30,
                memory_bytes: 1024 * MIB,
                wall_seconds: 60,
                output_bytes: MIB as usize,
                ..ResourceLimits::default()
            },
            compile: ResourceLimits::compile_defaults(),
        }
    }
}

impl LimitPolicy {
    /// Resolve the run-stage limits for a submission's overrides
    pub fn resolve(&self, overrides: &LimitOverrides) -> Result<ResourceLimits, ExecError> {
        let limits = overrides.apply(&self.defaults).clamp_to(&self.ceilings);
        limits.validate()?;
        Ok(limits)
    }
}

/// Bytes captured from one output stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    /// The stream produced more than the cap; `bytes` holds the first `cap` bytes
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Build from an already complete buffer, keeping at most `cap` bytes
    pub fn from_bytes(mut bytes: Vec<u8>, cap: usize) -> Self {
        let truncated = bytes.len() > cap;
        bytes.truncate(cap);
        Self { bytes, truncated }
    }
}

/// Read a stream until EOF keeping at most `cap` bytes.
///
/// The first time the cap is crossed `overflow` is notified and reading stops,
/// so the writer sees a closed pipe.
pub async fn read_capped<R>(mut reader: R, cap: usize, overflow: Arc<Notify>) -> io::Result<CapturedOutput>
where
    R: AsyncRead + Unpin,
{
    let mut captured = CapturedOutput::default();
    let mut buf = [0u8; 8192];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        let room = cap.saturating_sub(captured.bytes.len());
        if n > room {
            captured.bytes.extend_from_slice(&buf[..room]);
            captured.truncated = true;
            overflow.notify_one();
            break;
        }
        captured.bytes.extend_from_slice(&buf[..n]);
    }

    Ok(captured)
}
