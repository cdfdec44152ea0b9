//! Submission and result types shared by the coordinator and its callers

use serde::{Deserialize, Serialize};

use crate::error::CompileError;
use crate::languages::Language;
use crate::limits::LimitOverrides;

/// Source code to build and run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub language: Language,
    /// Written verbatim; may be empty
    pub source: String,
    /// Bytes fed to the program's stdin; `None` means an empty stdin
    pub stdin: Option<Vec<u8>>,
    pub limits: LimitOverrides,
}

impl Submission {
    pub fn new(language: Language, source: impl Into<String>) -> Self {
        Self {
            language,
            source: source.into(),
            stdin: None,
            limits: LimitOverrides::default(),
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = limits;
        self
    }
}

/// Result of running a program that was launched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Process exit code, or 128 + signal number when killed by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub out_of_memory: bool,
    /// Output crossed the cap and was cut off
    pub output_truncated: bool,
    /// The job was cancelled while the program ran
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_peak_bytes: Option<u64>,
    /// Cleanup problems noticed after the run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Ways a launched program can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    RuntimeFault,
    TimeoutExceeded,
    MemoryExceeded,
}

impl ExecutionResult {
    /// Classify the run. `None` means the program exited with status 0 within its limits.
    pub fn fault(&self) -> Option<Fault> {
        if self.timed_out {
            Some(Fault::TimeoutExceeded)
        } else if self.out_of_memory {
            Some(Fault::MemoryExceeded)
        } else if self.exit_code != 0 {
            Some(Fault::RuntimeFault)
        } else {
            None
        }
    }

    pub fn is_success(&self) -> bool {
        self.fault().is_none() && !self.cancelled
    }
}

/// What a submission produced: a run result, or the toolchain's rejection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Executed(ExecutionResult),
    CompileFailed(CompileError),
}

impl JobOutcome {
    pub fn execution(&self) -> Option<&ExecutionResult> {
        match self {
            JobOutcome::Executed(result) => Some(result),
            JobOutcome::CompileFailed(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_priority() {
        let mut result = ExecutionResult {
            exit_code: 137,
            signal: Some(9),
            ..Default::default()
        };
        assert_eq!(result.fault(), Some(Fault::RuntimeFault));

        result.out_of_memory = true;
        assert_eq!(result.fault(), Some(Fault::MemoryExceeded));

        result.timed_out = true;
        assert_eq!(result.fault(), Some(Fault::TimeoutExceeded));
    }

    #[test]
    fn test_clean_exit_is_success() {
        let result = ExecutionResult::default();
        assert!(result.is_success());

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("signal").is_none());
        assert!(json.get("warnings").is_none());
    }
}
