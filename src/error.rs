//! Error taxonomy
//!
//! Only [`ExecError::IsolationBreach`] is fatal to the worker. Everything else
//! either resolves into a well-formed result (compile errors, runtime faults,
//! timeouts, memory exhaustion, cleanup warnings) or fails a single job.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The toolchain rejected the source. `diagnostics` is the compiler output, verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("compilation failed")]
pub struct CompileError {
    pub diagnostics: String,
}

impl CompileError {
    pub fn new(diagnostics: impl Into<String>) -> Self {
        Self {
            diagnostics: diagnostics.into(),
        }
    }
}

/// Teardown of a workspace could not fully complete.
///
/// This is a warning: it is logged and attached to the result, it never fails the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupIncomplete {
    pub workspace: String,
    pub detail: String,
}

impl fmt::Display for CleanupIncomplete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cleanup incomplete for {}: {}", self.workspace, self.detail)
    }
}

/// Errors raised by an isolation boundary or one of its workspaces
#[derive(Debug, Error)]
pub enum SandboxError {
    /// A confinement assumption was violated
    #[error("isolation breach: {0}")]
    IsolationBreach(String),
    /// A toolchain binary could not be found on the host
    #[error("toolchain not available: {0}")]
    ToolchainMissing(String),
    /// The sandbox could not be prepared
    #[error("sandbox setup failed: {0}")]
    Setup(String),
    #[error("workspace I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by the execution coordinator
#[derive(Debug, Error)]
pub enum ExecError {
    /// Fatal: the worker must stop and an operator must look at the host
    #[error("isolation breach: {0}")]
    IsolationBreach(String),
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("invalid limits: {0}")]
    InvalidLimits(String),
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),
    #[error(transparent)]
    System(#[from] anyhow::Error),
}

impl ExecError {
    /// Whether this error must abort the whole worker process
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecError::IsolationBreach(_))
    }
}

impl From<SandboxError> for ExecError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::IsolationBreach(reason) => ExecError::IsolationBreach(reason),
            other => ExecError::System(anyhow::Error::new(other)),
        }
    }
}

/// Configuration could not be loaded
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse language table: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    pub fn invalid(key: &str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_breach_is_fatal() {
        assert!(ExecError::IsolationBreach("escaped".into()).is_fatal());
        assert!(!ExecError::UnsupportedLanguage("cobol".into()).is_fatal());
        assert!(!ExecError::System(anyhow::anyhow!("redis down")).is_fatal());
    }

    #[test]
    fn test_sandbox_breach_stays_fatal() {
        let err: ExecError = SandboxError::IsolationBreach("workspace outside root".into()).into();
        assert!(err.is_fatal());

        let err: ExecError = SandboxError::ToolchainMissing("gcc".into()).into();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("gcc"));
    }

    #[test]
    fn test_cleanup_warning_display() {
        let warning = CleanupIncomplete {
            workspace: "job-1-0".into(),
            detail: "process group 42 survived SIGKILL".into(),
        };
        assert_eq!(
            warning.to_string(),
            "cleanup incomplete for job-1-0: process group 42 survived SIGKILL"
        );
    }
}
