//! Coderun - sandboxed code execution
//!
//! Compiles and runs untrusted source code inside an isolation boundary under
//! resource limits, and reports what happened as a structured result.

pub mod compiler;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod jobs;
pub mod languages;
pub mod limits;
pub mod redis_manager;
pub mod runner;
pub mod sandbox;
pub mod types;

pub use coordinator::{Coordinator, JobState};
pub use error::{CleanupIncomplete, CompileError, ConfigError, ExecError, SandboxError};
pub use languages::{Language, LanguageConfig, LanguageTable};
pub use limits::{LimitOverrides, LimitPolicy, ResourceLimits};
pub use types::{ExecutionResult, Fault, JobOutcome, Submission};
