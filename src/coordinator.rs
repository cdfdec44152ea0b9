//! Execution coordinator
//!
//! Drives one submission end-to-end:
//! `Pending -> Compiling -> Running -> Completed`, with `Compiling -> Failed`
//! and `Running -> Failed`. The workspace is released on every terminal state.
//! Jobs share nothing but the read-only language table and the boundary.

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::compiler::{compile, CompileOutcome};
use crate::error::ExecError;
use crate::languages::{LanguageConfig, LanguageTable};
use crate::limits::{LimitPolicy, ResourceLimits};
use crate::runner::run;
use crate::sandbox::{IsolationBoundary, JobToken, Workspace, WorkspaceGuard};
use crate::types::{ExecutionResult, JobOutcome, Submission};

/// Lifecycle of one execution job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Compiling,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Compiling)
                | (Pending, Failed)
                | (Compiling, Running)
                | (Compiling, Failed)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// A submission in flight, owned by the coordinator until its result is assembled
#[derive(Debug)]
pub struct ExecutionJob {
    pub submission: Submission,
    pub token: JobToken,
    pub started: Instant,
    state: JobState,
}

impl ExecutionJob {
    pub fn new(submission: Submission) -> Self {
        Self {
            submission,
            token: JobToken::generate(),
            started: Instant::now(),
            state: JobState::Pending,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn advance(&mut self, next: JobState) -> Result<(), ExecError> {
        if !self.state.can_transition_to(next) {
            return Err(ExecError::System(anyhow!(
                "illegal job transition {:?} -> {:?} for {}",
                self.state,
                next,
                self.token
            )));
        }
        debug!("[{}] {:?} -> {:?}", self.token, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Mark the job failed from whatever non-terminal state it is in
    fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = JobState::Failed;
        }
    }
}

pub struct Coordinator {
    boundary: Arc<dyn IsolationBoundary>,
    languages: Arc<LanguageTable>,
    policy: LimitPolicy,
}

impl Coordinator {
    pub fn new(
        boundary: Arc<dyn IsolationBoundary>,
        languages: Arc<LanguageTable>,
        policy: LimitPolicy,
    ) -> Self {
        Self {
            boundary,
            languages,
            policy,
        }
    }

    pub fn languages(&self) -> &LanguageTable {
        &self.languages
    }

    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    /// Compile and run one submission in a fresh workspace.
    ///
    /// Exactly one of `Executed` or `CompileFailed` comes back for every
    /// submission that reaches the toolchain. `Err` means the job could not be
    /// carried out at all; only `ExecError::IsolationBreach` is fatal.
    pub async fn execute(
        &self,
        submission: Submission,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, ExecError> {
        let config = self
            .languages
            .get(submission.language)
            .ok_or_else(|| ExecError::UnsupportedLanguage(submission.language.to_string()))?;
        let run_limits = config.scale_limits(&self.policy.resolve(&submission.limits)?);

        let mut job = ExecutionJob::new(submission);
        info!(
            "[{}] Executing {} submission ({} bytes of source, {} on {})",
            job.token,
            job.submission.language,
            job.submission.source.len(),
            self.boundary.name(),
            if job.submission.stdin.is_some() { "stdin" } else { "empty stdin" }
        );

        let mut guard = match WorkspaceGuard::acquire(self.boundary.as_ref(), &job.token).await {
            Ok(guard) => guard,
            Err(e) => {
                job.fail();
                return Err(report_error(&job, e.into()));
            }
        };

        let outcome = match guard.workspace() {
            Ok(workspace) => self.drive(&mut job, workspace, config, &run_limits, &cancel).await,
            Err(e) => Err(e.into()),
        };
        let report = guard.release().await;

        match outcome {
            Ok(JobOutcome::Executed(mut result)) => {
                result
                    .warnings
                    .extend(report.warnings.iter().map(|w| w.to_string()));
                info!(
                    "[{}] {:?}: exit {} in {}ms (timed_out: {}, out_of_memory: {}, truncated: {})",
                    job.token,
                    job.state(),
                    result.exit_code,
                    result.duration_ms,
                    result.timed_out,
                    result.out_of_memory,
                    result.output_truncated
                );
                Ok(JobOutcome::Executed(result))
            }
            Ok(JobOutcome::CompileFailed(err)) => {
                info!(
                    "[{}] Compilation failed after {}ms",
                    job.token,
                    job.started.elapsed().as_millis()
                );
                Ok(JobOutcome::CompileFailed(err))
            }
            Err(e) => {
                job.fail();
                Err(report_error(&job, e))
            }
        }
    }

    async fn drive(
        &self,
        job: &mut ExecutionJob,
        workspace: &mut dyn Workspace,
        config: &LanguageConfig,
        run_limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, ExecError> {
        job.advance(JobState::Compiling)?;
        let binary = match compile(
            workspace,
            config,
            &job.submission.source,
            &self.policy.compile,
            cancel,
        )
        .await?
        {
            CompileOutcome::Ready(binary) => binary,
            CompileOutcome::Rejected(err) => {
                job.advance(JobState::Failed)?;
                return Ok(JobOutcome::CompileFailed(err));
            }
            CompileOutcome::Cancelled(outcome) => {
                job.advance(JobState::Failed)?;
                return Ok(JobOutcome::Executed(cancelled_result(
                    outcome.duration.as_millis() as u64,
                )));
            }
        };

        if cancel.is_cancelled() {
            job.advance(JobState::Failed)?;
            return Ok(JobOutcome::Executed(cancelled_result(
                job.started.elapsed().as_millis() as u64,
            )));
        }

        job.advance(JobState::Running)?;
        let result = run(
            workspace,
            &binary,
            run_limits,
            job.submission.stdin.as_deref(),
            cancel,
        )
        .await?;

        // Timeouts and memory exhaustion are results, not failures
        let next = if result.cancelled {
            JobState::Failed
        } else {
            JobState::Completed
        };
        job.advance(next)?;
        Ok(JobOutcome::Executed(result))
    }
}

fn cancelled_result(duration_ms: u64) -> ExecutionResult {
    ExecutionResult {
        exit_code: -1,
        cancelled: true,
        duration_ms,
        ..Default::default()
    }
}

fn report_error(job: &ExecutionJob, err: ExecError) -> ExecError {
    if err.is_fatal() {
        error!("[{}] ISOLATION BREACH: {}", job.token, err);
    } else {
        error!("[{}] Job failed: {:#}", job.token, err);
    }
    err
}
