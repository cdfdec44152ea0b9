//! Queued run jobs: wire format and processing
//!
//! A job arrives as JSON on the queue, is turned into a [`Submission`], runs
//! through the coordinator, and leaves as a [`RunJobResult`].

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::error::ExecError;
use crate::languages::LanguageTable;
use crate::limits::LimitOverrides;
use crate::types::{ExecutionResult, JobOutcome, Submission};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJob {
    pub job_id: String,
    /// Language name or alias, e.g. `cpp` or `py`
    pub language: String,
    pub source: String,
    /// Text stdin
    #[serde(default)]
    pub stdin: Option<String>,
    /// Binary stdin, base64 encoded. Takes precedence over `stdin`.
    #[serde(default)]
    pub stdin_base64: Option<String>,
    #[serde(default)]
    pub limits: LimitOverrides,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompileError,
    Cancelled,
    SystemError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunJobResult {
    pub job_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RunJob {
    pub fn into_submission(self, languages: &LanguageTable) -> Result<Submission, ExecError> {
        let language = languages
            .resolve(&self.language)
            .ok_or_else(|| ExecError::UnsupportedLanguage(self.language.clone()))?;

        let stdin = match (self.stdin_base64, self.stdin) {
            (Some(encoded), _) => Some(
                general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| ExecError::InvalidSubmission(format!("stdin_base64: {}", e)))?,
            ),
            (None, Some(text)) => Some(text.into_bytes()),
            (None, None) => None,
        };

        let mut submission = Submission::new(language, self.source).with_limits(self.limits);
        submission.stdin = stdin;
        Ok(submission)
    }
}

impl RunJobResult {
    pub fn from_outcome(job_id: impl Into<String>, outcome: JobOutcome) -> Self {
        let job_id = job_id.into();
        match outcome {
            JobOutcome::Executed(result) => Self {
                job_id,
                status: if result.cancelled {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Completed
                },
                result: Some(result),
                compile_output: None,
                error_message: None,
            },
            JobOutcome::CompileFailed(err) => Self {
                job_id,
                status: RunStatus::CompileError,
                result: None,
                compile_output: Some(err.diagnostics),
                error_message: None,
            },
        }
    }

    pub fn system_error(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: RunStatus::SystemError,
            result: None,
            compile_output: None,
            error_message: Some(message.into()),
        }
    }
}

/// Process a run job.
///
/// Every non-fatal failure becomes a `system_error` result. `Err` is returned
/// only for an isolation breach; the caller stores the result and stops.
pub async fn process_run_job(
    coordinator: &Coordinator,
    job: RunJob,
    cancel: CancellationToken,
) -> Result<RunJobResult, ExecError> {
    let job_id = job.job_id.clone();
    info!("Processing run job {} ({})", job_id, job.language);

    let submission = match job.into_submission(coordinator.languages()) {
        Ok(submission) => submission,
        Err(e) => {
            warn!("Rejected run job {}: {}", job_id, e);
            return Ok(RunJobResult::system_error(job_id, e.to_string()));
        }
    };

    match coordinator.execute(submission, cancel).await {
        Ok(outcome) => Ok(RunJobResult::from_outcome(job_id, outcome)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => Ok(RunJobResult::system_error(job_id, format!("{:#}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;
    use crate::languages::Language;

    fn job(json: &str) -> RunJob {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_minimal_job_parses() {
        let job = job(r#"{"job_id":"a1","language":"c","source":"int main(){}"}"#);
        assert_eq!(job.job_id, "a1");
        assert!(job.stdin.is_none());
        assert_eq!(job.limits, LimitOverrides::default());
    }

    #[test]
    fn test_into_submission_resolves_alias_and_limits() {
        let table = LanguageTable::embedded().unwrap();
        let submission = job(
            r#"{"job_id":"a2","language":"Py","source":"print(1)","stdin":"5\n","limits":{"cpu_seconds":2}}"#,
        )
        .into_submission(&table)
        .unwrap();

        assert_eq!(submission.language, Language::Python);
        assert_eq!(submission.stdin.as_deref(), Some(&b"5\n"[..]));
        assert_eq!(submission.limits.cpu_seconds, Some(2));
        assert_eq!(submission.limits.memory_bytes, None);
    }

    #[test]
    fn test_base64_stdin_wins() {
        let table = LanguageTable::embedded().unwrap();
        let submission = job(
            r#"{"job_id":"a3","language":"c","source":"","stdin":"text","stdin_base64":"AAH/"}"#,
        )
        .into_submission(&table)
        .unwrap();
        assert_eq!(submission.stdin, Some(vec![0x00, 0x01, 0xff]));
    }

    #[test]
    fn test_bad_base64_is_invalid_submission() {
        let table = LanguageTable::embedded().unwrap();
        let err = job(r#"{"job_id":"a4","language":"c","source":"","stdin_base64":"%%%"}"#)
            .into_submission(&table)
            .unwrap_err();
        assert!(matches!(err, ExecError::InvalidSubmission(_)));
    }

    #[test]
    fn test_unknown_language() {
        let table = LanguageTable::embedded().unwrap();
        let err = job(r#"{"job_id":"a5","language":"cobol","source":""}"#)
            .into_submission(&table)
            .unwrap_err();
        assert!(matches!(err, ExecError::UnsupportedLanguage(ref name) if name == "cobol"));
    }

    #[test]
    fn test_result_status_mapping() {
        let compile = RunJobResult::from_outcome(
            "b1",
            JobOutcome::CompileFailed(CompileError::new("main.c:1: error")),
        );
        assert_eq!(compile.status, RunStatus::CompileError);
        assert_eq!(compile.compile_output.as_deref(), Some("main.c:1: error"));

        let cancelled = RunJobResult::from_outcome(
            "b2",
            JobOutcome::Executed(ExecutionResult {
                exit_code: -1,
                cancelled: true,
                ..Default::default()
            }),
        );
        assert_eq!(cancelled.status, RunStatus::Cancelled);

        let json = serde_json::to_value(RunJobResult::system_error("b3", "boom")).unwrap();
        assert_eq!(json["status"], "system_error");
        assert_eq!(json["error_message"], "boom");
        assert!(json.get("result").is_none());
    }
}
